// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Wrap a Helm chart and every image it deploys into a single archive, and
//! unwrap such an archive into another OCI registry.
//!
//! The pipelines in [`wrap`] and [`unwrap`] are built from:
//!
//! - [`resolver`] and [`lock`]: pin chart images to per-platform digests in
//!   `Images.lock`.
//! - [`transport`]: move images and their metadata/signature artifacts
//!   between registries and local OCI layouts.
//! - [`relocate`]: rewrite every image reference of a chart for a new registry.
//! - [`archive`]: deterministic gzipped tarballs.
//!
//! Registry access goes through [`registry::RegistryClient`]; per-command
//! state (cancellation, retries, reporting) lives in [`Session`].
pub mod archive;
pub mod carvel;
pub mod chart;
pub mod digest;
pub mod error;
pub mod info;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod relocate;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod session;
mod sha256_writer;
pub mod transport;
pub mod unwrap;
pub mod workdir;
pub mod wrap;
pub mod write;

pub use digest::{Digest, PlatformDigest};
pub use error::{Error, ErrorList, LoggedError};
pub use lock::ImagesLock;
pub use reference::ImageReference;
pub use session::Session;
