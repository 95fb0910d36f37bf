// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Registry access.
//!
//! Everything that talks to a remote registry goes through [`RegistryClient`],
//! implemented over `oci-client` by [`OciRegistry`].
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use crate::digest::Digest;
use crate::reference::ImageReference;

pub mod auth;
#[cfg(test)]
pub mod memory;
mod oci;

pub use oci::OciRegistry;

pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

pub const HELM_CONFIG_MEDIA_TYPE: &str = "application/vnd.cncf.helm.config.v1+json";
pub const HELM_CONTENT_MEDIA_TYPE: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

/// Media types accepted when fetching manifests.
pub const MANIFEST_MEDIA_TYPES: [&str; 4] = [
    OCI_IMAGE_MANIFEST,
    OCI_IMAGE_INDEX,
    DOCKER_MANIFEST,
    DOCKER_MANIFEST_LIST,
];

pub fn is_index(media_type: &str) -> bool {
    media_type == OCI_IMAGE_INDEX || media_type == DOCKER_MANIFEST_LIST
}

pub fn is_image_manifest(media_type: &str) -> bool {
    media_type == OCI_IMAGE_MANIFEST || media_type == DOCKER_MANIFEST
}

/// A manifest exactly as the registry served it.
#[derive(Debug, Clone)]
pub struct RawManifest {
    pub bytes: Vec<u8>,
    pub digest: Digest,
    pub media_type: String,
}

impl RawManifest {
    /// Wrap `bytes`, reading the media type from the document itself.
    pub fn new(bytes: Vec<u8>, digest: Digest) -> Self {
        let media_type = sniff_media_type(&bytes);
        Self {
            bytes,
            digest,
            media_type,
        }
    }
}

/// The `mediaType` field of a manifest, guessed from its shape when absent.
pub fn sniff_media_type(bytes: &[u8]) -> String {
    let value: serde_json::Value = serde_json::from_slice(bytes).unwrap_or_default();
    if let Some(media_type) = value.get("mediaType").and_then(|m| m.as_str()) {
        return media_type.to_string();
    }
    if value.get("manifests").is_some() {
        OCI_IMAGE_INDEX.to_string()
    } else if value.get("config").is_some() {
        OCI_IMAGE_MANIFEST.to_string()
    } else {
        String::new()
    }
}

/// The registry verbs the pipelines need.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch the manifest `reference` points to.
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<RawManifest>;

    /// Digest of the manifest `reference` points to.
    async fn resolve_digest(&self, reference: &ImageReference) -> Result<Digest>;

    /// Download blob `digest` of the repository of `reference` into `dest`.
    async fn pull_blob(&self, reference: &ImageReference, digest: &Digest, dest: &Path)
        -> Result<()>;

    /// Upload a blob. Uploading content the repository holds already is harmless.
    async fn push_blob(&self, reference: &ImageReference, digest: &Digest, data: Vec<u8>)
        -> Result<()>;

    /// Upload a manifest verbatim under the tag or digest of `reference`.
    async fn push_manifest(
        &self,
        reference: &ImageReference,
        bytes: Vec<u8>,
        media_type: &str,
    ) -> Result<Digest>;

    /// Tags of the repository of `reference`.
    async fn list_tags(&self, reference: &ImageReference) -> Result<Vec<String>>;
}

/// How to reach registries.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Accept invalid TLS certificates.
    pub insecure: bool,
    /// Talk plain HTTP.
    pub plain_http: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}
