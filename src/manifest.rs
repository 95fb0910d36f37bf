// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! OCI and Docker manifest documents, read and built with `oci_spec`.
//!
//! Manifests are always stored and pushed as the raw bytes the registry
//! served; the types here are for looking inside them and for building the
//! few documents we author ourselves (indexes, chart manifests).
use std::collections::HashMap;

use anyhow::{Context, Result};
pub use ocidir::oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageIndex, ImageIndexBuilder, ImageManifest,
    ImageManifestBuilder, MediaType, Platform, SCHEMA_VERSION,
};

use crate::digest::{platform_string, Digest};

/// Annotation marking buildkit attestation entries of an index.
pub const REFERENCE_TYPE_ANNOTATION: &str = "vnd.docker.reference.type";
pub const ATTESTATION_MANIFEST: &str = "attestation-manifest";

pub fn parse_index(bytes: &[u8]) -> Result<ImageIndex> {
    serde_json::from_slice(bytes).context("Failed to parse image index")
}

pub fn parse_manifest(bytes: &[u8]) -> Result<ImageManifest> {
    serde_json::from_slice(bytes).context("Failed to parse image manifest")
}

/// The platform an image configuration declares, if it names both an os and
/// an architecture.
pub fn config_platform(config: &[u8]) -> Option<Platform> {
    let platform: Platform = serde_json::from_slice(config).ok()?;
    let named = !platform.os().to_string().is_empty()
        && !platform.architecture().to_string().is_empty();
    named.then_some(platform)
}

/// `os/arch[/variant]`
pub fn platform_name(platform: &Platform) -> String {
    platform_string(
        &platform.os().to_string(),
        &platform.architecture().to_string(),
        platform.variant().as_deref(),
    )
}

pub fn is_attestation(entry: &Descriptor) -> bool {
    entry
        .annotations()
        .as_ref()
        .and_then(|a| a.get(REFERENCE_TYPE_ANNOTATION))
        .is_some_and(|t| t == ATTESTATION_MANIFEST)
}

/// Platform of an index entry as `os/arch[/variant]`.
pub fn entry_platform(entry: &Descriptor) -> Option<String> {
    entry.platform().as_ref().map(platform_name)
}

pub fn descriptor_digest(descriptor: &Descriptor) -> Result<Digest> {
    Ok(descriptor.digest().parse()?)
}

/// Config followed by layers.
pub fn blobs(manifest: &ImageManifest) -> impl Iterator<Item = &Descriptor> {
    std::iter::once(manifest.config()).chain(manifest.layers().iter())
}

/// Descriptor of `size` bytes of `media_type` content.
pub fn descriptor(media_type: &str, digest: &Digest, size: usize) -> Result<DescriptorBuilder> {
    Ok(DescriptorBuilder::default()
        .media_type(MediaType::from(media_type))
        .digest(digest.to_string())
        .size(i64::try_from(size)?))
}

/// Descriptor of a platform image for an index.
pub fn platform_descriptor(
    media_type: &str,
    digest: &Digest,
    size: usize,
    platform: Platform,
) -> Result<Descriptor> {
    Ok(descriptor(media_type, digest, size)?.platform(platform).build()?)
}

/// Descriptor carrying annotations, e.g. a layout `ref.name`.
pub fn annotated_descriptor(
    media_type: &str,
    digest: &Digest,
    size: usize,
    annotations: HashMap<String, String>,
) -> Result<Descriptor> {
    Ok(descriptor(media_type, digest, size)?
        .annotations(annotations)
        .build()?)
}

pub fn new_index(manifests: Vec<Descriptor>) -> Result<ImageIndex> {
    Ok(ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageIndex)
        .manifests(manifests)
        .build()?)
}

/// Serialized image manifest over `config` and `layers`.
pub fn manifest_bytes(config: Descriptor, layers: Vec<Descriptor>) -> Result<Vec<u8>> {
    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config)
        .layers(layers)
        .build()?;
    Ok(serde_json::to_vec(&manifest)?)
}
