// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Turn an image reference into the per-platform digests backing it.
use anyhow::Result;

use crate::digest::{filter_platforms, PlatformDigest};
use crate::error::Error;
use crate::manifest::{
    config_platform, descriptor_digest, entry_platform, is_attestation, parse_index,
    parse_manifest, platform_name,
};
use crate::reference::ImageReference;
use crate::registry::{is_image_manifest, is_index, RegistryClient};

/// Resolve `reference` to its `(platform, digest)` pairs.
///
/// Attestation entries of an index are skipped. When `platforms` is not empty
/// only those platforms are kept, and keeping none is an error.
pub async fn resolve(
    registry: &dyn RegistryClient,
    reference: &ImageReference,
    platforms: &[String],
) -> Result<Vec<PlatformDigest>> {
    let manifest = registry.fetch_manifest(reference).await?;
    let digests = if is_index(&manifest.media_type) {
        let index = parse_index(&manifest.bytes)?;
        let mut digests = Vec::with_capacity(index.manifests().len());
        for entry in index.manifests().iter().filter(|e| !is_attestation(e)) {
            let arch = entry_platform(entry).ok_or_else(|| {
                Error::MissingPlatform(format!("{}@{}", reference.canonical_name(), entry.digest()))
            })?;
            digests.push(PlatformDigest::new(arch, descriptor_digest(entry)?));
        }
        digests
    } else if is_image_manifest(&manifest.media_type) {
        let image = parse_manifest(&manifest.bytes)?;
        let config_digest = descriptor_digest(image.config())?;
        let config = fetch_blob(registry, reference, &config_digest).await?;
        let arch = config_platform(&config)
            .map(|p| platform_name(&p))
            .ok_or_else(|| Error::MissingPlatform(reference.to_string()))?;
        vec![PlatformDigest::new(arch, manifest.digest)]
    } else {
        return Err(Error::UnsupportedMediaType {
            reference: reference.to_string(),
            media_type: manifest.media_type,
        }
        .into());
    };

    let filtered = filter_platforms(digests, platforms);
    if filtered.is_empty() && !platforms.is_empty() {
        return Err(Error::EmptyPlatformsAfterFilter {
            reference: reference.to_string(),
            filter: platforms.join(", "),
        }
        .into());
    }
    Ok(filtered)
}

/// Download a (small) blob into memory.
pub async fn fetch_blob(
    registry: &dyn RegistryClient,
    reference: &ImageReference,
    digest: &crate::digest::Digest,
) -> Result<Vec<u8>> {
    let file = tempfile::NamedTempFile::new()?;
    registry.pull_blob(reference, digest, file.path()).await?;
    Ok(std::fs::read(file.path())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;

    fn reference(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    fn multi_arch(registry: &MemoryRegistry) -> (PlatformDigest, PlatformDigest) {
        let name = "example.test/app";
        let amd = registry.put_image(name, Some(("linux", "amd64")), b"amd");
        let arm = registry.put_image(name, Some(("linux", "arm64")), b"arm");
        let index = registry.put_index(name, &[("linux/amd64", &amd), ("linux/arm64", &arm)]);
        registry.tag(name, "1.0", &index.digest);
        (
            PlatformDigest::new("linux/amd64", amd.digest),
            PlatformDigest::new("linux/arm64", arm.digest),
        )
    }

    #[tokio::test]
    async fn index_skips_attestations() {
        let registry = MemoryRegistry::new();
        let (amd, arm) = multi_arch(&registry);
        let digests = resolve(&registry, &reference("example.test/app:1.0"), &[])
            .await
            .unwrap();
        assert_eq!(digests, vec![amd, arm]);
    }

    #[tokio::test]
    async fn filter_narrows_platforms() {
        let registry = MemoryRegistry::new();
        let (_, arm) = multi_arch(&registry);
        let digests = resolve(
            &registry,
            &reference("example.test/app:1.0"),
            &["linux/arm64".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(digests, vec![arm]);

        let err = resolve(
            &registry,
            &reference("example.test/app:1.0"),
            &["windows/amd64".to_string()],
        )
        .await
        .unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(Error::EmptyPlatformsAfterFilter { .. })
        ));
    }

    #[tokio::test]
    async fn single_arch_reads_the_config() {
        let registry = MemoryRegistry::new();
        let image = registry.put_image("example.test/single", Some(("linux", "amd64")), b"x");
        registry.tag("example.test/single", "2", &image.digest);
        let digests = resolve(&registry, &reference("example.test/single:2"), &[])
            .await
            .unwrap();
        assert_eq!(digests, vec![PlatformDigest::new("linux/amd64", image.digest)]);
    }

    #[tokio::test]
    async fn missing_platform_fails_fast() {
        let registry = MemoryRegistry::new();
        let image = registry.put_image("example.test/bare", None, b"x");
        registry.tag("example.test/bare", "1", &image.digest);
        let err = resolve(&registry, &reference("example.test/bare:1"), &[])
            .await
            .unwrap_err();
        assert!(!crate::error::is_retryable(&err));
    }

    #[tokio::test]
    async fn unknown_media_type_is_rejected() {
        let registry = MemoryRegistry::new();
        let m = registry.put_manifest(
            "example.test/odd",
            br#"{"mediaType":"application/vnd.example.thing","schemaVersion":2}"#.to_vec(),
        );
        registry.tag("example.test/odd", "1", &m.digest);
        let err = resolve(&registry, &reference("example.test/odd:1"), &[])
            .await
            .unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(Error::UnsupportedMediaType { .. })
        ));
    }
}
