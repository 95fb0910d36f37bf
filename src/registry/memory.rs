// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! In-memory registry used by the unit tests.
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{RawManifest, RegistryClient, OCI_IMAGE_MANIFEST};
use crate::digest::Digest;
use crate::manifest::{descriptor, manifest_bytes, new_index, Platform};
use crate::reference::ImageReference;

const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const OCI_IMAGE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

#[derive(Default)]
struct State {
    manifests: HashMap<(String, Digest), RawManifest>,
    tags: BTreeMap<(String, String), Digest>,
    blobs: HashMap<(String, Digest), Vec<u8>>,
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
    failures: AtomicU32,
    push_failures: AtomicU32,
    cancel_on_failure: Mutex<Option<CancellationToken>>,
    pub fetches: AtomicU32,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` manifest fetches fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` manifest pushes fail with a transient error.
    pub fn fail_next_push(&self, n: u32) {
        self.push_failures.store(n, Ordering::SeqCst);
    }

    /// Trip `token` whenever an injected failure fires, like a connection
    /// dropped by an interrupt.
    pub fn cancel_on_failure(&self, token: CancellationToken) {
        *self.cancel_on_failure.lock() = Some(token);
    }

    fn injected_failure(&self, counter: &AtomicU32) -> Result<()> {
        if counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            if let Some(token) = self.cancel_on_failure.lock().as_ref() {
                token.cancel();
            }
            return Err(anyhow!("connection reset by peer"));
        }
        Ok(())
    }

    pub fn put_blob(&self, name: &str, data: &[u8]) -> Digest {
        let digest = Digest::of(data);
        self.state
            .lock()
            .blobs
            .insert((name.to_string(), digest.clone()), data.to_vec());
        digest
    }

    pub fn put_manifest(&self, name: &str, bytes: Vec<u8>) -> RawManifest {
        let manifest = RawManifest::new(bytes.clone(), Digest::of(&bytes));
        self.state
            .lock()
            .manifests
            .insert((name.to_string(), manifest.digest.clone()), manifest.clone());
        manifest
    }

    pub fn tag(&self, name: &str, tag: &str, digest: &Digest) {
        self.state
            .lock()
            .tags
            .insert((name.to_string(), tag.to_string()), digest.clone());
    }

    /// Store a single-platform image under repository `name` (`host/repo`).
    pub fn put_image(&self, name: &str, platform: Option<(&str, &str)>, layer: &[u8]) -> RawManifest {
        let config = match platform {
            Some((os, arch)) => json!({ "os": os, "architecture": arch, "rootfs": { "type": "layers", "diff_ids": [] } }),
            None => json!({ "rootfs": { "type": "layers", "diff_ids": [] } }),
        };
        let config = serde_json::to_vec(&config).unwrap();
        let config_digest = self.put_blob(name, &config);
        let layer_digest = self.put_blob(name, layer);
        let manifest = manifest_bytes(
            descriptor(OCI_IMAGE_CONFIG, &config_digest, config.len())
                .unwrap()
                .build()
                .unwrap(),
            vec![descriptor(OCI_IMAGE_LAYER, &layer_digest, layer.len())
                .unwrap()
                .build()
                .unwrap()],
        )
        .unwrap();
        self.put_manifest(name, manifest)
    }

    /// Store an index over `entries` (`(platform, manifest)`) plus one attestation entry.
    pub fn put_index(&self, name: &str, entries: &[(&str, &RawManifest)]) -> RawManifest {
        let mut manifests: Vec<_> = entries
            .iter()
            .map(|(platform, m)| {
                descriptor(&m.media_type, &m.digest, m.bytes.len())
                    .unwrap()
                    .platform(platform_of(platform))
                    .build()
                    .unwrap()
            })
            .collect();
        if let Some((_, first)) = entries.first() {
            let annotations = [
                ("vnd.docker.reference.type", "attestation-manifest".to_string()),
                ("vnd.docker.reference.digest", first.digest.to_string()),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<HashMap<_, _>>();
            manifests.push(
                descriptor(OCI_IMAGE_MANIFEST, &Digest::of(b"attestation"), 10)
                    .unwrap()
                    .platform(platform_of("unknown/unknown"))
                    .annotations(annotations)
                    .build()
                    .unwrap(),
            );
        }
        let index = serde_json::to_vec(&new_index(manifests).unwrap()).unwrap();
        self.put_manifest(name, index)
    }

    pub fn manifest(&self, name: &str, digest: &Digest) -> Option<RawManifest> {
        self.state
            .lock()
            .manifests
            .get(&(name.to_string(), digest.clone()))
            .cloned()
    }

    pub fn tagged(&self, name: &str, tag: &str) -> Option<Digest> {
        self.state
            .lock()
            .tags
            .get(&(name.to_string(), tag.to_string()))
            .cloned()
    }

    pub fn has_blob(&self, name: &str, digest: &Digest) -> bool {
        self.state
            .lock()
            .blobs
            .contains_key(&(name.to_string(), digest.clone()))
    }

    fn lookup(&self, reference: &ImageReference) -> Result<RawManifest> {
        let name = reference.canonical_name();
        let state = self.state.lock();
        let digest = match reference.digest() {
            Some(digest) => digest.clone(),
            None => state
                .tags
                .get(&(name.clone(), reference.tag().unwrap_or_default().to_string()))
                .cloned()
                .ok_or_else(|| anyhow!("manifest unknown: {}", reference))?,
        };
        state
            .manifests
            .get(&(name, digest))
            .cloned()
            .ok_or_else(|| anyhow!("manifest unknown: {}", reference))
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<RawManifest> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.injected_failure(&self.failures)?;
        self.lookup(reference)
    }

    async fn resolve_digest(&self, reference: &ImageReference) -> Result<Digest> {
        Ok(self.lookup(reference)?.digest)
    }

    async fn pull_blob(&self, reference: &ImageReference, digest: &Digest, dest: &Path) -> Result<()> {
        let data = self
            .state
            .lock()
            .blobs
            .get(&(reference.canonical_name(), digest.clone()))
            .cloned()
            .ok_or_else(|| anyhow!("blob unknown: {}", digest))?;
        std::fs::write(dest, data)?;
        Ok(())
    }

    async fn push_blob(&self, reference: &ImageReference, digest: &Digest, data: Vec<u8>) -> Result<()> {
        if &Digest::of(&data) != digest {
            return Err(anyhow!("digest mismatch for blob {}", digest));
        }
        self.state
            .lock()
            .blobs
            .insert((reference.canonical_name(), digest.clone()), data);
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        bytes: Vec<u8>,
        media_type: &str,
    ) -> Result<Digest> {
        self.injected_failure(&self.push_failures)?;
        let name = reference.canonical_name();
        let digest = Digest::of(&bytes);
        let manifest = RawManifest {
            bytes,
            digest: digest.clone(),
            media_type: media_type.to_string(),
        };
        let mut state = self.state.lock();
        state.manifests.insert((name.clone(), digest.clone()), manifest);
        if let ImageReference::Tag { tag, .. } = reference {
            state.tags.insert((name, tag.clone()), digest.clone());
        }
        Ok(digest)
    }

    async fn list_tags(&self, reference: &ImageReference) -> Result<Vec<String>> {
        let name = reference.canonical_name();
        Ok(self
            .state
            .lock()
            .tags
            .keys()
            .filter(|(n, _)| n == &name)
            .map(|(_, t)| t.clone())
            .collect())
    }
}

/// `os/arch` as a platform.
fn platform_of(platform: &str) -> Platform {
    let (os, arch) = platform.split_once('/').unwrap();
    serde_json::from_value(json!({ "os": os, "architecture": arch })).unwrap()
}
