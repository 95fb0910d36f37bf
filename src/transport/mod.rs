// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Moving images and artifacts between registries and local OCI layouts.
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::layout::Layout;
use crate::manifest::{blobs, descriptor_digest, parse_index, parse_manifest};
use crate::reference::ImageReference;
use crate::registry::{is_image_manifest, is_index, RawManifest};
use crate::session::Session;

pub mod artifacts;
pub mod images;

pub use images::{pull_images, push_images};

/// Where pulled or pushed artifacts live, and whether to move them at all.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Transfer metadata and signature artifacts next to each image.
    pub fetch_artifacts: bool,
    /// Root of the local artifacts tree (`<wrap>/artifacts`).
    pub artifacts_dir: Option<PathBuf>,
}

/// Store `manifest` (served for `reference`) and everything it points to in `layout`.
pub(crate) async fn copy_to_layout(
    session: &Session,
    reference: &ImageReference,
    manifest: &RawManifest,
    layout: &Layout,
    ref_name: Option<&str>,
) -> Result<()> {
    store_manifest_content(session, reference, manifest, layout).await?;
    layout.set_manifest(manifest, ref_name)
}

async fn store_manifest_content(
    session: &Session,
    reference: &ImageReference,
    manifest: &RawManifest,
    layout: &Layout,
) -> Result<()> {
    if !is_index(&manifest.media_type) {
        return store_image_blobs(session, reference, manifest, layout).await;
    }
    let registry = session.registry.as_ref();
    for entry in parse_index(&manifest.bytes)?.manifests() {
        session.check_cancelled()?;
        let child_ref = reference.with_digest(&descriptor_digest(entry)?);
        let child_ref = &child_ref;
        let child = session
            .retry("fetching manifest", move || registry.fetch_manifest(child_ref))
            .await?;
        if !is_image_manifest(&child.media_type) {
            bail!("nested index {} in {}", child.digest, reference);
        }
        store_image_blobs(session, child_ref, &child, layout).await?;
        layout.write_blob(&child.digest, &child.bytes)?;
    }
    Ok(())
}

async fn store_image_blobs(
    session: &Session,
    reference: &ImageReference,
    manifest: &RawManifest,
    layout: &Layout,
) -> Result<()> {
    let registry = session.registry.as_ref();
    let image = parse_manifest(&manifest.bytes)?;
    for blob in blobs(&image) {
        session.check_cancelled()?;
        let digest = descriptor_digest(blob)?;
        if layout.has_blob(&digest) {
            continue;
        }
        let digest = &digest;
        let staged = session
            .retry("pulling blob", move || async move {
                let file = layout.staging_file()?;
                registry.pull_blob(reference, digest, file.path()).await?;
                Ok::<_, anyhow::Error>(file)
            })
            .await
            .context(format!("Failed to pull blob {}", digest))?;
        layout.import_blob(digest, staged)?;
    }
    Ok(())
}

/// Upload `manifest` from `layout`, with everything it points to, as `target`.
pub(crate) async fn push_from_layout(
    session: &Session,
    layout: &Layout,
    manifest: &RawManifest,
    target: &ImageReference,
) -> Result<crate::digest::Digest> {
    push_content(session, layout, manifest, target).await?;
    let registry = session.registry.as_ref();
    session
        .retry("pushing manifest", move || {
            registry.push_manifest(target, manifest.bytes.clone(), &manifest.media_type)
        })
        .await
        .context(format!("Failed to push manifest to {}", target))
}

async fn push_content(
    session: &Session,
    layout: &Layout,
    manifest: &RawManifest,
    target: &ImageReference,
) -> Result<()> {
    let registry = session.registry.as_ref();
    if is_index(&manifest.media_type) {
        for entry in parse_index(&manifest.bytes)?.manifests() {
            session.check_cancelled()?;
            let digest = descriptor_digest(entry)?;
            let mut child = RawManifest::new(layout.read_blob(&digest)?, digest);
            child.media_type = entry.media_type().to_string();
            if !is_image_manifest(&child.media_type) {
                bail!("nested index {} in `{}`", child.digest, layout.root().display());
            }
            push_content_image(session, layout, &child, target).await?;
            let child_ref = target.with_digest(&child.digest);
            let (child, child_ref) = (&child, &child_ref);
            session
                .retry("pushing manifest", move || {
                    registry.push_manifest(child_ref, child.bytes.clone(), &child.media_type)
                })
                .await?;
        }
        return Ok(());
    }
    push_content_image(session, layout, manifest, target).await
}

async fn push_content_image(
    session: &Session,
    layout: &Layout,
    manifest: &RawManifest,
    target: &ImageReference,
) -> Result<()> {
    let registry = session.registry.as_ref();
    let image = parse_manifest(&manifest.bytes)?;
    for blob in blobs(&image) {
        session.check_cancelled()?;
        let digest = descriptor_digest(blob)?;
        let data = layout.read_blob(&digest)?;
        let (digest, data) = (&digest, &data);
        session
            .retry("pushing blob", move || registry.push_blob(target, digest, data.clone()))
            .await
            .context(format!("Failed to push blob {}", digest))?;
    }
    Ok(())
}
