// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Pull the images of a lock into `<HEX>.layout` directories and push them back
//! as multi-platform indexes.
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use super::artifacts;
use super::{copy_to_layout, push_from_layout, TransportOptions};
use crate::digest::{Digest, PlatformDigest};
use crate::error::{Error, ErrorList};
use crate::layout::{image_layout_dir, Layout};
use crate::lock::{ChartImage, ImagesLock};
use crate::manifest::{
    config_platform, descriptor_digest, entry_platform, new_index, parse_index, parse_manifest,
    platform_descriptor, Descriptor, Platform,
};
use crate::reference::ImageReference;
use crate::registry::{is_image_manifest, is_index, RawManifest, OCI_IMAGE_INDEX};
use crate::session::Session;

/// Pull every `(image, platform)` of `lock` into `images_dir`.
///
/// All platforms of an image are pulled before the next image. Failures of
/// different images are reported together. Cancellation stops at once and
/// reports the failures gathered until then, if any.
pub async fn pull_images(
    session: &Session,
    lock: &ImagesLock,
    images_dir: &Path,
    options: &TransportOptions,
) -> Result<()> {
    std::fs::create_dir_all(images_dir)
        .context(format!("Failed to create `{}`", images_dir.display()))?;
    let progress = session
        .reporter()
        .progress(lock.digest_count() as u64, "Pulling images");
    let mut errors = Vec::new();
    for image in &lock.images {
        if let Err(cancelled) = session.check_cancelled() {
            return Err(ErrorList::gathered_or(errors, cancelled));
        }
        progress.set_message(image.image.clone());
        let pulled = pull_image(session, image, images_dir, |_| progress.inc(1)).await;
        match pulled {
            Err(e) if is_cancelled(&e) => return Err(ErrorList::gathered_or(errors, e)),
            Err(e) => {
                errors.push(e);
                continue;
            }
            Ok(()) => {}
        }
        if options.fetch_artifacts {
            if let Some(root) = &options.artifacts_dir {
                if let Err(e) = artifacts::pull_image_artifacts(session, image, root).await {
                    errors.push(e);
                }
            }
        }
    }
    progress.finish();
    ErrorList::join(errors)
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(crate::error::kind_of(err), Some(Error::Cancelled))
}

async fn pull_image(
    session: &Session,
    image: &ChartImage,
    images_dir: &Path,
    on_pulled: impl Fn(&PlatformDigest),
) -> Result<()> {
    let reference = ImageReference::parse(&image.image)?;
    for digest in &image.digests {
        session.check_cancelled()?;
        let dir = image_layout_dir(images_dir, &digest.digest);
        let (reference, dir) = (&reference, &dir);
        session
            .retry("pulling image", move || pull_platform(session, reference, digest, dir))
            .await
            .context(format!("Failed to pull {} ({})", image.image, digest.arch))?;
        tracing::debug!(image = %image.image, arch = %digest.arch, "Pulled image");
        on_pulled(digest);
    }
    Ok(())
}

/// Pull one platform image into a fresh layout at `dir`.
async fn pull_platform(
    session: &Session,
    reference: &ImageReference,
    digest: &PlatformDigest,
    dir: &Path,
) -> Result<()> {
    let by_digest = reference.with_digest(&digest.digest);
    let mut manifest = session.registry.fetch_manifest(&by_digest).await?;
    if is_index(&manifest.media_type) {
        // lock digests normally name platform manifests already
        let index = parse_index(&manifest.bytes)?;
        let entry = index
            .manifests()
            .iter()
            .find(|e| entry_platform(e).as_deref() == Some(digest.arch.as_str()))
            .ok_or_else(|| Error::MissingPlatform(format!("{} ({})", by_digest, digest.arch)))?;
        manifest = session
            .registry
            .fetch_manifest(&reference.with_digest(&descriptor_digest(entry)?))
            .await?;
    }
    if !is_image_manifest(&manifest.media_type) {
        return Err(Error::UnsupportedMediaType {
            reference: by_digest.to_string(),
            media_type: manifest.media_type,
        }
        .into());
    }
    let layout = Layout::create(dir)?;
    copy_to_layout(session, &by_digest, &manifest, &layout, None).await
}

/// Push every image of `lock` from `images_dir`, rebuilding its index.
pub async fn push_images(
    session: &Session,
    lock: &ImagesLock,
    images_dir: &Path,
    options: &TransportOptions,
) -> Result<()> {
    let progress = session
        .reporter()
        .progress(lock.images.len() as u64, "Pushing images");
    let mut errors = Vec::new();
    for image in &lock.images {
        if let Err(cancelled) = session.check_cancelled() {
            return Err(ErrorList::gathered_or(errors, cancelled));
        }
        progress.set_message(image.image.clone());
        let pushed = push_image(session, image, images_dir)
            .await
            .context(format!("Failed to push {}", image.image));
        progress.inc(1);
        let digest = match pushed {
            Ok(digest) => digest,
            Err(e) if is_cancelled(&e) => return Err(ErrorList::gathered_or(errors, e)),
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        if let Some(root) = &options.artifacts_dir {
            if let Err(e) = artifacts::push_image_artifacts(session, image, &digest, root).await {
                errors.push(e);
            }
        }
    }
    progress.finish();
    ErrorList::join(errors)
}

/// Push the platform images of `image` and the index tying them together.
/// Returns the digest `image` now resolves to.
async fn push_image(session: &Session, image: &ChartImage, images_dir: &Path) -> Result<Digest> {
    let reference = ImageReference::parse(&image.image)?;
    let mut manifests = Vec::with_capacity(image.digests.len());
    for digest in &image.digests {
        session.check_cancelled()?;
        let layout = Layout::open(image_layout_dir(images_dir, &digest.digest))?;
        let manifest = layout.single_image()?;
        let platform = platform_of(&layout, &manifest)?;
        push_from_layout(session, &layout, &manifest, &reference.with_digest(&manifest.digest))
            .await?;
        manifests.push(index_entry(&manifest, platform)?);
    }

    // a digest reference to a single platform image is complete already
    if let Some(pinned) = reference.digest() {
        if image.digests.iter().any(|d| &d.digest == pinned) {
            return Ok(pinned.clone());
        }
    }

    let index = serde_json::to_vec(&new_index(manifests)?)?;
    let index_digest = Digest::of(&index);
    let target = match &reference {
        ImageReference::Tag { .. } => reference.clone(),
        ImageReference::Digest { tag: Some(tag), .. } => reference.with_tag(tag.clone()),
        ImageReference::Digest { .. } => reference.with_digest(&index_digest),
    };
    if let Some(pinned) = reference.digest().filter(|d| *d != &index_digest) {
        session.reporter().warn(&format!(
            "rebuilt index of {} has digest {}, the reference pins {}",
            image.image, index_digest, pinned
        ));
    }
    let registry = session.registry.as_ref();
    let (target, index) = (&target, &index);
    session
        .retry("pushing index", move || {
            registry.push_manifest(target, index.clone(), OCI_IMAGE_INDEX)
        })
        .await
        .context(format!("Failed to push index to {}", target))
}

/// Platform of the image in `layout`, read from its config.
fn platform_of(layout: &Layout, manifest: &RawManifest) -> Result<Platform> {
    let image = parse_manifest(&manifest.bytes)?;
    let config = layout.read_blob(&descriptor_digest(image.config())?)?;
    config_platform(&config)
        .ok_or_else(|| anyhow!(Error::MissingPlatform(layout.root().display().to_string())))
}

fn index_entry(manifest: &RawManifest, mut platform: Platform) -> Result<Descriptor> {
    if platform.variant().as_deref() == Some("") {
        platform.set_variant(None);
    }
    platform_descriptor(&manifest.media_type, &manifest.digest, manifest.bytes.len(), platform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{generate, LockOptions};
    use crate::chart::testutil::write_chart;
    use crate::registry::memory::MemoryRegistry;
    use crate::resolver::resolve;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn demo_lock(registry: &Arc<MemoryRegistry>) -> (tempfile::TempDir, ImagesLock) {
        let name = "example.test/app";
        let amd = registry.put_image(name, Some(("linux", "amd64")), b"amd");
        let arm = registry.put_image(name, Some(("linux", "arm64")), b"arm");
        let index = registry.put_index(name, &[("linux/amd64", &amd), ("linux/arm64", &arm)]);
        registry.tag(name, "1.0", &index.digest);
        let dir = tempfile::tempdir().unwrap();
        write_chart(
            &dir.path().join("chart"),
            "demo",
            Some("- name: app\n  image: example.test/app:1.0"),
            "",
        );
        let session = Session::new(registry.clone());
        let lock = generate(&session, &dir.path().join("chart"), &LockOptions::default())
            .await
            .unwrap();
        (dir, lock)
    }

    /// `example.test/app:1.0` (two platforms) and `example.test/db:2.0` (one).
    async fn two_image_lock(registry: &Arc<MemoryRegistry>) -> (tempfile::TempDir, ImagesLock) {
        let app = "example.test/app";
        let amd = registry.put_image(app, Some(("linux", "amd64")), b"amd");
        let arm = registry.put_image(app, Some(("linux", "arm64")), b"arm");
        let index = registry.put_index(app, &[("linux/amd64", &amd), ("linux/arm64", &arm)]);
        registry.tag(app, "1.0", &index.digest);
        let db = registry.put_image("example.test/db", Some(("linux", "amd64")), b"db");
        registry.tag("example.test/db", "2.0", &db.digest);
        let dir = tempfile::tempdir().unwrap();
        write_chart(
            &dir.path().join("chart"),
            "demo",
            Some("- name: app\n  image: example.test/app:1.0\n- name: db\n  image: example.test/db:2.0"),
            "",
        );
        let session = Session::new(registry.clone());
        let lock = generate(&session, &dir.path().join("chart"), &LockOptions::default())
            .await
            .unwrap();
        assert_eq!(lock.images.len(), 2);
        (dir, lock)
    }

    #[tokio::test]
    async fn pull_then_push_keeps_platform_digests() {
        let source = Arc::new(MemoryRegistry::new());
        let (dir, lock) = demo_lock(&source).await;
        let images_dir = dir.path().join("images");

        pull_images(&Session::new(source.clone()), &lock, &images_dir, &TransportOptions::default())
            .await
            .unwrap();
        for digest in &lock.images[0].digests {
            let layout = Layout::open(image_layout_dir(&images_dir, &digest.digest)).unwrap();
            assert_eq!(layout.single_image().unwrap().digest, digest.digest);
        }

        // relocate the lock by hand and push into an empty registry
        let mut relocated = lock.clone();
        relocated.images[0].image = "new.example/proj/app:1.0".into();
        let target = Arc::new(MemoryRegistry::new());
        let session = Session::new(target.clone());
        push_images(&session, &relocated, &images_dir, &TransportOptions::default())
            .await
            .unwrap();

        let pushed = resolve(
            target.as_ref(),
            &ImageReference::parse("new.example/proj/app:1.0").unwrap(),
            &[],
        )
        .await
        .unwrap();
        assert_eq!(pushed, lock.images[0].digests);
    }

    #[tokio::test]
    async fn pulling_twice_replaces_layouts() {
        let source = Arc::new(MemoryRegistry::new());
        let (dir, lock) = demo_lock(&source).await;
        let images_dir = dir.path().join("images");
        let session = Session::new(source.clone());
        pull_images(&session, &lock, &images_dir, &TransportOptions::default())
            .await
            .unwrap();
        let first = image_layout_dir(&images_dir, &lock.images[0].digests[0].digest);
        std::fs::write(first.join("stray"), b"x").unwrap();
        pull_images(&session, &lock, &images_dir, &TransportOptions::default())
            .await
            .unwrap();
        assert!(!first.join("stray").exists());
    }

    #[tokio::test]
    async fn empty_lock_is_trivial() {
        let registry = Arc::new(MemoryRegistry::new());
        let dir = tempfile::tempdir().unwrap();
        let lock = ImagesLock::new(Default::default());
        let session = Session::new(registry);
        pull_images(&session, &lock, dir.path(), &TransportOptions::default())
            .await
            .unwrap();
        push_images(&session, &lock, dir.path(), &TransportOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_pull_stops_early() {
        let source = Arc::new(MemoryRegistry::new());
        let (dir, lock) = demo_lock(&source).await;
        let token = CancellationToken::new();
        token.cancel();
        let session = Session::new(source.clone()).with_cancel(token);
        let err = pull_images(&session, &lock, &dir.path().join("images"), &TransportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(crate::error::kind_of(&err), Some(Error::Cancelled)));
    }

    #[tokio::test]
    async fn missing_layouts_fail_the_push() {
        let source = Arc::new(MemoryRegistry::new());
        let (dir, lock) = demo_lock(&source).await;
        let session = Session::new(Arc::new(MemoryRegistry::new())).with_max_retries(1);
        let err = push_images(&session, &lock, &dir.path().join("nothing"), &TransportOptions::default())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("example.test/app:1.0"));
    }

    #[tokio::test]
    async fn interrupted_pull_reports_the_failure_behind_it() {
        let source = Arc::new(MemoryRegistry::new());
        let (dir, lock) = two_image_lock(&source).await;
        let images_dir = dir.path().join("images");
        let token = CancellationToken::new();
        source.cancel_on_failure(token.clone());
        source.fail_next(1);

        let session = Session::new(source.clone()).with_cancel(token.clone());
        let err = pull_images(&session, &lock, &images_dir, &TransportOptions::default())
            .await
            .unwrap_err();
        assert!(token.is_cancelled());
        let message = format!("{:#}", err);
        assert!(message.contains("connection reset by peer"), "{}", message);
        assert!(!matches!(crate::error::kind_of(&err), Some(Error::Cancelled)));
        for digest in &lock.images[1].digests {
            assert!(!image_layout_dir(&images_dir, &digest.digest).exists());
        }
    }

    #[tokio::test]
    async fn interrupted_push_reports_the_failure_behind_it() {
        let source = Arc::new(MemoryRegistry::new());
        let (dir, lock) = two_image_lock(&source).await;
        let images_dir = dir.path().join("images");
        pull_images(&Session::new(source.clone()), &lock, &images_dir, &TransportOptions::default())
            .await
            .unwrap();

        let target = Arc::new(MemoryRegistry::new());
        let token = CancellationToken::new();
        target.cancel_on_failure(token.clone());
        target.fail_next_push(1);
        let session = Session::new(target.clone()).with_cancel(token.clone());
        let err = push_images(&session, &lock, &images_dir, &TransportOptions::default())
            .await
            .unwrap_err();
        assert!(token.is_cancelled());
        let message = format!("{:#}", err);
        assert!(message.contains("connection reset by peer"), "{}", message);
        assert!(message.contains(&lock.images[0].image), "{}", message);
        for image in &lock.images {
            let reference = ImageReference::parse(&image.image).unwrap();
            let tag = reference.tag().unwrap();
            assert!(target.tagged(&reference.canonical_name(), tag).is_none());
        }
    }
}
