// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Metadata and signature artifacts stored next to images and charts.
//!
//! Artifacts live in the same repository as their subject, under a tag derived
//! from the subject: `sha256-<HEX>.<suffix>` for digests, `<tag>-<suffix>` for
//! chart versions.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{copy_to_layout, push_from_layout};
use crate::chart::package::version_tag;
use crate::digest::Digest;
use crate::error::{is_local_artifact_missing, is_tag_missing, Error};
use crate::layout::{require_dir, Layout};
use crate::lock::ChartImage;
use crate::reference::ImageReference;
use crate::session::Session;

pub const METADATA: &str = "metadata";
pub const SIGNATURE: &str = "sig";

/// Remote tag of the `suffix` artifact of a subject.
///
/// With `resolved` the tag derives from the subject digest, otherwise from the
/// subject's own tag.
pub fn artifact_tag(subject: &ImageReference, resolved: Option<&Digest>, suffix: &str) -> String {
    let digest = resolved.or_else(|| match subject.tag() {
        Some(_) => None,
        None => subject.digest(),
    });
    match (digest, subject.tag()) {
        (Some(digest), _) => format!("{}-{}.{}", digest.algorithm(), digest.hex(), suffix),
        (None, tag) => format!("{}-{}", version_tag(tag.unwrap_or_default()), suffix),
    }
}

/// `<root>/images/<chart>/<name>/<tag or hex>`, the stem of an image's artifact directories.
pub fn image_artifacts_base(root: &Path, image: &ChartImage, reference: &ImageReference) -> PathBuf {
    root.join("images")
        .join(&image.chart)
        .join(&image.name)
        .join(reference.tag_or_hex())
}

/// `<root>/chart`
pub fn chart_artifacts_dir(root: &Path) -> PathBuf {
    root.join("chart")
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Pull `subject`'s artifact tagged `tag` into a layout at `dest`.
pub async fn pull_artifact(
    session: &Session,
    subject: &ImageReference,
    tag: &str,
    dest: &Path,
) -> Result<Digest> {
    let registry = session.registry.as_ref();
    let tags = session
        .retry("listing tags", move || registry.list_tags(subject))
        .await
        .context(format!("Failed to list tags of {}", subject.canonical_name()))?;
    if !tags.iter().any(|t| t == tag) {
        return Err(Error::TagDoesNotExist {
            repository: subject.canonical_name(),
            tag: tag.to_string(),
        }
        .into());
    }
    let reference = subject.with_tag(tag);
    let reference = &reference;
    let manifest = session
        .retry("fetching artifact", move || registry.fetch_manifest(reference))
        .await?;
    let layout = Layout::create(dest)?;
    copy_to_layout(session, reference, &manifest, &layout, Some(tag)).await?;
    tracing::debug!(artifact = %reference, dest = %dest.display(), "Pulled artifact");
    Ok(manifest.digest)
}

/// Push the layout at `src` as `subject`'s artifact tagged `tag`.
pub async fn push_artifact(
    session: &Session,
    src: &Path,
    subject: &ImageReference,
    tag: &str,
) -> Result<Digest> {
    require_dir(src)?;
    let layout = Layout::open(src)?;
    let manifest = layout.single_manifest()?;
    let target = subject.with_tag(tag);
    let digest = push_from_layout(session, &layout, &manifest, &target).await?;
    tracing::debug!(artifact = %target, "Pushed artifact");
    Ok(digest)
}

/// Pull the artifact tagged `tag` into `dest`, then its signature into `dest.sig`.
async fn pull_signed(session: &Session, subject: &ImageReference, tag: &str, dest: &Path) -> Result<()> {
    let Some(digest) = informational(pull_artifact(session, subject, tag, dest).await)? else {
        return Ok(());
    };
    let sig_tag = artifact_tag(subject, Some(&digest), SIGNATURE);
    informational(pull_artifact(session, subject, &sig_tag, &with_suffix(dest, SIGNATURE)).await)?;
    Ok(())
}

/// Push `src` under `tag`, then `src.sig` as its signature.
async fn push_signed(session: &Session, src: &Path, subject: &ImageReference, tag: &str) -> Result<()> {
    let Some(digest) = informational(push_artifact(session, src, subject, tag).await)? else {
        return Ok(());
    };
    let sig_tag = artifact_tag(subject, Some(&digest), SIGNATURE);
    informational(push_artifact(session, &with_suffix(src, SIGNATURE), subject, &sig_tag).await)?;
    Ok(())
}

/// Missing remote tags and missing local directories are not failures.
fn informational<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_tag_missing(&e) || is_local_artifact_missing(&e) => {
            tracing::debug!(reason = %e, "Skipping artifact");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Pull the metadata and signature artifacts of `image`.
pub async fn pull_image_artifacts(session: &Session, image: &ChartImage, root: &Path) -> Result<()> {
    let reference = ImageReference::parse(&image.image)?;
    let registry = session.registry.as_ref();
    let subject = &reference;
    let digest = session
        .retry("resolving image", move || registry.resolve_digest(subject))
        .await
        .context(format!("Failed to resolve {}", image.image))?;
    let base = image_artifacts_base(root, image, &reference);
    if let Some(parent) = base.parent() {
        std::fs::create_dir_all(parent)?;
    }
    pull_signed(
        session,
        &reference,
        &artifact_tag(&reference, Some(&digest), METADATA),
        &with_suffix(&base, METADATA),
    )
    .await?;
    informational(
        pull_artifact(
            session,
            &reference,
            &artifact_tag(&reference, Some(&digest), SIGNATURE),
            &with_suffix(&base, SIGNATURE),
        )
        .await,
    )?;
    Ok(())
}

/// Push whatever artifacts of `image` were pulled, next to its new `digest`.
pub async fn push_image_artifacts(
    session: &Session,
    image: &ChartImage,
    digest: &Digest,
    root: &Path,
) -> Result<()> {
    let reference = ImageReference::parse(&image.image)?;
    let base = image_artifacts_base(root, image, &reference);
    push_signed(
        session,
        &with_suffix(&base, METADATA),
        &reference,
        &artifact_tag(&reference, Some(digest), METADATA),
    )
    .await?;
    informational(
        push_artifact(
            session,
            &with_suffix(&base, SIGNATURE),
            &reference,
            &artifact_tag(&reference, Some(digest), SIGNATURE),
        )
        .await,
    )?;
    Ok(())
}

/// Pull the metadata artifact of the chart at `chart` (and its signature).
pub async fn pull_chart_artifacts(session: &Session, chart: &ImageReference, root: &Path) -> Result<()> {
    let dir = chart_artifacts_dir(root);
    std::fs::create_dir_all(&dir)?;
    pull_signed(
        session,
        chart,
        &artifact_tag(chart, None, METADATA),
        &dir.join(METADATA),
    )
    .await
}

/// Push a previously pulled chart metadata artifact next to `chart`.
pub async fn push_chart_artifacts(session: &Session, chart: &ImageReference, root: &Path) -> Result<()> {
    let dir = chart_artifacts_dir(root);
    push_signed(
        session,
        &dir.join(METADATA),
        chart,
        &artifact_tag(chart, None, METADATA),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;
    use std::sync::Arc;

    fn image() -> ChartImage {
        ChartImage {
            name: "app".into(),
            image: "example.test/app:1.0".into(),
            chart: "demo".into(),
            digests: vec![],
        }
    }

    #[test]
    fn tags_follow_the_subject() {
        let digest = Digest::of(b"subject");
        let tagged = ImageReference::parse("example.test/charts/demo:1.0.0+rc.1").unwrap();
        assert_eq!(
            artifact_tag(&tagged, Some(&digest), METADATA),
            format!("sha256-{}.metadata", digest.hex())
        );
        assert_eq!(artifact_tag(&tagged, None, METADATA), "1.0.0_rc.1-metadata");

        let pinned = tagged.with_digest(&digest);
        assert_eq!(
            artifact_tag(&pinned, None, SIGNATURE),
            format!("sha256-{}.sig", digest.hex())
        );
    }

    #[test]
    fn directories_are_keyed_by_chart_and_name() {
        let reference = ImageReference::parse("example.test/app:1.0").unwrap();
        let base = image_artifacts_base(Path::new("/w/artifacts"), &image(), &reference);
        assert_eq!(base, PathBuf::from("/w/artifacts/images/demo/app/1.0"));
        assert_eq!(
            with_suffix(&base, METADATA),
            PathBuf::from("/w/artifacts/images/demo/app/1.0.metadata")
        );
    }

    #[tokio::test]
    async fn missing_artifacts_are_not_errors() {
        let registry = Arc::new(MemoryRegistry::new());
        let app = registry.put_image("example.test/app", Some(("linux", "amd64")), b"a");
        registry.tag("example.test/app", "1.0", &app.digest);
        let session = Session::new(registry);
        let root = tempfile::tempdir().unwrap();

        pull_image_artifacts(&session, &image(), root.path()).await.unwrap();
        push_image_artifacts(&session, &image(), &app.digest, root.path())
            .await
            .unwrap();

        let err = pull_artifact(
            &session,
            &ImageReference::parse("example.test/app").unwrap(),
            "nope",
            &root.path().join("x"),
        )
        .await
        .unwrap_err();
        assert!(is_tag_missing(&err));
    }

    #[tokio::test]
    async fn metadata_and_signatures_travel() {
        let source = Arc::new(MemoryRegistry::new());
        let app = source.put_image("example.test/app", Some(("linux", "amd64")), b"a");
        source.tag("example.test/app", "1.0", &app.digest);
        let metadata = source.put_image("example.test/app", None, b"sbom");
        let meta_tag = format!("sha256-{}.metadata", app.digest.hex());
        source.tag("example.test/app", &meta_tag, &metadata.digest);
        let signature = source.put_image("example.test/app", None, b"signature");
        let sig_tag = format!("sha256-{}.sig", metadata.digest.hex());
        source.tag("example.test/app", &sig_tag, &signature.digest);

        let root = tempfile::tempdir().unwrap();
        pull_image_artifacts(&Session::new(source.clone()), &image(), root.path())
            .await
            .unwrap();
        let base = root.path().join("images/demo/app/1.0");
        assert!(with_suffix(&base, "metadata").join("index.json").is_file());
        assert!(with_suffix(&base, "metadata.sig").join("index.json").is_file());
        assert!(!with_suffix(&base, "sig").exists());

        let target = Arc::new(MemoryRegistry::new());
        let new_digest = Digest::of(b"new index");
        let mut moved = image();
        moved.image = "new.example/proj/app:1.0".into();
        // artifacts are found by chart, name and tag, not by registry
        push_image_artifacts(&Session::new(target.clone()), &moved, &new_digest, root.path())
            .await
            .unwrap();
        assert_eq!(
            target.tagged(
                "new.example/proj/app",
                &format!("sha256-{}.metadata", new_digest.hex())
            ),
            Some(metadata.digest.clone())
        );
        assert!(target
            .tagged("new.example/proj/app", &sig_tag)
            .is_some());
    }
}
