// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! The unwrap pipeline: relocate a wrap to a registry and push its images and
//! chart there.
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::chart::package::{package, parse_oci_url, push_chart, OCI_SCHEME};
use crate::chart::{DEFAULT_ANNOTATIONS_KEY, VALUES_FILE};
use crate::error::Error;
use crate::lock::{generate, ImagesLock, LockOptions};
use crate::manifest::{descriptor_digest, parse_manifest};
use crate::reference::ImageReference;
use crate::relocate::{normalize_prefix, relocate_chart, RelocateOptions};
use crate::resolver::fetch_blob;
use crate::session::Session;
use crate::transport::{artifacts, push_images, TransportOptions};
use crate::workdir;
use crate::wrap::{copy_dir, WrapDir};

#[derive(Debug, Clone)]
pub struct UnwrapOptions {
    pub annotations_key: String,
    /// Values files relocated on top of `values.yaml`.
    pub values_files: Vec<PathBuf>,
    /// Answer yes to every question.
    pub yes: bool,
    /// Where to push the chart, the target registry when unset.
    pub push_chart_url: Option<String>,
    /// Leave images where they are and only relocate.
    pub skip_images: bool,
}

impl Default for UnwrapOptions {
    fn default() -> Self {
        Self {
            annotations_key: DEFAULT_ANNOTATIONS_KEY.to_string(),
            values_files: Vec::new(),
            yes: false,
            push_chart_url: None,
            skip_images: false,
        }
    }
}

/// Progress of an unwrap. Each step only runs once the previous one is done;
/// a failed step leaves the earlier ones in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwrapState {
    Start,
    Resolved,
    Relocated,
    ImagesPushed,
    ImagesSkipped,
    ChartPushed,
    ChartSkipped,
    Done,
}

impl UnwrapState {
    /// Whether `to` directly follows `self`.
    pub fn leads_to(self, to: UnwrapState) -> bool {
        use UnwrapState::*;
        matches!(
            (self, to),
            (Start, Resolved)
                | (Resolved, Relocated)
                | (Relocated, ImagesPushed | ImagesSkipped)
                | (ImagesPushed | ImagesSkipped, ChartPushed | ChartSkipped)
                | (ChartPushed | ChartSkipped, Done)
        )
    }

    /// Fail unless the step reaching `to` may run now.
    pub fn ensure_next(self, to: UnwrapState) -> Result<()> {
        if !self.leads_to(to) {
            bail!("unwrap cannot go from {:?} to {:?}", self, to);
        }
        Ok(())
    }

    /// Record that the step reaching `to` is done.
    pub fn advance(&mut self, to: UnwrapState) -> Result<()> {
        self.ensure_next(to)?;
        tracing::debug!(from = ?*self, ?to, "Unwrap state");
        *self = to;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Unwrapped {
    pub state: UnwrapState,
    pub wrap: WrapDir,
    pub lock: Option<ImagesLock>,
    /// Where the chart now lives, when it was pushed.
    pub chart: Option<ImageReference>,
}

/// Unwrap `input` (wrap archive, expanded wrap or `oci://` artifact) into
/// `registry`.
///
/// `confirm` is asked before pushing unless `options.yes` is set.
pub async fn unwrap(
    session: &Session,
    input: &str,
    registry: &str,
    options: &UnwrapOptions,
    confirm: impl Fn(&str) -> Result<bool>,
) -> Result<Unwrapped> {
    let reporter = session.reporter();
    let prefix = normalize_prefix(registry);
    let ask = |question: &str| -> Result<bool> {
        if options.yes {
            return Ok(true);
        }
        confirm(question)
    };
    let mut state = UnwrapState::Start;
    tracing::debug!(?state, input, "Unwrapping");

    reporter.section("Unwrapping", input);
    let wrap = resolve_input(session, input)
        .await
        .map_err(|e| reporter.fail("Failed to open the wrap", e))?;
    state.advance(UnwrapState::Resolved)?;
    let metadata = wrap.metadata()?;

    state.ensure_next(UnwrapState::Relocated)?;
    reporter.section("Relocating", &format!("{} to {}", metadata.name, prefix));
    let mut values_files = vec![PathBuf::from(VALUES_FILE)];
    values_files.extend(options.values_files.iter().cloned());
    let relocate = RelocateOptions {
        annotations_key: options.annotations_key.clone(),
        values_files,
        recursive: true,
        skip_images: options.skip_images,
    };
    relocate_chart(&wrap.chart_dir(), &prefix, &relocate)
        .map_err(|e| reporter.fail("Failed to relocate the chart", e))?;
    state.advance(UnwrapState::Relocated)?;

    let lock = wrap.lock()?;
    let images = lock.as_ref().map_or(0, |l| l.images.len());
    let pushed = match &lock {
        Some(lock) if images > 0 && !options.skip_images => {
            ask(&format!("Push {} images to {}?", images, prefix))?
        }
        _ => false,
    };
    if let (true, Some(lock)) = (pushed, &lock) {
        state.ensure_next(UnwrapState::ImagesPushed)?;
        reporter.section("Pushing", &format!("{} images", images));
        let transport = TransportOptions {
            fetch_artifacts: true,
            artifacts_dir: Some(wrap.artifacts_dir()),
        };
        push_images(session, lock, &wrap.images_dir(), &transport)
            .await
            .map_err(|e| reporter.fail("Failed to push images", e))?;
        verify_pushed(session, &wrap, lock, &options.annotations_key)
            .await
            .map_err(|e| reporter.fail("Failed to verify pushed images", e))?;
        reporter.step("Verified", &format!("{} images in {}", images, prefix));
        state.advance(UnwrapState::ImagesPushed)?;
    } else {
        reporter.step("Skipping", "image push");
        state.advance(UnwrapState::ImagesSkipped)?;
    }

    let chart_url = options
        .push_chart_url
        .as_deref()
        .map(normalize_prefix)
        .unwrap_or_else(|| prefix.clone());
    let mut chart = None;
    if ask(&format!("Push chart {} to {}?", metadata.name, chart_url))? {
        state.ensure_next(UnwrapState::ChartPushed)?;
        let pushed = push_wrapped_chart(session, &wrap, &chart_url)
            .await
            .map_err(|e| reporter.fail("Failed to push the chart", e))?;
        reporter.step("Pushed", &format!("chart {}{}", OCI_SCHEME, pushed));
        chart = Some(pushed);
        state.advance(UnwrapState::ChartPushed)?;
    } else {
        state.advance(UnwrapState::ChartSkipped)?;
    }

    state.advance(UnwrapState::Done)?;
    Ok(Unwrapped {
        state,
        wrap,
        lock,
        chart,
    })
}

/// Materialize `input` as a writable wrap directory inside the working directory.
async fn resolve_input(session: &Session, input: &str) -> Result<WrapDir> {
    if input.starts_with(OCI_SCHEME) {
        let reference = parse_oci_url(input)?;
        let archive_path = pull_wrap_artifact(session, &reference).await?;
        return WrapDir::open(&archive_path);
    }
    let path = Path::new(input);
    if !path.exists() {
        return Err(Error::WrapNotFound(input.to_string()).into());
    }
    if path.is_dir() {
        // relocation rewrites files, leave the caller's tree alone
        let copy = workdir::subdir("wrap-")?.join("wrap");
        copy_dir(path, &copy)?;
        return WrapDir::open(&copy);
    }
    WrapDir::open(path)
}

/// Download the single layer of an OCI artifact holding a wrap archive.
async fn pull_wrap_artifact(session: &Session, reference: &ImageReference) -> Result<PathBuf> {
    let registry = session.registry.as_ref();
    let manifest = session
        .retry("fetching wrap", move || registry.fetch_manifest(reference))
        .await
        .context(format!("Failed to fetch {}", reference))?;
    let image = parse_manifest(&manifest.bytes)?;
    let [layer] = image.layers().as_slice() else {
        bail!(
            "{} holds {} layers, a wrap artifact has exactly one",
            reference,
            image.layers().len()
        );
    };
    let digest = descriptor_digest(layer)?;
    let digest = &digest;
    let data = session
        .retry("pulling wrap", move || fetch_blob(registry, reference, digest))
        .await?;
    let path = workdir::subdir("download-")?.join(format!("wrap{}", crate::wrap::WRAP_SUFFIX));
    std::fs::write(&path, data).context(format!("Failed to write `{}`", path.display()))?;
    Ok(path)
}

/// The relocated chart must resolve to the digests the wrap was made with.
async fn verify_pushed(
    session: &Session,
    wrap: &WrapDir,
    lock: &ImagesLock,
    annotations_key: &str,
) -> Result<()> {
    let options = LockOptions {
        annotations_key: annotations_key.to_string(),
        platforms: Vec::new(),
    };
    let live = generate(session, &wrap.chart_dir(), &options).await?;
    lock.validate(&live)
}

async fn push_wrapped_chart(session: &Session, wrap: &WrapDir, url: &str) -> Result<ImageReference> {
    let out = workdir::subdir("package-")?;
    let tgz = package(&wrap.chart_dir(), &out)?;
    let reference = push_chart(session, &tgz, url).await?;
    artifacts::push_chart_artifacts(session, &reference, &wrap.artifacts_dir()).await?;
    Ok(reference)
}
