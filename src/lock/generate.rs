// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
use std::path::Path;

use anyhow::{Context, Result};

use super::{ChartImage, ImagesLock, LockChart};
use crate::chart::{AnnotatedImage, Chart, DEFAULT_ANNOTATIONS_KEY};
use crate::error::ErrorList;
use crate::reference::ImageReference;
use crate::resolver::resolve;
use crate::session::Session;

/// How to build a lock.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub annotations_key: String,
    /// Platforms to keep, all of them when empty.
    pub platforms: Vec<String>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            annotations_key: DEFAULT_ANNOTATIONS_KEY.to_string(),
            platforms: Vec::new(),
        }
    }
}

/// Every annotated image of `chart` and its subcharts, tagged with the owning
/// chart's name.
fn collect(chart: &Chart, key: &str, out: &mut Vec<(String, AnnotatedImage)>) -> Result<()> {
    for image in chart.annotated_images(key)? {
        out.push((chart.name().to_string(), image));
    }
    let mut errors = Vec::new();
    for sub in &chart.subcharts {
        if let Err(e) = collect(sub, key, out) {
            errors.push(e);
        }
    }
    ErrorList::join(errors)
}

/// Build the lock of the chart in `chart_dir`, resolving every image against
/// its registry.
///
/// Every image is attempted; failures are reported together.
pub async fn generate(session: &Session, chart_dir: &Path, options: &LockOptions) -> Result<ImagesLock> {
    let chart = Chart::load(chart_dir)?;
    let mut found = Vec::new();
    collect(&chart, &options.annotations_key, &mut found)?;

    let mut lock = ImagesLock::new(LockChart {
        name: chart.metadata.name.clone(),
        version: chart.metadata.version.clone(),
        app_version: chart.metadata.app_version.clone(),
    });
    let mut unique: Vec<(String, AnnotatedImage)> = Vec::with_capacity(found.len());
    for entry in found {
        if !unique.contains(&entry) {
            unique.push(entry);
        }
    }
    if unique.is_empty() {
        session.reporter().warn(&format!(
            "chart {} does not declare any image in its `{}` annotation",
            chart.name(),
            options.annotations_key
        ));
        return Ok(lock);
    }

    let progress = session
        .reporter()
        .progress(unique.len() as u64, "Resolving image digests");
    let mut errors = Vec::new();
    for (chart_name, image) in unique {
        if let Err(cancelled) = session.check_cancelled() {
            return Err(ErrorList::gathered_or(errors, cancelled));
        }
        progress.set_message(image.image.clone());
        match resolve_one(session, &image.image, &options.platforms).await {
            Ok(digests) => {
                lock.insert(ChartImage {
                    name: image.name,
                    image: image.image,
                    chart: chart_name,
                    digests,
                });
            }
            Err(e) => errors.push(e),
        }
        progress.inc(1);
    }
    progress.finish();
    ErrorList::join(errors).context("Failed to resolve chart images")?;
    tracing::debug!(chart = %lock.chart.name, images = lock.images.len(), "Generated Images.lock");
    Ok(lock)
}

async fn resolve_one(
    session: &Session,
    image: &str,
    platforms: &[String],
) -> Result<Vec<crate::digest::PlatformDigest>> {
    let reference = ImageReference::parse(image)?;
    let registry = session.registry.as_ref();
    let reference = &reference;
    session
        .retry("resolving image", move || resolve(registry, reference, platforms))
        .await
        .context(format!("Failed to resolve {}", image))
}
