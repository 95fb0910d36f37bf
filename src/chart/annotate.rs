// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Guess the images a chart deploys from its values and record them in the
//! images annotation.
//!
//! This is a heuristic: anything shaped like an image element in `values.yaml`
//! is taken as an image.
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use super::values::find_images;
use super::{
    format_annotated_images, write_annotation, AnnotatedImage, ChartMetadata, CHARTS_DIR,
    CHART_FILE, VALUES_FILE,
};
use crate::error::ErrorList;
use crate::reference::ImageReference;

/// Images found in the values file of the chart in `dir`, sorted by name.
pub fn discover(dir: &Path) -> Result<Vec<AnnotatedImage>> {
    let values_path = dir.join(VALUES_FILE);
    if !values_path.is_file() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(&values_path)
        .context(format!("Failed to read `{}`", values_path.display()))?;
    let doc: serde_yml::Value = serde_yml::from_str(&contents)
        .context(format!("Failed to parse `{}`", values_path.display()))?;

    let mut images: Vec<AnnotatedImage> = find_images(&doc)
        .into_iter()
        .filter_map(|element| {
            let url = element.url();
            match ImageReference::parse(&url) {
                Ok(_) => Some(AnnotatedImage {
                    name: element.short_name().to_string(),
                    image: url,
                }),
                Err(e) => {
                    tracing::debug!(path = %element.path, error = %e, "Not an image");
                    None
                }
            }
        })
        .collect();
    images.sort();
    images.dedup();
    Ok(images)
}

/// Annotate the chart in `dir` (and its unpacked subcharts).
///
/// Returns how many images were recorded in total. Charts without images are
/// left untouched.
pub fn annotate(dir: &Path, annotations_key: &str) -> Result<usize> {
    let mut errors = Vec::new();
    let mut total = 0;

    let charts_dir = dir.join(CHARTS_DIR);
    if charts_dir.is_dir() {
        let mut subdirs: Vec<_> = fs::read_dir(&charts_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.join(CHART_FILE).is_file())
            .collect();
        subdirs.sort();
        for subdir in subdirs {
            match annotate(&subdir, annotations_key) {
                Ok(n) => total += n,
                Err(e) => errors.push(e),
            }
        }
    }

    match annotate_one(dir, annotations_key) {
        Ok(n) => total += n,
        Err(e) => errors.push(e),
    }
    ErrorList::join(errors)?;
    Ok(total)
}

fn annotate_one(dir: &Path, annotations_key: &str) -> Result<usize> {
    let images = discover(dir)?;
    if images.is_empty() {
        return Ok(0);
    }
    let metadata = ChartMetadata::from_path(&dir.join(CHART_FILE))?;
    tracing::debug!(chart = %metadata.name, count = images.len(), "Annotating chart");
    write_annotation(dir, annotations_key, format_annotated_images(&images)?)
        .context(format!("Failed to annotate chart {}", metadata.name))?;
    Ok(images.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::testutil::write_chart;
    use crate::chart::{Chart, DEFAULT_ANNOTATIONS_KEY};

    #[test]
    fn empty_chart_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write_chart(dir.path(), "demo", None, "replicas: 1\n");
        let before = fs::read(dir.path().join(CHART_FILE)).unwrap();
        assert_eq!(annotate(dir.path(), DEFAULT_ANNOTATIONS_KEY).unwrap(), 0);
        assert_eq!(fs::read(dir.path().join(CHART_FILE)).unwrap(), before);
    }

    #[test]
    fn values_images_become_annotations() {
        let dir = tempfile::tempdir().unwrap();
        write_chart(
            dir.path(),
            "demo",
            None,
            "image:\n  registry: docker.io\n  repository: bitnami/nginx\n  tag: 1.25.0\n\
             metrics:\n  image:\n    repository: quay.io/prometheus/exporter\n    tag: v1\n\
             again:\n  repository: bitnami/nginx\n  registry: docker.io\n  tag: 1.25.0\n",
        );
        assert_eq!(annotate(dir.path(), DEFAULT_ANNOTATIONS_KEY).unwrap(), 2);

        let chart = Chart::load(dir.path()).unwrap();
        assert_eq!(
            chart.annotated_images(DEFAULT_ANNOTATIONS_KEY).unwrap(),
            vec![
                AnnotatedImage {
                    name: "exporter".into(),
                    image: "quay.io/prometheus/exporter:v1".into(),
                },
                AnnotatedImage {
                    name: "nginx".into(),
                    image: "docker.io/bitnami/nginx:1.25.0".into(),
                },
            ]
        );
    }
}
