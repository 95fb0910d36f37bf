// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Point every image reference of a chart at a new registry.
//!
//! A reference keeps its last `NAMESPACE/NAME` pair and is moved under the
//! prefix: `docker.io/bitnami/redis:7` relocated to `new.example/proj` becomes
//! `new.example/proj/bitnami/redis:7`. References already under the prefix are
//! left alone.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::carvel::{images_path, BundleImages};
use crate::chart::package::OCI_SCHEME;
use crate::chart::values::find_images;
use crate::chart::{
    expand_packaged_subcharts, format_annotated_images, parse_annotated_images, write_annotation,
    ChartMetadata, CHARTS_DIR, CHART_FILE, DEFAULT_ANNOTATIONS_KEY, LOCK_FILE, VALUES_FILE,
};
use crate::error::ErrorList;
use crate::lock::ImagesLock;
use crate::reference::ImageReference;

#[derive(Debug, Clone)]
pub struct RelocateOptions {
    pub annotations_key: String,
    /// Values files to rewrite. Relative paths are taken from each chart
    /// directory; absolute ones only apply to the top-level chart.
    pub values_files: Vec<PathBuf>,
    /// Relocate subcharts too.
    pub recursive: bool,
    /// Accepted for symmetry with the unwrap options; relocation always
    /// rewrites references.
    pub skip_images: bool,
}

impl Default for RelocateOptions {
    fn default() -> Self {
        Self {
            annotations_key: DEFAULT_ANNOTATIONS_KEY.to_string(),
            values_files: vec![PathBuf::from(VALUES_FILE)],
            recursive: true,
            skip_images: false,
        }
    }
}

/// Drop an `oci://` scheme and trailing slashes.
pub fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim();
    prefix
        .strip_prefix(OCI_SCHEME)
        .unwrap_or(prefix)
        .trim_end_matches('/')
        .to_string()
}

/// Relocate one reference under `prefix`, with its `:tag`/`@digest` when
/// `include_identifier` is set.
pub fn relocate_url(url: &str, prefix: &str, include_identifier: bool) -> Result<String> {
    let prefix = normalize_prefix(prefix);
    let reference = ImageReference::parse(url)?;
    let identifier = if include_identifier {
        reference.identifier()
    } else {
        String::new()
    };

    let under = format!("{}/", prefix);
    let written = url.trim();
    if written.starts_with(&under) {
        let name = written
            .strip_suffix(&reference.identifier())
            .unwrap_or(written);
        return Ok(format!("{}{}", name, identifier));
    }
    if reference.canonical_name().starts_with(&under) {
        return Ok(format!("{}{}", reference.canonical_name(), identifier));
    }
    Ok(format!("{}/{}{}", prefix, reference.tail(), identifier))
}

/// Relocate the chart in `dir` under `prefix`: its values files, its images
/// annotation, `Images.lock` and `.imgpkg/images.yml`.
///
/// Every file is attempted; failures are reported together.
pub fn relocate_chart(dir: &Path, prefix: &str, options: &RelocateOptions) -> Result<()> {
    let prefix = normalize_prefix(prefix);
    let mut errors = Vec::new();

    for file in &options.values_files {
        let path = dir.join(file);
        if let Err(e) = relocate_values(&path, &prefix) {
            errors.push(e);
        }
    }
    if let Err(e) = relocate_annotation(dir, &prefix, &options.annotations_key) {
        errors.push(e);
    }
    if let Err(e) = relocate_lock(&dir.join(LOCK_FILE), &prefix) {
        errors.push(e);
    }
    if let Err(e) = relocate_bundle_images(&images_path(dir), &prefix) {
        errors.push(e);
    }

    if options.recursive {
        if let Err(e) = relocate_subcharts(dir, &prefix, options) {
            errors.push(e);
        }
    }
    ErrorList::join(errors).context(format!("Failed to relocate chart at `{}`", dir.display()))
}

fn relocate_subcharts(dir: &Path, prefix: &str, options: &RelocateOptions) -> Result<()> {
    let charts_dir = dir.join(CHARTS_DIR);
    if !charts_dir.is_dir() {
        return Ok(());
    }
    expand_packaged_subcharts(dir)?;
    let mut subdirs: Vec<PathBuf> = fs::read_dir(&charts_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.join(CHART_FILE).is_file())
        .collect();
    subdirs.sort();

    let sub_options = RelocateOptions {
        values_files: options
            .values_files
            .iter()
            .filter(|f| f.is_relative())
            .cloned()
            .collect(),
        ..options.clone()
    };
    let mut errors = Vec::new();
    for subdir in subdirs {
        if let Err(e) = relocate_chart(&subdir, prefix, &sub_options) {
            errors.push(e);
        }
    }
    ErrorList::join(errors)
}

/// Rewrite the image elements of one values file. Missing files are skipped,
/// files without changes are not rewritten.
fn relocate_values(path: &Path, prefix: &str) -> Result<()> {
    if !path.is_file() {
        tracing::debug!(path = %path.display(), "No values file to relocate");
        return Ok(());
    }
    let contents =
        fs::read_to_string(path).context(format!("Failed to read `{}`", path.display()))?;
    let mut doc: serde_yml::Value =
        serde_yml::from_str(&contents).context(format!("Failed to parse `{}`", path.display()))?;

    let mut changed = false;
    for mut element in find_images(&doc) {
        let url = element.url();
        let relocated = match relocate_url(&url, prefix, false) {
            Ok(relocated) => relocated,
            Err(e) => {
                tracing::debug!(path = %element.path, error = %e, "Skipping value that is not an image");
                continue;
            }
        };
        let before = element.clone();
        element.set_name(&relocated);
        if element != before && element.write_back(&mut doc) {
            tracing::debug!(path = %element.path, from = %url, to = %element.url(), "Relocated value");
            changed = true;
        }
    }
    if changed {
        fs::write(path, serde_yml::to_string(&doc)?)
            .context(format!("Failed to write `{}`", path.display()))?;
    }
    Ok(())
}

fn relocate_annotation(dir: &Path, prefix: &str, key: &str) -> Result<()> {
    let metadata = ChartMetadata::from_path(&dir.join(CHART_FILE))?;
    let Some(value) = metadata.annotations.get(key) else {
        return Ok(());
    };
    let mut images = parse_annotated_images(value)
        .context(format!("Invalid `{}` annotation in chart {}", key, metadata.name))?;
    if images.is_empty() {
        return Ok(());
    }
    let mut changed = false;
    for image in &mut images {
        let relocated = relocate_url(&image.image, prefix, true)?;
        if relocated != image.image {
            image.image = relocated;
            changed = true;
        }
    }
    if changed {
        write_annotation(dir, key, format_annotated_images(&images)?)?;
    }
    Ok(())
}

fn relocate_lock(path: &Path, prefix: &str) -> Result<()> {
    if !path.is_file() {
        return Ok(());
    }
    let mut lock = ImagesLock::from_path(path)?;
    let mut changed = false;
    for image in &mut lock.images {
        let relocated = relocate_url(&image.image, prefix, true)?;
        if relocated != image.image {
            image.image = relocated;
            changed = true;
        }
    }
    if changed {
        lock.to_path(path)?;
    }
    Ok(())
}

fn relocate_bundle_images(path: &Path, prefix: &str) -> Result<()> {
    if !path.is_file() {
        return Ok(());
    }
    let mut images = BundleImages::from_path(path)?;
    let mut changed = false;
    for entry in &mut images.images {
        let relocated = relocate_url(&entry.image, prefix, true)?;
        if relocated != entry.image {
            entry.image = relocated;
            changed = true;
        }
    }
    if changed {
        images.to_path(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::testutil::write_chart;
    use crate::chart::Chart;
    use crate::digest::{Digest, PlatformDigest};
    use crate::lock::{ChartImage, LockChart};

    #[test]
    fn prefixes_are_normalized() {
        assert_eq!(normalize_prefix("oci://new.example/proj/"), "new.example/proj");
        assert_eq!(normalize_prefix("new.example"), "new.example");
    }

    #[test]
    fn urls_keep_their_tail() {
        let cases = [
            ("example.test/app:1.0", "new.example/proj/app:1.0"),
            ("redis:7", "new.example/proj/redis:7"),
            ("docker.io/bitnami/redis:7", "new.example/proj/bitnami/redis:7"),
            (
                "quay.io/jetstack/cert-manager-controller",
                "new.example/proj/jetstack/cert-manager-controller:latest",
            ),
            ("ghcr.io/org/team/tool:2", "new.example/proj/team/tool:2"),
        ];
        for (input, want) in cases {
            assert_eq!(relocate_url(input, "oci://new.example/proj", true).unwrap(), want);
        }
        let digest = Digest::of(b"x");
        assert_eq!(
            relocate_url(&format!("nginx@{}", digest), "new.example", true).unwrap(),
            format!("new.example/nginx@{}", digest)
        );
        assert_eq!(
            relocate_url("example.test/app:1.0", "new.example", false).unwrap(),
            "new.example/app"
        );
    }

    #[test]
    fn relocation_is_idempotent() {
        for prefix in ["new.example", "new.example/proj", "localhost:5000/a/b"] {
            for url in ["redis", "bitnami/redis:7", "example.test/a/b/c:1", "quay.io/x/y@sha256:0000000000000000000000000000000000000000000000000000000000000000"] {
                let once = relocate_url(url, prefix, true).unwrap();
                assert_eq!(relocate_url(&once, prefix, true).unwrap(), once, "{url} under {prefix}");
            }
        }
    }

    const VALUES: &str = "image:\n  registry: docker.io\n  repository: redpandadata/redpanda\n  tag: latest\ncontroller:\n  image:\n    repository: quay.io/jetstack/cert-manager-controller\n    tag: latest\n";

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_chart(
            dir.path(),
            "demo",
            Some("- name: app\n  image: example.test/app:1.0"),
            VALUES,
        );
        write_chart(
            &dir.path().join("charts/cache"),
            "cache",
            Some("- name: redis\n  image: redis:7"),
            "image:\n  repository: bitnami/redis\n  tag: '7'\n",
        );
        let mut lock = ImagesLock::new(LockChart {
            name: "demo".into(),
            version: "1.0.0".into(),
            app_version: String::new(),
        });
        lock.insert(ChartImage {
            name: "app".into(),
            image: "example.test/app:1.0".into(),
            chart: "demo".into(),
            digests: vec![PlatformDigest::new("linux/amd64", Digest::of(b"amd"))],
        });
        lock.to_path(&dir.path().join(LOCK_FILE)).unwrap();
        dir
    }

    #[test]
    fn values_keep_their_shape() {
        let dir = fixture();
        relocate_chart(dir.path(), "ecr.example/kafka", &RelocateOptions::default()).unwrap();

        let values: serde_yml::Value =
            serde_yml::from_str(&fs::read_to_string(dir.path().join(VALUES_FILE)).unwrap())
                .unwrap();
        assert_eq!(values["image"]["registry"].as_str(), Some("ecr.example"));
        assert_eq!(
            values["image"]["repository"].as_str(),
            Some("kafka/redpandadata/redpanda")
        );
        assert_eq!(values["image"]["tag"].as_str(), Some("latest"));
        assert!(values["image"].get("digest").is_none());
        assert_eq!(
            values["controller"]["image"]["repository"].as_str(),
            Some("ecr.example/kafka/jetstack/cert-manager-controller")
        );
        assert!(values["controller"]["image"].get("registry").is_none());
    }

    #[test]
    fn every_target_is_rewritten() {
        let dir = fixture();
        relocate_chart(dir.path(), "oci://new.example/proj", &RelocateOptions::default()).unwrap();

        let chart = Chart::load(dir.path()).unwrap();
        assert_eq!(
            chart.annotated_images(DEFAULT_ANNOTATIONS_KEY).unwrap()[0].image,
            "new.example/proj/app:1.0"
        );
        assert_eq!(
            chart.subcharts[0].annotated_images(DEFAULT_ANNOTATIONS_KEY).unwrap()[0].image,
            "new.example/proj/redis:7"
        );
        let sub_values = fs::read_to_string(dir.path().join("charts/cache/values.yaml")).unwrap();
        assert!(sub_values.contains("new.example/proj/bitnami/redis"));

        let lock = ImagesLock::from_path(&dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(lock.images[0].image, "new.example/proj/app:1.0");

        let snapshot = |dir: &Path| {
            [VALUES_FILE, CHART_FILE, LOCK_FILE, "charts/cache/values.yaml"]
                .map(|f| fs::read_to_string(dir.join(f)).unwrap())
        };
        let first = snapshot(dir.path());
        relocate_chart(dir.path(), "oci://new.example/proj", &RelocateOptions::default()).unwrap();
        assert_eq!(snapshot(dir.path()), first);
    }

    #[test]
    fn subcharts_are_left_alone_unless_recursive() {
        let dir = fixture();
        let options = RelocateOptions {
            recursive: false,
            ..Default::default()
        };
        relocate_chart(dir.path(), "new.example", &options).unwrap();
        let sub_values = fs::read_to_string(dir.path().join("charts/cache/values.yaml")).unwrap();
        assert!(!sub_values.contains("new.example"));
    }

    #[test]
    fn bad_annotations_are_reported() {
        let dir = fixture();
        write_chart(
            &dir.path().join("charts/broken"),
            "broken",
            Some("- name: bad\n  image: 'UPPER/Case:!'"),
            "",
        );
        let err = relocate_chart(dir.path(), "new.example", &RelocateOptions::default())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("UPPER/Case"));
        // the other charts are still relocated
        let lock = ImagesLock::from_path(&dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(lock.images[0].image, "new.example/app:1.0");
    }
}
