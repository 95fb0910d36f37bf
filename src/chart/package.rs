// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Packaged charts and their OCI representation.
use std::ffi::OsStr;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use tar::Archive;

use super::{ChartMetadata, CHART_FILE};
use crate::archive;
use crate::digest::Digest;
use crate::manifest::{descriptor, descriptor_digest, manifest_bytes, parse_manifest};
use crate::reference::ImageReference;
use crate::registry::{HELM_CONFIG_MEDIA_TYPE, HELM_CONTENT_MEDIA_TYPE, OCI_IMAGE_MANIFEST};
use crate::session::Session;

pub const OCI_SCHEME: &str = "oci://";

/// Package the chart in `dir` as `<out_dir>/<name>-<version>.tgz`.
pub fn package(dir: &Path, out_dir: &Path) -> Result<PathBuf> {
    let metadata = ChartMetadata::from_path(&dir.join(CHART_FILE))?;
    fs::create_dir_all(out_dir)?;
    let dest = out_dir.join(format!("{}-{}.tgz", metadata.name, metadata.version));
    archive::tar_dir(dir, &metadata.name, &dest)
        .context(format!("Failed to package chart {}", metadata.name))?;
    Ok(dest)
}

/// Read `<chart name>/Chart.yaml` from a packaged chart.
pub fn chart_json_from_archive(tgz_path: impl AsRef<Path>) -> Result<serde_json::Value> {
    let tgz_path = tgz_path.as_ref();
    let tgz = File::open(tgz_path)
        .context(format!("Failed to open helm chart {}", tgz_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(tgz));
    let mut chart_yaml_entry = archive
        .entries()?
        .find(|entry| {
            entry
                .as_ref()
                .ok()
                .and_then(|entry| entry.path().ok())
                // <chart name>/Chart.yaml, the chart name is not known yet
                .map(|p| {
                    p.components().count() == 2 && p.file_name() == Some(OsStr::new(CHART_FILE))
                })
                .unwrap_or(false)
        })
        .ok_or_else(|| anyhow!("Chart.yaml not found in the helm chart"))??;
    let mut contents = Vec::new();
    std::io::copy(&mut chart_yaml_entry, &mut contents)?;
    Ok(serde_yml::from_slice(&contents)?)
}

/// Parse an `oci://host/path[:tag]` chart URL.
pub fn parse_oci_url(url: &str) -> Result<ImageReference> {
    let stripped = url.strip_prefix(OCI_SCHEME).unwrap_or(url);
    Ok(ImageReference::parse(stripped)?)
}

/// Registry tags cannot hold `+`, Helm maps it to `_`.
pub fn version_tag(version: &str) -> String {
    version.replace('+', "_")
}

/// Pull the chart at `reference` and expand it into `dest`.
pub async fn pull_chart(session: &Session, reference: &ImageReference, dest: &Path) -> Result<Digest> {
    let registry = session.registry.as_ref();
    let manifest = session
        .retry("fetching chart manifest", move || registry.fetch_manifest(reference))
        .await
        .context(format!("Failed to fetch chart {}", reference))?;
    let image = parse_manifest(&manifest.bytes)?;
    let layers = image.layers();
    let layer = layers
        .iter()
        .find(|l| l.media_type().to_string() == HELM_CONTENT_MEDIA_TYPE)
        .or_else(|| (layers.len() == 1).then(|| &layers[0]))
        .ok_or_else(|| anyhow!("{} is not a Helm chart", reference))?;
    let layer_digest = descriptor_digest(layer)?;

    let tgz = tempfile::NamedTempFile::new()?;
    let (layer_digest, tgz_path) = (&layer_digest, tgz.path());
    session
        .retry("pulling chart", move || registry.pull_blob(reference, layer_digest, tgz_path))
        .await
        .context(format!("Failed to pull chart {}", reference))?;
    archive::untar(tgz.path(), dest, 1)?;
    Ok(manifest.digest)
}

/// Push a packaged chart to `<repository>/<name>:<version>`.
pub async fn push_chart(session: &Session, tgz_path: &Path, repository: &str) -> Result<ImageReference> {
    let chart = chart_json_from_archive(tgz_path)?;
    let field = |name: &str| {
        chart[name]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Chart.yaml doesn't contain a {} field", name))
    };
    let (name, version) = (field("name")?, field("version")?);
    let repository = repository.strip_prefix(OCI_SCHEME).unwrap_or(repository);
    let reference = ImageReference::parse(&format!(
        "{}/{}:{}",
        repository.trim_end_matches('/'),
        name,
        version_tag(&version)
    ))?;

    let config = serde_json::to_vec(&chart)?;
    let layer = fs::read(tgz_path).context(format!("Failed to read `{}`", tgz_path.display()))?;
    let (config_digest, layer_digest) = (Digest::of(&config), Digest::of(&layer));
    let manifest = manifest_bytes(
        descriptor(HELM_CONFIG_MEDIA_TYPE, &config_digest, config.len())?.build()?,
        vec![descriptor(HELM_CONTENT_MEDIA_TYPE, &layer_digest, layer.len())?.build()?],
    )?;

    let registry = session.registry.as_ref();
    let target = &reference;
    let (config, layer, manifest) = (&config, &layer, &manifest);
    let (config_digest, layer_digest) = (&config_digest, &layer_digest);
    session
        .retry("pushing chart", move || async move {
            registry
                .push_blob(target, config_digest, config.clone())
                .await?;
            registry
                .push_blob(target, layer_digest, layer.clone())
                .await?;
            registry
                .push_manifest(target, manifest.clone(), OCI_IMAGE_MANIFEST)
                .await
        })
        .await
        .context(format!("Failed to push chart to {}", reference))?;
    Ok(reference)
}
