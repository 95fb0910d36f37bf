// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Helm charts on disk.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::archive;
use crate::error::Error;
use crate::workdir;

pub mod annotate;
pub mod package;
pub mod values;

pub const CHART_FILE: &str = "Chart.yaml";
pub const VALUES_FILE: &str = "values.yaml";
pub const LOCK_FILE: &str = "Images.lock";
pub const CHARTS_DIR: &str = "charts";

/// Chart.yaml annotation listing the images a chart deploys.
pub const DEFAULT_ANNOTATIONS_KEY: &str = "images";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Maintainer {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// The parts of `Chart.yaml` this tool reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    #[serde(default)]
    pub api_version: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub maintainers: Vec<Maintainer>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl ChartMetadata {
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).context(format!("Failed to read `{}`", path.display()))?;
        serde_yml::from_str(&contents).context(format!("Failed to parse `{}`", path.display()))
    }
}

/// One `{name, image}` entry of the images annotation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnnotatedImage {
    pub name: String,
    pub image: String,
}

/// Parse the YAML list held in an images annotation.
pub fn parse_annotated_images(value: &str) -> Result<Vec<AnnotatedImage>> {
    if value.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yml::from_str::<Option<Vec<AnnotatedImage>>>(value)
        .map(Option::unwrap_or_default)
        .context("Failed to parse images annotation")
}

/// A chart and its loaded subcharts.
#[derive(Debug, Clone)]
pub struct Chart {
    pub dir: PathBuf,
    pub metadata: ChartMetadata,
    pub subcharts: Vec<Chart>,
}

impl Chart {
    /// Load the chart rooted at `dir`.
    ///
    /// Packaged subcharts under `charts/` are extracted into the working
    /// directory. Every declared dependency must be present.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let metadata = ChartMetadata::from_path(&dir.join(CHART_FILE))?;
        let subcharts = load_subcharts(&dir.join(CHARTS_DIR))
            .context(format!("Failed to load subcharts of `{}`", metadata.name))?;

        let missing: Vec<String> = metadata
            .dependencies
            .iter()
            .filter(|dep| {
                !subcharts.iter().any(|sub| {
                    sub.metadata.name == dep.name || Some(&sub.metadata.name) == dep.alias.as_ref()
                })
            })
            .map(|dep| dep.alias.clone().unwrap_or_else(|| dep.name.clone()))
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingDependencies {
                chart: metadata.name,
                missing,
            }
            .into());
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            metadata,
            subcharts,
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    /// `<name>-<version>`
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.metadata.name, self.metadata.version)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Images declared by this chart alone.
    pub fn annotated_images(&self, annotations_key: &str) -> Result<Vec<AnnotatedImage>> {
        match self.metadata.annotations.get(annotations_key) {
            Some(value) => parse_annotated_images(value)
                .context(format!("Invalid `{}` annotation in chart {}", annotations_key, self.name())),
            None => Ok(Vec::new()),
        }
    }
}

fn load_subcharts(charts_dir: &Path) -> Result<Vec<Chart>> {
    if !charts_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(charts_dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    paths.sort();

    let mut subcharts = Vec::new();
    for path in paths {
        if path.is_dir() && path.join(CHART_FILE).is_file() {
            subcharts.push(Chart::load(&path)?);
        } else if is_packaged_chart(&path) {
            let extracted = workdir::subdir("subchart-")?.join("chart");
            archive::untar(&path, &extracted, 1)?;
            subcharts.push(Chart::load(&extracted)?);
        }
    }
    Ok(subcharts)
}

pub fn is_packaged_chart(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".tgz") || n.ends_with(".tar.gz"))
}

/// Replace every packaged subchart under `dir/charts` by its expanded directory.
pub fn expand_packaged_subcharts(dir: &Path) -> Result<()> {
    let charts_dir = dir.join(CHARTS_DIR);
    if !charts_dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&charts_dir)? {
        let path = entry?.path();
        if !is_packaged_chart(&path) {
            continue;
        }
        let name = archive::top_level_dir(&path)?
            .ok_or_else(|| anyhow!("`{}` is an empty archive", path.display()))?;
        let target = charts_dir.join(&name);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        archive::untar(&path, &target, 1)?;
        fs::remove_file(&path)?;
        tracing::debug!(subchart = %name, "Expanded packaged subchart");
    }
    Ok(())
}

/// Rewrite one annotation of `Chart.yaml` without touching anything else.
pub fn write_annotation(dir: &Path, key: &str, value: String) -> Result<()> {
    let path = dir.join(CHART_FILE);
    let contents =
        fs::read_to_string(&path).context(format!("Failed to read `{}`", path.display()))?;
    let mut doc: serde_yml::Value =
        serde_yml::from_str(&contents).context(format!("Failed to parse `{}`", path.display()))?;
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| anyhow!("`{}` is not a mapping", path.display()))?;
    let annotations = root
        .entry(serde_yml::Value::from("annotations"))
        .or_insert_with(|| serde_yml::Value::Mapping(Default::default()));
    if annotations.is_null() {
        *annotations = serde_yml::Value::Mapping(Default::default());
    }
    let annotations = annotations
        .as_mapping_mut()
        .ok_or_else(|| anyhow!("annotations of `{}` are not a mapping", path.display()))?;
    annotations.insert(serde_yml::Value::from(key), serde_yml::Value::from(value));
    fs::write(&path, serde_yml::to_string(&doc)?)
        .context(format!("Failed to write `{}`", path.display()))
}

/// Serialize images the way the annotation stores them.
pub fn format_annotated_images(images: &[AnnotatedImage]) -> Result<String> {
    Ok(serde_yml::to_string(images)?)
}
