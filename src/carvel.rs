// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Carvel imgpkg bundle files written next to a wrapped chart.
//!
//! `images.yml` can only list one digest per image, so a single platform is
//! picked (`linux/amd64` unless told otherwise) and the others are left out.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::chart::{ChartMetadata, CHART_FILE};
use crate::lock::ImagesLock;
use crate::reference::ImageReference;

pub const IMGPKG_DIR: &str = ".imgpkg";
pub const BUNDLE_FILE: &str = "bundle.yml";
pub const IMAGES_FILE: &str = "images.yml";

pub const API_VERSION: &str = "imgpkg.carvel.dev/v1alpha1";
pub const BUNDLE_KIND: &str = "Bundle";
pub const IMAGES_LOCK_KIND: &str = "ImagesLock";

pub const DEFAULT_PLATFORM: &str = "linux/amd64";

/// Annotation holding the image reference an entry was locked from.
pub const KBLD_ID: &str = "kbld.carvel.dev/id";

/// Chart.yaml annotations copied into the bundle metadata.
const COPIED_ANNOTATIONS: [&str; 2] = ["category", "licenses"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Website {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub websites: Vec<Website>,
}

impl Bundle {
    /// Bundle description of a chart: maintainers become authors, `home` and
    /// `sources` become websites.
    pub fn from_chart(metadata: &ChartMetadata) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert("name".to_string(), metadata.name.clone());
        meta.insert("version".to_string(), metadata.version.clone());
        for key in COPIED_ANNOTATIONS {
            if let Some(value) = metadata.annotations.get(key) {
                meta.insert(key.to_string(), value.clone());
            }
        }
        let websites = metadata
            .home
            .iter()
            .chain(metadata.sources.iter())
            .map(|url| Website { url: url.clone() })
            .collect();
        Self {
            api_version: API_VERSION.to_string(),
            kind: BUNDLE_KIND.to_string(),
            metadata: meta,
            authors: metadata
                .maintainers
                .iter()
                .map(|m| Author {
                    name: m.name.clone(),
                    email: m.email.clone(),
                })
                .collect(),
            websites,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleImage {
    pub image: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// `images.yml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleImages {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub images: Vec<BundleImage>,
}

impl BundleImages {
    /// One `<repository>@<digest>` entry per locked image, for `platform` only.
    pub fn from_lock(lock: &ImagesLock, platform: &str) -> Result<Self> {
        let mut images = Vec::with_capacity(lock.images.len());
        for image in &lock.images {
            let Some(digest) = image.digests.iter().find(|d| d.arch == platform) else {
                tracing::warn!(image = %image.image, platform, "Image left out of images.yml");
                continue;
            };
            let reference = ImageReference::parse(&image.image)?;
            let mut annotations = BTreeMap::new();
            annotations.insert(KBLD_ID.to_string(), image.image.clone());
            images.push(BundleImage {
                image: format!("{}@{}", reference.canonical_name(), digest.digest),
                annotations,
            });
        }
        Ok(Self {
            api_version: API_VERSION.to_string(),
            kind: IMAGES_LOCK_KIND.to_string(),
            images,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).context(format!("Failed to read `{}`", path.display()))?;
        serde_yml::from_str(&contents).context(format!("Failed to parse `{}`", path.display()))
    }

    pub fn to_path(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_yml::to_string(self)?)
            .context(format!("Failed to write `{}`", path.display()))
    }
}

pub fn images_path(chart_dir: &Path) -> PathBuf {
    chart_dir.join(IMGPKG_DIR).join(IMAGES_FILE)
}

/// Write `.imgpkg/bundle.yml` and `.imgpkg/images.yml` into `chart_dir`.
pub fn write_bundle(chart_dir: &Path, lock: &ImagesLock, platform: &str) -> Result<()> {
    let metadata = ChartMetadata::from_path(&chart_dir.join(CHART_FILE))?;
    let dir = chart_dir.join(IMGPKG_DIR);
    fs::create_dir_all(&dir).context(format!("Failed to create `{}`", dir.display()))?;

    let bundle = Bundle::from_chart(&metadata);
    let bundle_path = dir.join(BUNDLE_FILE);
    fs::write(&bundle_path, serde_yml::to_string(&bundle)?)
        .context(format!("Failed to write `{}`", bundle_path.display()))?;

    BundleImages::from_lock(lock, platform)?.to_path(&dir.join(IMAGES_FILE))
}
