// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! The `Images.lock` document pinning every image of a chart to its digests.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::PlatformDigest;
use crate::error::{Error, ErrorList};

mod generate;

pub use generate::{generate, LockOptions};

pub const API_VERSION: &str = "v0";
pub const KIND: &str = "ImagesLock";

pub const GENERATED_AT: &str = "generatedAt";
pub const GENERATED_BY: &str = "generatedBy";

/// Value of `metadata.generatedBy`.
pub fn generated_by() -> String {
    format!("helmwrap {}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockChart {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub app_version: String,
}

/// One image of a chart with the digests backing each platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartImage {
    pub name: String,
    pub image: String,
    pub chart: String,
    #[serde(default)]
    pub digests: Vec<PlatformDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesLock {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub chart: LockChart,
    #[serde(default)]
    pub images: Vec<ChartImage>,
}

impl ImagesLock {
    /// Empty lock stamped with the current time.
    pub fn new(chart: LockChart) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            GENERATED_AT.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        metadata.insert(GENERATED_BY.to_string(), generated_by());
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata,
            chart,
            images: Vec::new(),
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let lock: Self = serde_yml::from_str(contents).context("Failed to parse Images.lock")?;
        if lock.api_version != API_VERSION || lock.kind != KIND {
            bail!(
                "unsupported Images.lock: apiVersion '{}', kind '{}'",
                lock.api_version,
                lock.kind
            );
        }
        Ok(lock)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).context(format!("Failed to read `{}`", path.display()))?;
        Self::from_yaml(&contents).context(format!("Invalid lock file `{}`", path.display()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yml::to_string(self)?)
    }

    pub fn to_path(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml()?).context(format!("Failed to write `{}`", path.display()))
    }

    /// Add `image` unless the same `(chart, name, image)` is already listed.
    pub fn insert(&mut self, image: ChartImage) -> bool {
        if self
            .images
            .iter()
            .any(|i| i.chart == image.chart && i.name == image.name && i.image == image.image)
        {
            return false;
        }
        self.images.push(image);
        true
    }

    /// Number of `(image, platform)` pairs.
    pub fn digest_count(&self) -> usize {
        self.images.iter().map(|i| i.digests.len()).sum()
    }

    /// Check that every image of `expected` is in this lock with the same
    /// reference and the same digest for each of its platforms.
    pub fn validate(&self, expected: &ImagesLock) -> Result<()> {
        let mut errors = Vec::new();
        if self.images.len() != expected.images.len() {
            errors.push(anyhow::anyhow!(
                "number of images differs: {} in Images.lock, {} expected",
                self.images.len(),
                expected.images.len()
            ));
        }
        for want in &expected.images {
            let Some(have) = self
                .images
                .iter()
                .find(|i| i.chart == want.chart && i.name == want.name)
            else {
                errors.push(anyhow::anyhow!(
                    "image {}/{} ({}) not found in Images.lock",
                    want.chart,
                    want.name,
                    want.image
                ));
                continue;
            };
            if have.image != want.image {
                errors.push(anyhow::anyhow!(
                    "images do not match for {}/{}:\n- {}\n+ {}",
                    want.chart,
                    want.name,
                    want.image,
                    have.image
                ));
                continue;
            }
            for digest in &want.digests {
                match have.digests.iter().find(|d| d.arch == digest.arch) {
                    None => errors.push(anyhow::anyhow!(
                        "image {} is missing platform {} in Images.lock",
                        want.image,
                        digest.arch
                    )),
                    Some(found) if found.digest != digest.digest => {
                        errors.push(anyhow::anyhow!(
                            "digests do not match for {} ({}):\n- {}\n+ {}",
                            want.image,
                            digest.arch,
                            digest.digest,
                            found.digest
                        ))
                    }
                    Some(_) => {}
                }
            }
        }
        if errors.is_empty() {
            return Ok(());
        }
        Err(ErrorList(errors)).context(Error::LockMismatch)
    }
}
