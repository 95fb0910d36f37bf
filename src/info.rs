// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! What a wrap holds.
use std::fmt;
use std::path::Path;

use anyhow::Result;

use crate::carvel::images_path;
use crate::chart::ChartMetadata;
use crate::layout::image_layout_dir;
use crate::lock::ImagesLock;
use crate::wrap::WrapDir;

#[derive(Debug, Clone)]
pub struct WrapInfo {
    pub chart: ChartMetadata,
    pub lock: Option<ImagesLock>,
    /// Whether image layouts were wrapped along with the lock.
    pub has_images: bool,
    pub has_artifacts: bool,
    pub has_carvel_bundle: bool,
}

/// Describe the wrap at `path`, an archive or an expanded directory.
pub fn info(path: &Path) -> Result<WrapInfo> {
    let wrap = WrapDir::open(path)?;
    let lock = wrap.lock()?;
    let images_dir = wrap.images_dir();
    let has_images = lock.as_ref().is_some_and(|lock| {
        let mut digests = lock.images.iter().flat_map(|i| &i.digests).peekable();
        digests.peek().is_some()
            && digests.all(|d| image_layout_dir(&images_dir, &d.digest).is_dir())
    });
    Ok(WrapInfo {
        chart: wrap.metadata()?,
        lock,
        has_images,
        has_artifacts: wrap.has_artifacts(),
        has_carvel_bundle: images_path(&wrap.chart_dir()).is_file(),
    })
}

impl fmt::Display for WrapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Chart: {} {}", self.chart.name, self.chart.version)?;
        if !self.chart.app_version.is_empty() {
            writeln!(f, "App version: {}", self.chart.app_version)?;
        }
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        writeln!(f, "Images wrapped: {}", yes_no(self.has_images))?;
        writeln!(f, "Artifacts: {}", yes_no(self.has_artifacts))?;
        writeln!(f, "Carvel bundle: {}", yes_no(self.has_carvel_bundle))?;
        let Some(lock) = &self.lock else {
            return writeln!(f, "No Images.lock");
        };
        writeln!(f, "Images:")?;
        for image in &lock.images {
            writeln!(f, "  {} ({}): {}", image.name, image.chart, image.image)?;
            for digest in &image.digests {
                writeln!(f, "    {:<16} {}", digest.arch, digest.digest)?;
            }
        }
        Ok(())
    }
}
