// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! The wrap pipeline and the on-disk wrap directory.
//!
//! ```text
//! <root>/
//!   chart/          the chart, with Images.lock and optional .imgpkg/
//!   images/         <HEX>.layout/ per platform digest
//!   artifacts/      image and chart metadata/signature layouts
//! ```
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::archive;
use crate::carvel;
use crate::chart::package::{parse_oci_url, pull_chart, OCI_SCHEME};
use crate::chart::{ChartMetadata, CHART_FILE, LOCK_FILE};
use crate::error::Error;
use crate::lock::{generate, ImagesLock, LockOptions};
use crate::reference::ImageReference;
use crate::session::Session;
use crate::transport::{artifacts, pull_images, TransportOptions};
use crate::workdir;

pub const CHART_DIR: &str = "chart";
pub const IMAGES_DIR: &str = "images";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const WRAP_SUFFIX: &str = ".wrap.tgz";

/// An expanded wrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapDir {
    root: PathBuf,
}

impl WrapDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open a local wrap: an expanded directory as is, an archive expanded
    /// into the working directory.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::WrapNotFound(path.display().to_string()).into());
        }
        let wrap = if path.is_dir() {
            Self::new(path)
        } else {
            let dest = workdir::subdir("wrap-")?.join("wrap");
            archive::untar(path, &dest, 1)
                .context(format!("Failed to expand `{}`", path.display()))?;
            Self::new(dest)
        };
        if !wrap.chart_dir().join(CHART_FILE).is_file() {
            bail!("`{}` is not a wrap, it holds no chart", path.display());
        }
        Ok(wrap)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chart_dir(&self) -> PathBuf {
        self.root.join(CHART_DIR)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.chart_dir().join(LOCK_FILE)
    }

    pub fn has_artifacts(&self) -> bool {
        fs::read_dir(self.artifacts_dir()).is_ok_and(|mut entries| entries.next().is_some())
    }

    pub fn metadata(&self) -> Result<ChartMetadata> {
        ChartMetadata::from_path(&self.chart_dir().join(CHART_FILE))
    }

    /// The lock of the wrapped chart, if it has one.
    pub fn lock(&self) -> Result<Option<ImagesLock>> {
        let path = self.lock_path();
        if !path.is_file() {
            return Ok(None);
        }
        ImagesLock::from_path(&path).map(Some)
    }
}

/// Copy the tree at `src` to `dest`.
pub(crate) fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).context(format!("Failed to create `{}`", dest.display()))?;
    for entry in fs::read_dir(src).context(format!("Failed to read `{}`", src.display()))? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .context(format!("Failed to copy `{}`", entry.path().display()))?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WrapOptions {
    /// Archive to write, or directory to write it in. Defaults to
    /// `<name>-<version>.wrap.tgz` in the current directory.
    pub output: Option<PathBuf>,
    pub lock: LockOptions,
    /// Also carry metadata and signature artifacts.
    pub fetch_artifacts: bool,
    /// Leave images out of the wrap.
    pub skip_images: bool,
    /// Write `.imgpkg/bundle.yml` and `.imgpkg/images.yml`.
    pub carvel_bundle: bool,
    /// Platform listed in `.imgpkg/images.yml`.
    pub carvel_platform: String,
}

impl Default for WrapOptions {
    fn default() -> Self {
        Self {
            output: None,
            lock: LockOptions::default(),
            fetch_artifacts: false,
            skip_images: false,
            carvel_bundle: false,
            carvel_platform: carvel::DEFAULT_PLATFORM.to_string(),
        }
    }
}

/// A finished wrap.
#[derive(Debug, Clone)]
pub struct Wrapped {
    pub path: PathBuf,
    /// Hex sha256 of the archive.
    pub sha256: String,
    pub lock: ImagesLock,
}

/// Wrap the chart at `input` (directory, packaged chart or `oci://` URL) with
/// all its images into a single archive.
pub async fn wrap(session: &Session, input: &str, options: &WrapOptions) -> Result<Wrapped> {
    let reporter = session.reporter();
    let wrap = WrapDir::new(workdir::subdir("wrap-")?);

    reporter.section("Wrapping", &format!("Helm chart {}", input));
    let remote = fetch_chart(session, input, &wrap.chart_dir())
        .await
        .map_err(|e| reporter.fail("Failed to load the chart", e))?;
    let metadata = wrap.metadata()?;
    let full_name = format!("{}-{}", metadata.name, metadata.version);

    if options.fetch_artifacts {
        if let Some(reference) = &remote {
            artifacts::pull_chart_artifacts(session, reference, &wrap.artifacts_dir())
                .await
                .map_err(|e| reporter.fail("Failed to fetch chart artifacts", e))?;
        }
    }

    let lock = lock_chart(session, &wrap, &options.lock)
        .await
        .map_err(|e| reporter.fail("Failed to lock images", e))?;

    if options.skip_images {
        reporter.step("Skipping", "image download");
    } else if !lock.images.is_empty() {
        reporter.section("Pulling", &format!("{} images", lock.images.len()));
        let transport = TransportOptions {
            fetch_artifacts: options.fetch_artifacts,
            artifacts_dir: Some(wrap.artifacts_dir()),
        };
        pull_images(session, &lock, &wrap.images_dir(), &transport)
            .await
            .map_err(|e| reporter.fail("Failed to pull images", e))?;
        reporter.step("Pulled", &format!("{} platform images", lock.digest_count()));
    }

    if options.carvel_bundle {
        carvel::write_bundle(&wrap.chart_dir(), &lock, &options.carvel_platform)
            .map_err(|e| reporter.fail("Failed to write the Carvel bundle", e))?;
        reporter.step("Carvelized", "wrote .imgpkg/bundle.yml and .imgpkg/images.yml");
    }

    let path = output_path(options.output.as_deref(), &full_name)?;
    reporter.section("Compressing", &path.display().to_string());
    let sha256 = archive::tar_dir(wrap.root(), &full_name, &path)
        .map_err(|e| reporter.fail("Failed to write the wrap", e))?;
    reporter.step("Wrapped", &format!("{} (sha256:{})", path.display(), sha256));
    tracing::debug!(wrap = %path.display(), sha256 = %sha256, "Wrapped chart");
    Ok(Wrapped { path, sha256, lock })
}

/// Materialize the chart at `input` in `dest`; for OCI inputs, return where
/// it came from.
async fn fetch_chart(session: &Session, input: &str, dest: &Path) -> Result<Option<ImageReference>> {
    if input.starts_with(OCI_SCHEME) {
        let reference = parse_oci_url(input)?;
        let digest = pull_chart(session, &reference, dest).await?;
        session
            .reporter()
            .step("Pulled", &format!("{}@{}", reference.canonical_name(), digest));
        return Ok(Some(reference));
    }
    let path = Path::new(input);
    if path.is_dir() {
        if !path.join(CHART_FILE).is_file() {
            bail!("`{}` does not hold a {}", path.display(), CHART_FILE);
        }
        copy_dir(path, dest)?;
    } else if path.is_file() {
        archive::untar(path, dest, 1).context(format!("Failed to expand `{}`", path.display()))?;
    } else {
        bail!("chart `{}` does not exist", input);
    }
    Ok(None)
}

/// Verify the lock shipped with the chart, or create one.
async fn lock_chart(session: &Session, wrap: &WrapDir, options: &LockOptions) -> Result<ImagesLock> {
    let reporter = session.reporter();
    let chart_dir = wrap.chart_dir();
    match wrap.lock()? {
        Some(existing) => {
            reporter.section("Verifying", "Images.lock");
            let live = generate(session, &chart_dir, options).await?;
            existing
                .validate(&live)
                .context("Images.lock does not match the images the chart references")?;
            reporter.step("Verified", &format!("{} images", existing.images.len()));
            Ok(existing)
        }
        None => {
            reporter.section("Locking", "images");
            let lock = generate(session, &chart_dir, options).await?;
            lock.to_path(&wrap.lock_path())?;
            reporter.step("Locked", &format!("{} images", lock.images.len()));
            Ok(lock)
        }
    }
}

fn output_path(output: Option<&Path>, full_name: &str) -> Result<PathBuf> {
    let file_name = format!("{}{}", full_name, WRAP_SUFFIX);
    Ok(match output {
        Some(path) if path.is_dir() => path.join(file_name),
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir()?.join(file_name),
    })
}
