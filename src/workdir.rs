// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Process-wide scratch directory.
//!
//! Created on first use and removed by [`teardown`], unless asked to keep it.
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::{const_mutex, Mutex};
use tempfile::TempDir;

static WORKDIR: Mutex<Option<TempDir>> = const_mutex(None);

/// The scratch directory, created if needed.
pub fn path() -> Result<PathBuf> {
    let mut guard = WORKDIR.lock();
    if let Some(dir) = guard.as_ref() {
        return Ok(dir.path().to_path_buf());
    }
    let dir = tempfile::Builder::new()
        .prefix("helmwrap-")
        .tempdir()
        .context("Failed to create working directory")?;
    let path = dir.path().to_path_buf();
    tracing::debug!(path = %path.display(), "Created working directory");
    *guard = Some(dir);
    Ok(path)
}

/// A fresh directory inside the scratch directory.
pub fn subdir(prefix: &str) -> Result<PathBuf> {
    let root = path()?;
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(&root)
        .context(format!("Failed to create directory in `{}`", root.display()))?;
    // Lifetime is tied to the scratch directory, not to this handle.
    Ok(dir.keep())
}

/// Remove the scratch directory, or keep it and return where it lives.
pub fn teardown(keep: bool) -> Result<Option<PathBuf>> {
    let Some(dir) = WORKDIR.lock().take() else {
        return Ok(None);
    };
    if keep {
        return Ok(Some(dir.keep()));
    }
    let path = dir.path().to_path_buf();
    dir.close()
        .context(format!("Failed to remove `{}`", path.display()))?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdirs_live_in_the_workdir() {
        let a = subdir("a-").unwrap();
        let b = subdir("b-").unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir());
        assert_eq!(a.parent(), Some(path().unwrap().as_path()));
    }
}
