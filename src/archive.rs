// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Gzipped tar archives of wraps and charts.
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, HeaderMode};

use crate::error::Error;
use crate::sha256_writer::Sha256Writer;

/// Largest total payload an archive may expand to.
pub const MAX_UNTAR_SIZE: u64 = 8 << 30;

/// Archive `src` into `dest` with every entry under `prefix/`.
///
/// Entries are added in sorted order with normalized headers so the same tree
/// always yields the same archive. Returns the hex sha256 of the archive.
pub fn tar_dir(src: &Path, prefix: &str, dest: &Path) -> Result<String> {
    let file = File::create(dest).context(format!("Failed to create `{}`", dest.display()))?;
    let writer = Sha256Writer::new(file);
    let gz = GzEncoder::new(writer, Compression::default());
    let mut builder = Builder::new(gz);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    let prefix = Path::new(prefix);
    builder
        .append_dir(prefix, src)
        .context(format!("Failed to archive `{}`", src.display()))?;
    append_tree(&mut builder, src, prefix)?;

    let gz = builder.into_inner().context("Failed to finish tar stream")?;
    let mut writer = gz.finish().context("Failed to finish gzip stream")?;
    writer.flush()?;
    let (digest, _) = writer.finish();
    Ok(digest)
}

fn append_tree<W: Write>(builder: &mut Builder<W>, dir: &Path, name: &Path) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .context(format!("Failed to read `{}`", dir.display()))?
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let entry_name = name.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            builder.append_dir(&entry_name, &path)?;
            append_tree(builder, &path, &entry_name)?;
        } else {
            builder
                .append_path_with_name(&path, &entry_name)
                .context(format!("Failed to archive `{}`", path.display()))?;
        }
    }
    Ok(())
}

/// Expand a gzipped tar into `dest`, which must not exist yet.
///
/// The first `strip_components` path elements of every entry are dropped and
/// entries consumed entirely by the strip are skipped. Extraction happens in a
/// staging directory that is only renamed to `dest` once complete.
pub fn untar(archive: &Path, dest: &Path, strip_components: usize) -> Result<()> {
    untar_with_limit(archive, dest, strip_components, MAX_UNTAR_SIZE)
}

pub fn untar_with_limit(
    archive: &Path,
    dest: &Path,
    strip_components: usize,
    limit: u64,
) -> Result<()> {
    let file = File::open(archive).context(format!("Failed to open `{}`", archive.display()))?;
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".untar-")
        .tempdir_in(parent)
        .context(format!("Failed to create staging directory in `{}`", parent.display()))?;

    unpack_entries(GzDecoder::new(file), staging.path(), strip_components, limit)
        .context(format!("Failed to extract `{}`", archive.display()))?;

    let staged = staging.keep();
    fs::rename(&staged, dest).context(format!(
        "Failed to move extracted archive to `{}`",
        dest.display()
    ))?;
    Ok(())
}

fn unpack_entries(reader: impl Read, dest: &Path, strip: usize, limit: u64) -> Result<()> {
    let root = fs::canonicalize(dest)?;
    let mut archive = Archive::new(reader);
    let mut total: u64 = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        total = total.saturating_add(entry.header().size()?);
        if total > limit {
            return Err(Error::SizeExceeded { limit }.into());
        }
        let path = entry.path()?.into_owned();
        let Some(relative) = stripped(&path, strip)? else {
            continue;
        };
        let target = root.join(&relative);
        let kind = entry.header().entry_type();
        match kind {
            EntryType::Directory => {
                ensure_inside(&root, &target, &path)?;
                fs::create_dir_all(&target)?;
            }
            EntryType::Regular | EntryType::Continuous | EntryType::Symlink => {
                if kind == EntryType::Symlink {
                    let link = entry.link_name()?.unwrap_or_default().into_owned();
                    check_link(&relative, &link, &path)?;
                }
                if let Some(parent) = target.parent() {
                    ensure_inside(&root, parent, &path)?;
                    fs::create_dir_all(parent)?;
                }
                entry
                    .unpack(&target)
                    .context(format!("Failed to unpack `{}`", path.display()))?;
                if kind == EntryType::Symlink {
                    // links through links resolve for real now
                    if let Ok(resolved) = fs::canonicalize(&target) {
                        if !resolved.starts_with(&root) {
                            bail!("refusing archive link `{}` leaving the archive", path.display());
                        }
                    }
                }
            }
            // pax headers, hard links and the like carry nothing a chart needs
            other => tracing::debug!(path = %path.display(), kind = ?other, "Skipping tar entry"),
        }
    }
    Ok(())
}

/// Fail unless `path`, or its deepest existing ancestor, resolves inside `root`.
fn ensure_inside(root: &Path, path: &Path, entry: &Path) -> Result<()> {
    let inside = path
        .ancestors()
        .find(|p| p.exists())
        .map(fs::canonicalize)
        .transpose()?
        .is_some_and(|p| p.starts_with(root));
    if !inside {
        bail!("refusing archive entry `{}` written outside the archive", entry.display());
    }
    Ok(())
}

/// Fail when the symlink at `relative` points at `link` outside the archive root.
fn check_link(relative: &Path, link: &Path, entry: &Path) -> Result<()> {
    let mut depth = relative.components().count().saturating_sub(1);
    for component in link.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir if depth > 0 => depth -= 1,
            _ => bail!(
                "refusing archive link `{}` to `{}`",
                entry.display(),
                link.display()
            ),
        }
    }
    Ok(())
}

/// `path` without its first `strip` elements, `None` when nothing is left.
fn stripped(path: &Path, strip: usize) -> Result<Option<PathBuf>> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => bail!("refusing unsafe archive entry `{}`", path.display()),
        }
    }
    let rest: PathBuf = relative.components().skip(strip).collect();
    Ok((!rest.as_os_str().is_empty()).then_some(rest))
}

/// Name of the single top-level directory of a gzipped tar.
pub fn top_level_dir(archive: &Path) -> Result<Option<String>> {
    let file = File::open(archive).context(format!("Failed to open `{}`", archive.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let entry = entry?;
        if let Some(Component::Normal(first)) = entry.path()?.components().next() {
            return Ok(Some(first.to_string_lossy().into_owned()));
        }
    }
    Ok(None)
}
