// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Local [OCI image layout](https://github.com/opencontainers/image-spec/blob/main/image-layout.md)
//! directories holding pulled images and artifacts.
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use ocidir::cap_std::fs::Dir;
use ocidir::OciDir;
use tempfile::NamedTempFile;

use crate::digest::Digest;
use crate::error::Error;
use crate::manifest::{self, Descriptor, ImageIndex};
use crate::registry::{is_image_manifest, RawManifest};
use crate::sha256_writer::sha256_hex_of;

const INDEX_FILE: &str = "index.json";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// An OCI layout directory on disk.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Create an empty layout at `root`, replacing whatever was there.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if root.exists() {
            fs::remove_dir_all(root)
                .context(format!("Failed to remove stale layout `{}`", root.display()))?;
        }
        fs::create_dir_all(root)
            .context(format!("Failed to create OCI layout directory `{}`", root.display()))?;
        let dir = Dir::open_ambient_dir(root, ocidir::cap_std::ambient_authority())
            .context("Failed to open layout directory")?;
        OciDir::ensure(&dir)?;
        let layout = Self {
            root: root.to_path_buf(),
        };
        layout.write_index(Vec::new())?;
        Ok(layout)
    }

    /// Open an existing layout.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.join(INDEX_FILE).is_file() {
            bail!("`{}` is not an OCI layout directory", root.display());
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.hex())
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    pub fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).context(format!("Failed to read blob `{}`", path.display()))
    }

    /// Store `data`, refusing content that does not hash to `digest`.
    pub fn write_blob(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let actual = Digest::of(data);
        if &actual != digest {
            bail!("blob digest mismatch: expected {}, got {}", digest, actual);
        }
        let path = self.blob_path(digest);
        fs::write(&path, data).context(format!("Failed to write blob `{}`", path.display()))
    }

    /// Move a downloaded file into the blob store after checking its digest.
    pub fn import_blob(&self, digest: &Digest, file: NamedTempFile) -> Result<()> {
        let mut source = File::open(file.path())?;
        let actual = sha256_hex_of(&mut source)?;
        if actual != digest.hex() {
            bail!("blob digest mismatch: expected {}, got sha256:{}", digest, actual);
        }
        let path = self.blob_path(digest);
        let (_, tmp_path) = file.keep()?;
        // May fail if tempfile on different filesystem
        if fs::rename(&tmp_path, &path).is_err() {
            fs::copy(&tmp_path, &path)
                .context(format!("Failed to write blob `{}`", path.display()))?;
            fs::remove_file(&tmp_path)?;
        }
        Ok(())
    }

    /// A temporary file next to the blob store, so that import is a rename.
    pub fn staging_file(&self) -> Result<NamedTempFile> {
        Ok(NamedTempFile::new_in(&self.root)?)
    }

    /// Point `index.json` at a single manifest, stored as a blob.
    pub fn set_manifest(&self, manifest: &RawManifest, ref_name: Option<&str>) -> Result<()> {
        self.write_blob(&manifest.digest, &manifest.bytes)?;
        let annotations: HashMap<_, _> = ref_name
            .map(|name| (REF_NAME_ANNOTATION.to_string(), name.to_string()))
            .into_iter()
            .collect();
        let mut entry = manifest::descriptor(
            &manifest.media_type,
            &manifest.digest,
            manifest.bytes.len(),
        )?;
        if !annotations.is_empty() {
            entry = entry.annotations(annotations);
        }
        self.write_index(vec![entry.build()?])
    }

    fn write_index(&self, manifests: Vec<Descriptor>) -> Result<()> {
        let index_path = self.root.join(INDEX_FILE);
        manifest::new_index(manifests)?
            .to_file(&index_path)
            .context(format!(
                "Failed to write index.json file `{}`",
                index_path.display()
            ))
    }

    pub fn entries(&self) -> Result<Vec<Descriptor>> {
        let index_path = self.root.join(INDEX_FILE);
        let index = ImageIndex::from_file(&index_path)
            .context(format!("Failed to read `{}`", index_path.display()))?;
        Ok(index.manifests().clone())
    }

    /// The only manifest of the layout, whatever its kind.
    pub fn single_manifest(&self) -> Result<RawManifest> {
        let mut entries = self.entries()?;
        if entries.len() != 1 {
            return Err(Error::MultipleLayoutEntries {
                path: self.root.display().to_string(),
                count: entries.len(),
            }
            .into());
        }
        let entry = entries.remove(0);
        let digest = manifest::descriptor_digest(&entry)?;
        let bytes = self.read_blob(&digest)?;
        let mut manifest = RawManifest::new(bytes, digest);
        manifest.media_type = entry.media_type().to_string();
        Ok(manifest)
    }

    /// The only manifest of the layout, which must be a single-platform image.
    pub fn single_image(&self) -> Result<RawManifest> {
        let manifest = self.single_manifest()?;
        if !is_image_manifest(&manifest.media_type) {
            return Err(Error::NotAnImageLayout {
                path: self.root.display().to_string(),
                media_type: manifest.media_type,
            }
            .into());
        }
        Ok(manifest)
    }
}

/// `<dir>/<HEX>.layout`, where images for `digest` are kept.
pub fn image_layout_dir(dir: &Path, digest: &Digest) -> PathBuf {
    dir.join(format!("{}.layout", digest.hex()))
}

/// Fail with [`Error::LocalArtifactNotExist`] unless `dir` exists.
pub fn require_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(anyhow!(Error::LocalArtifactNotExist(dir.display().to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::OCI_IMAGE_INDEX;

    fn manifest(body: &str) -> RawManifest {
        let bytes = body.as_bytes().to_vec();
        let digest = Digest::of(&bytes);
        RawManifest::new(bytes, digest)
    }

    #[test]
    fn single_image_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::create(dir.path().join("a.layout")).unwrap();
        assert!(layout.root().join("oci-layout").is_file());
        assert!(layout.entries().unwrap().is_empty());

        let m = manifest(r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"digest":"x"},"layers":[]}"#);
        layout.set_manifest(&m, Some("1.0")).unwrap();
        let entries = layout.entries().unwrap();
        assert_eq!(
            entries[0].annotations().as_ref().unwrap()[REF_NAME_ANNOTATION],
            "1.0"
        );

        let reopened = Layout::open(layout.root()).unwrap();
        let read = reopened.single_image().unwrap();
        assert_eq!(read.digest, m.digest);
        assert_eq!(read.bytes, m.bytes);
    }

    #[test]
    fn create_replaces_stale_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("b.layout");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("leftover"), b"partial").unwrap();
        Layout::create(&root).unwrap();
        assert!(!root.join("leftover").exists());
    }

    #[test]
    fn rejects_bad_blobs_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::create(dir.path().join("c.layout")).unwrap();
        assert!(layout.write_blob(&Digest::of(b"a"), b"b").is_err());

        let index = manifest(&format!(r#"{{"schemaVersion":2,"mediaType":"{}","manifests":[]}}"#, OCI_IMAGE_INDEX));
        layout.set_manifest(&index, None).unwrap();
        assert!(layout.single_manifest().is_ok());
        let err = layout.single_image().unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(Error::NotAnImageLayout { .. })
        ));

        let empty = Layout::create(dir.path().join("d.layout")).unwrap();
        let err = empty.single_manifest().unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(Error::MultipleLayoutEntries { count: 0, .. })
        ));
    }

    #[test]
    fn missing_directories_are_local_artifact_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = require_dir(&dir.path().join("nope")).unwrap_err();
        assert!(crate::error::is_local_artifact_missing(&err));
        assert!(require_dir(dir.path()).is_ok());
    }
}
