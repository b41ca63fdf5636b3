//! Directory-backed bundle store.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{
    BundleError, BundleFile, BundleLocation, BundleManifest, BundleStore, Result, validate_id,
};
use crate::ledger::fsync::{fsync_dir, fsync_file};
use crate::types::BundleId;

const MANIFEST_FILE: &str = "manifest.json";

/// Stores each bundle as a directory under a root.
///
/// Uploads are staged in a hidden directory and renamed into place, so a
/// bundle directory is either complete or absent.
#[derive(Debug, Clone)]
pub struct DirBundleStore {
    root: PathBuf,
}

impl DirBundleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirBundleStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundle_dir(&self, id: &BundleId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn read_manifest(&self, location: &BundleLocation) -> Result<BundleManifest> {
        let content = match fs::read_to_string(location.root.join(MANIFEST_FILE)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BundleError::UnknownBundle(location.id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }
}

impl BundleStore for DirBundleStore {
    fn upload(&self, id: &BundleId, source: &Path) -> Result<BundleLocation> {
        validate_id(id)?;
        if !source.is_dir() {
            return Err(BundleError::NotADirectory(source.to_path_buf()));
        }
        let target = self.bundle_dir(id);
        if target.exists() {
            return Err(BundleError::AlreadyExists(id.clone()));
        }

        fs::create_dir_all(&self.root)?;
        let staging = self
            .root
            .join(format!(".{}.{}", id, uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&staging)?;

        let result = stage(id, source, &staging);
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        let manifest = result?;

        if target.exists() {
            let _ = fs::remove_dir_all(&staging);
            return Err(BundleError::AlreadyExists(id.clone()));
        }
        fs::rename(&staging, &target)?;
        fsync_dir(&self.root)?;

        info!(bundle = %id, files = manifest.files.len(), "stored bundle");
        Ok(BundleLocation {
            id: id.clone(),
            root: target,
        })
    }

    fn download(&self, location: &BundleLocation, dest: &Path) -> Result<BundleManifest> {
        let manifest = self.read_manifest(location)?;

        for file in &manifest.files {
            let relative = safe_relative(&file.path)?;
            let data = fs::read(location.root.join(&relative))?;
            let actual = digest(&data);
            if actual != file.sha256 {
                return Err(BundleError::DigestMismatch {
                    path: file.path.clone(),
                    expected: file.sha256.clone(),
                    actual,
                });
            }

            let out = dest.join(&relative);
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&out, &data)?;
            debug!(path = %file.path, "restored bundle file");
        }

        info!(bundle = %location.id, files = manifest.files.len(), dest = %dest.display(), "downloaded bundle");
        Ok(manifest)
    }

    fn locate(&self, id: &BundleId) -> Result<BundleLocation> {
        validate_id(id)?;
        let root = self.bundle_dir(id);
        if !root.join(MANIFEST_FILE).is_file() {
            return Err(BundleError::UnknownBundle(id.clone()));
        }
        Ok(BundleLocation {
            id: id.clone(),
            root,
        })
    }
}

/// Copies `source` into `staging` and writes the manifest.
fn stage(id: &BundleId, source: &Path, staging: &Path) -> Result<BundleManifest> {
    let mut files = Vec::new();
    for relative in list_files(source)? {
        let data = fs::read(source.join(&relative))?;
        let out = staging.join(&relative);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        file.write_all(&data)?;
        fsync_file(&file)?;

        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(BundleFile {
            path,
            sha256: digest(&data),
            size: data.len() as u64,
        });
    }

    let manifest = BundleManifest {
        id: id.clone(),
        created_at: Utc::now(),
        files,
    };
    let mut file = File::create(staging.join(MANIFEST_FILE))?;
    serde_json::to_writer_pretty(&mut file, &manifest)?;
    writeln!(file)?;
    fsync_file(&file)?;
    Ok(manifest)
}

/// Regular files under `dir`, relative to it, in sorted order. Symlinks are
/// skipped.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        for entry in fs::read_dir(dir.join(&relative))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = relative.join(entry.file_name());
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Rejects manifest paths that would escape the destination.
fn safe_relative(path: &str) -> Result<PathBuf> {
    let relative = PathBuf::from(path);
    let safe = !path.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(relative)
    } else {
        Err(BundleError::UnsafePath(path.to_string()))
    }
}

fn digest(data: &[u8]) -> String {
    crate::types::spec::hex(&Sha256::digest(data))
}
