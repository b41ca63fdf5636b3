//! Immutable deployment bundles.
//!
//! A bundle is the set of rendered templates for one build, stored once under
//! its id and never modified afterwards. Redeploying a bundle id therefore
//! always deploys the same templates.
//!
//! # Layout (directory store)
//!
//! ```text
//! <root>/
//! └── <bundle_id>/
//!     ├── manifest.json   # every file with its SHA-256 digest
//!     └── templates/...   # files as uploaded
//! ```

pub mod dir;

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BundleId, TemplateRef};

pub use dir::DirBundleStore;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bundle {0} already exists; bundles are immutable")]
    AlreadyExists(BundleId),

    #[error("bundle {0} not found")]
    UnknownBundle(BundleId),

    #[error("invalid bundle id {0:?}: use letters, digits, '.', '_' and '-'")]
    InvalidId(String),

    #[error("bundle source {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("bundle manifest lists unsafe path {0:?}")]
    UnsafePath(String),

    #[error("digest mismatch for {path}: expected {expected}, found {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

pub type Result<T> = std::result::Result<T, BundleError>;

/// Where a stored bundle lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLocation {
    pub id: BundleId,
    pub root: PathBuf,
}

impl BundleLocation {
    /// Resolves a template against the bundle. URLs and absolute paths are
    /// returned unchanged.
    pub fn resolve(&self, template: &str) -> TemplateRef {
        let reference = TemplateRef::new(template);
        if reference.is_url() || Path::new(template).is_absolute() {
            return reference;
        }
        TemplateRef::new(self.root.join(template).to_string_lossy())
    }
}

/// One file of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    /// Path relative to the bundle root, `/`-separated.
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub id: BundleId,
    pub created_at: DateTime<Utc>,
    pub files: Vec<BundleFile>,
}

/// Durable storage for bundles.
pub trait BundleStore {
    /// Stores the contents of `source` as bundle `id`. Fails if `id` exists.
    fn upload(&self, id: &BundleId, source: &Path) -> Result<BundleLocation>;

    /// Copies a bundle into `dest`, verifying every file's digest.
    fn download(&self, location: &BundleLocation, dest: &Path) -> Result<BundleManifest>;

    /// Finds an existing bundle.
    fn locate(&self, id: &BundleId) -> Result<BundleLocation>;
}

/// Checks that a bundle id is safe to use as a directory name.
pub fn validate_id(id: &BundleId) -> Result<()> {
    let s = id.as_str();
    let valid = !s.is_empty()
        && s != "."
        && s != ".."
        && !s.starts_with('.')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BundleError::InvalidId(s.to_string()))
    }
}
