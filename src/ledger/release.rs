//! Known-good release tracking.
//!
//! The release file records, per stack, the spec most recently deployed by a
//! successful run. Rollback restores from it. It is written atomically with
//! write-to-temp-then-rename, so a crash leaves either the old or the new
//! release on disk, never a mix.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Result;
use super::fsync::{fsync_dir, fsync_file};
use crate::types::{RunId, StackName, StackSpec};

const RELEASE_FILE: &str = "release.json";
const RELEASE_TMP_FILE: &str = "release.json.tmp";

/// The last known-good definition of every stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// The run that last changed the release.
    pub run_id: Option<RunId>,
    pub updated_at: Option<DateTime<Utc>>,
    pub stacks: BTreeMap<StackName, StackSpec>,
}

impl Release {
    /// Records the specs a successful run deployed.
    ///
    /// Stacks outside the run keep their previous known-good spec.
    pub fn record_success<'a>(
        &mut self,
        run_id: &RunId,
        specs: impl IntoIterator<Item = &'a StackSpec>,
    ) {
        for spec in specs {
            self.stacks.insert(spec.name.clone(), spec.clone());
        }
        self.run_id = Some(run_id.clone());
        self.updated_at = Some(Utc::now());
    }

    /// Forgets stacks that a teardown deleted.
    pub fn forget<'a>(&mut self, run_id: &RunId, names: impl IntoIterator<Item = &'a StackName>) {
        for name in names {
            self.stacks.remove(name);
        }
        self.run_id = Some(run_id.clone());
        self.updated_at = Some(Utc::now());
    }

    pub fn get(&self, name: &StackName) -> Option<&StackSpec> {
        self.stacks.get(name)
    }
}

/// Reads the release from `dir`. A missing file is an empty release.
pub fn read_release(dir: &Path) -> Result<Release> {
    match std::fs::read_to_string(dir.join(RELEASE_FILE)) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Release::default()),
        Err(e) => Err(e.into()),
    }
}

/// Writes the release atomically.
///
/// 1. Write `release.json.tmp` and fsync it
/// 2. Rename over `release.json`
/// 3. fsync the directory
pub fn write_release(dir: &Path, release: &Release) -> Result<()> {
    let path = dir.join(RELEASE_FILE);
    let tmp_path = dir.join(RELEASE_TMP_FILE);

    std::fs::create_dir_all(dir)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        serde_json::to_writer_pretty(&mut file, release)?;
        writeln!(file)?;
        fsync_file(&file)?;
    }

    std::fs::rename(&tmp_path, &path)?;
    fsync_dir(dir)?;
    Ok(())
}
