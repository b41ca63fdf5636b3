//! fsync helpers.
//!
//! Creating or renaming a file changes its directory entry, so durable
//! writes sync both the file and its parent directory.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so that entries created or renamed in it survive a crash.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn syncs_written_file_and_its_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");

        let mut file = File::create(&path).unwrap();
        file.write_all(b"{}\n").unwrap();

        fsync_file(&file).unwrap();
        fsync_dir(dir.path()).unwrap();
    }

    #[test]
    fn fsync_dir_fails_on_missing_directory() {
        let dir = tempdir().unwrap();
        assert!(fsync_dir(&dir.path().join("missing")).is_err());
    }
}
