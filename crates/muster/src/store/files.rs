//! Backup-then-replace file persistence.
//!
//! Every mutation of node state goes through [`replace_with_backup`]:
//! the current file is copied to `<file>.backup`, the new content is
//! written to `<file>.tmp` and synced, then renamed over the original.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use muster_common::ClusterError;

/// Mode applied to node state files
const FILE_MODE: u32 = 0o660;
/// Mode applied to lock files
const LOCK_MODE: u32 = 0o700;

/// `<path>.backup`
pub fn backup_path(path: &Path) -> PathBuf {
    append_suffix(path, ".backup")
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Read a file, returning `None` if it does not exist
pub fn read_optional(path: &Path) -> Result<Option<String>, ClusterError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ClusterError::io(path.display(), e)),
    }
}

/// Read a file that must exist
pub fn read_required(path: &Path) -> Result<String, ClusterError> {
    read_optional(path)?.ok_or_else(|| {
        ClusterError::LocalState(format!("expected file {} is missing", path.display()))
    })
}

/// Atomically replace `path` with `contents`, keeping a backup of the old file
pub fn replace_with_backup(path: &Path, contents: impl AsRef<[u8]>) -> Result<(), ClusterError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ClusterError::io(parent.display(), e))?;
    }

    if path.exists() {
        let backup = backup_path(path);
        fs::copy(path, &backup).map_err(|e| ClusterError::io(backup.display(), e))?;
        set_permissions(&backup, FILE_MODE);
    }

    let tmp = append_suffix(path, ".tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| ClusterError::io(tmp.display(), e))?;
    file.write_all(contents.as_ref())
        .and_then(|_| file.sync_all())
        .map_err(|e| ClusterError::io(tmp.display(), e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| ClusterError::io(path.display(), e))?;
    set_permissions(path, FILE_MODE);
    Ok(())
}

/// Copy `from` over `to` through [`replace_with_backup`]
pub fn copy_with_backup(from: &Path, to: &Path) -> Result<(), ClusterError> {
    let contents = fs::read(from).map_err(|e| ClusterError::io(from.display(), e))?;
    replace_with_backup(to, contents)
}

/// Remove a file; a missing file is not an error
pub fn remove_if_exists(path: &Path) -> Result<bool, ClusterError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ClusterError::io(path.display(), e)),
    }
}

/// Move `<path>.backup` back over `path`; false when there is no backup
pub fn restore_backup(path: &Path) -> Result<bool, ClusterError> {
    let backup = backup_path(path);
    if !backup.exists() {
        return Ok(false);
    }
    fs::rename(&backup, path).map_err(|e| ClusterError::io(path.display(), e))?;
    Ok(true)
}

/// Create an empty lock file
pub fn touch(path: &Path) -> Result<(), ClusterError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ClusterError::io(parent.display(), e))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ClusterError::io(path.display(), e))?;
    set_permissions(path, LOCK_MODE);
    Ok(())
}

// Permission failures are logged, not fatal (e.g. non-root test runs)
fn set_permissions(path: &Path, mode: u32) {
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        tracing::debug!(path = %path.display(), error = %e, "Could not set file permissions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_keeps_backup_of_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials/cluster-tokens.txt");

        replace_with_backup(&path, "first\n").unwrap();
        assert!(!backup_path(&path).exists());

        replace_with_backup(&path, "second\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second\n");
        assert_eq!(fs::read_to_string(backup_path(&path)).unwrap(), "first\n");
        assert!(!dir.path().join("credentials/cluster-tokens.txt.tmp").exists());

        assert!(restore_backup(&path).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\n");
        assert!(!restore_backup(&path).unwrap());
    }

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(read_optional(&path).unwrap().is_none());
        assert!(matches!(read_required(&path), Err(ClusterError::LocalState(_))));
        assert!(!remove_if_exists(&path).unwrap());
    }

    #[test]
    fn test_touch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("var/lock/ha-cluster");
        touch(&lock).unwrap();
        touch(&lock).unwrap();
        assert!(lock.exists());
        assert!(remove_if_exists(&lock).unwrap());
    }
}
