//! On-disk layout, atomic JSON persistence, and per-side writer locks.
//!
//! # Storage layout
//!
//! ```text
//! ~/.empsync/
//!   config.yaml
//!   source/
//!     ledger.json   (Change Ledger + payloads + source Sync Ledger: mode 0600)
//!     .lock
//!   target/
//!     state.json    (TargetRecords + received payloads + target Sync Ledger: mode 0600)
//!     .lock
//!   transport/
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{io_err, StoreError};
use crate::ledger::SourceState;
use crate::target::TargetState;
use crate::types::Side;

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.empsync/`: pure, no I/O.
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".empsync")
}

/// `<home>/.empsync/<side>/`
///
/// Creates the directory (mode `0700`) if it does not yet exist.
pub fn side_dir_at(home: &Path, side: Side) -> Result<PathBuf, StoreError> {
    let dir = root_at(home).join(side.to_string());
    ensure_dir(&dir)?;
    Ok(dir)
}

/// `<home>/.empsync/source/ledger.json`: pure, no I/O.
pub fn source_path_at(home: &Path) -> PathBuf {
    root_at(home).join("source").join("ledger.json")
}

/// `<home>/.empsync/target/state.json`: pure, no I/O.
pub fn target_path_at(home: &Path) -> PathBuf {
    root_at(home).join("target").join("state.json")
}

/// `<home>/.empsync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    root_at(home).join("config.yaml")
}

/// Resolve the user's home directory.
pub fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// 2. Side locks
// ---------------------------------------------------------------------------

/// Exclusive advisory lock over one side's state. Released on drop.
#[derive(Debug)]
pub struct SideLock {
    _file: File,
    side: Side,
    path: PathBuf,
}

impl SideLock {
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Block until the writer lock for `side` is held.
///
/// Every load → mutate → save sequence on a side runs under this lock so that
/// two processes cannot interleave their read-modify-write cycles.
pub fn lock_side_at(home: &Path, side: Side) -> Result<SideLock, StoreError> {
    let dir = side_dir_at(home, side)?;
    let path = dir.join(".lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| io_err(&path, e))?;
    file.lock_exclusive().map_err(|source| StoreError::Lock {
        path: path.clone(),
        source,
    })?;
    Ok(SideLock {
        _file: file,
        side,
        path,
    })
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load the source-side document. Returns an empty state if absent.
pub fn load_source_at(home: &Path) -> Result<SourceState, StoreError> {
    load_json_or_default(&source_path_at(home))
}

/// `load_source_at` convenience wrapper.
pub fn load_source() -> Result<SourceState, StoreError> {
    load_source_at(&home()?)
}

/// Load the target-side document. Returns an empty state if absent.
pub fn load_target_at(home: &Path) -> Result<TargetState, StoreError> {
    load_json_or_default(&target_path_at(home))
}

/// `load_target_at` convenience wrapper.
pub fn load_target() -> Result<TargetState, StoreError> {
    load_target_at(&home()?)
}

/// Read and parse a JSON document; a missing file yields `T::default()`.
pub fn load_json_or_default<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    match load_json(path)? {
        Some(value) => Ok(value),
        None => Ok(T::default()),
    }
}

/// Read and parse a JSON document; a missing file yields `None`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path, err)),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

// ---------------------------------------------------------------------------
// 4. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the source-side document. Caller must hold the source lock.
pub fn save_source_at(
    home: &Path,
    lock: &SideLock,
    state: &SourceState,
) -> Result<(), StoreError> {
    debug_assert_eq!(lock.side(), Side::Source);
    side_dir_at(home, Side::Source)?;
    save_json_atomic(&source_path_at(home), state)
}

/// Atomically save the target-side document. Caller must hold the target lock.
pub fn save_target_at(
    home: &Path,
    lock: &SideLock,
    state: &TargetState,
) -> Result<(), StoreError> {
    debug_assert_eq!(lock.side(), Side::Target);
    side_dir_at(home, Side::Target)?;
    save_json_atomic(&target_path_at(home), state)
}

/// Write flow: serialize → `<file>.tmp` sibling → `chmod 0600` → `rename`.
/// `.tmp` is always in the same directory as the target (same filesystem: no EXDEV).
pub fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        ensure_dir(dir)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = tmp_path(path);
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

/// `<path>.tmp`, e.g. `ledger.json.tmp`.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_are_correct() {
        let home = TempDir::new().expect("tempdir");
        assert!(source_path_at(home.path()).ends_with(".empsync/source/ledger.json"));
        assert!(target_path_at(home.path()).ends_with(".empsync/target/state.json"));
        assert!(config_path_at(home.path()).ends_with(".empsync/config.yaml"));
    }

    #[test]
    fn side_dir_created_with_perms() {
        let home = TempDir::new().expect("tempdir");
        let dir = side_dir_at(home.path(), Side::Target).expect("side dir");
        assert!(dir.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn missing_documents_load_empty() {
        let home = TempDir::new().expect("tempdir");
        let source = load_source_at(home.path()).expect("source");
        assert!(source.entries.is_empty());
        let target = load_target_at(home.path()).expect("target");
        assert!(target.records.is_empty());
    }

    #[test]
    fn atomic_save_cleans_up_tmp_and_sets_mode() {
        let home = TempDir::new().expect("tempdir");
        let lock = lock_side_at(home.path(), Side::Source).expect("lock");
        save_source_at(home.path(), &lock, &SourceState::default()).expect("save");

        let path = source_path_at(home.path());
        assert!(path.exists());
        assert!(!tmp_path(&path).exists(), ".tmp must be gone after save");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn corrupt_document_reports_path() {
        let home = TempDir::new().expect("tempdir");
        let path = target_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_target_at(home.path()).unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
        assert!(err.to_string().contains("state.json"));
    }

    #[test]
    fn tmp_path_appends_suffix() {
        let p = Path::new("/x/ledger.json");
        assert_eq!(tmp_path(p), PathBuf::from("/x/ledger.json.tmp"));
    }

    #[test]
    fn lock_is_reentrant_after_drop() {
        let home = TempDir::new().expect("tempdir");
        let first = lock_side_at(home.path(), Side::Source).expect("first");
        assert!(first.path().ends_with("source/.lock"));
        drop(first);
        let _second = lock_side_at(home.path(), Side::Source).expect("second");
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(StoreError::HomeNotFound.to_string().contains("home directory"));
    }
}
