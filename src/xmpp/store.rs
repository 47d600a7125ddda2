//! Session Store
//!
//! Persistent key → JSON value table backing the OMEMO session layer and the
//! trust decisions:
//! - One JSON object in one file
//! - Rewritten in full on every mutation (temp file + fsync + rename)
//! - Missing file means empty table; unreadable or corrupt file is an error

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Key → opaque value persistence used by the session layer
pub trait SessionStore: Send + Sync {
    /// Value stored under `key`, if any
    fn load(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Insert or replace `key`
    fn store(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Remove `key` (no-op when absent)
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn entries(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>>;
}

/// Single-file JSON session store
pub struct JsonFileStore {
    path: PathBuf,
    table: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open the table at `path`.
    ///
    /// Returns an empty store if the file doesn't exist yet (first run). Nothing
    /// is written until the first mutation.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        let table = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str::<BTreeMap<String, Value>>(&contents).map_err(|e| {
                StoreError::Corrupt {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?
        } else {
            debug!(path = %path.display(), "no session table yet, starting empty");
            BTreeMap::new()
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `mutate` to a copy of the table, persist it, then swap it in.
    ///
    /// The in-memory table only changes once the file on disk has.
    fn commit<F>(&self, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, Value>),
    {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = table.clone();
        mutate(&mut next);
        write_table(&self.path, &next)?;
        *table = next;
        Ok(())
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self, key: &str) -> StoreResult<Option<Value>> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.get(key).cloned())
    }

    fn store(&self, key: &str, value: Value) -> StoreResult<()> {
        self.commit(|table| {
            table.insert(key.to_string(), value);
        })
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        {
            let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
            if !table.contains_key(key) {
                return Ok(());
            }
        }
        self.commit(|table| {
            table.remove(key);
        })
    }

    fn entries(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Replace the file at `path` with `table` atomically.
fn write_table(path: &Path, table: &BTreeMap<String, Value>) -> StoreResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let bytes = serde_json::to_vec(table).map_err(|e| StoreError::Serialization(e.to_string()))?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    temp.as_file_mut().write_all(&bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| StoreError::Io(e.error))?;

    Ok(())
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session table {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Session table lock poisoned")]
    Poisoned,
}
