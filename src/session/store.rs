//! Key/value persistence backing the session
//!
//! Stores never partially apply a multi-key write: `set_all` and `remove_all`
//! either land every entry or none of them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};

use crate::error::{Result, SessionError};

/// Durable string key/value storage
pub trait KeyValueStore: Send + Sync {
    /// Read a single key. Read failures are reported as absent.
    fn get(&self, key: &str) -> Option<String>;

    /// Write every entry as one unit
    fn set_all(&self, entries: &[(&str, &str)]) -> Result<()>;

    /// Remove every key as one unit
    fn remove_all(&self, keys: &[&str]) -> Result<()>;
}

/// In-memory store. Sharing one `Arc<MemoryStore>` between services models
/// several execution contexts over the same storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn set_all(&self, new_entries: &[(&str, &str)]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in new_entries {
            entries.insert((*key).to_string(), (*value).to_string());
        }
        Ok(())
    }

    fn remove_all(&self, keys: &[&str]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}

/// JSON-file store. The whole map is rewritten through a temp file and a
/// rename, so readers in other processes see either the old or the new state.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a store persisting to `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Default session file location (~/.campuswatch/session.json)
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            SessionError::Storage("Could not determine home directory".to_string())
        })?;
        Ok(home.join(".campuswatch").join("session.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> BTreeMap<String, String> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!("Failed to read session file {}: {}", self.path.display(), e);
                return BTreeMap::new();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(map) => map,
            Err(e) => {
                warn!("Session file {} is not a JSON object: {}", self.path.display(), e);
                BTreeMap::new()
            }
        }
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SessionError::Storage(format!("{}: {}", parent.display(), e)))?;
        }

        let contents =
            serde_json::to_string_pretty(map).map_err(|e| SessionError::Storage(e.to_string()))?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, contents)
            .map_err(|e| SessionError::Storage(format!("{}: {}", tmp_path.display(), e)))?;

        // Set file permissions to 600 on Unix systems before the file becomes visible
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&tmp_path, perms)
                .map_err(|e| SessionError::Storage(e.to_string()))?;
        }

        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| SessionError::Storage(format!("{}: {}", self.path.display(), e)))?;

        debug!("Wrote session file {}", self.path.display());
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.read_map().remove(key)
    }

    fn set_all(&self, entries: &[(&str, &str)]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map();
        for (key, value) in entries {
            map.insert((*key).to_string(), (*value).to_string());
        }
        self.write_map(&map)
    }

    fn remove_all(&self, keys: &[&str]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map();
        let before = map.len();
        for key in keys {
            map.remove(*key);
        }
        if map.len() == before && !self.path.exists() {
            return Ok(());
        }
        self.write_map(&map)
    }
}
