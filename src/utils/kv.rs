//! Durable key-value storage for per-conversation client state.
//!
//! Values are opaque strings (the callers store JSON documents). The file
//! backend keeps one file per key under the platform data directory and
//! writes atomically via a temp file, so a crash mid-write never corrupts
//! previously persisted state.

use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tempfile::NamedTempFile;

#[derive(Debug)]
pub enum StorageError {
    /// Failed to read a stored value.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write a value durably.
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// No usable data directory on this platform.
    NoDataDir,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Read { path, source } => {
                write!(f, "Failed to read {}: {}", path.display(), source)
            }
            StorageError::Write { path, source } => {
                write!(f, "Failed to write {}: {}", path.display(), source)
            }
            StorageError::NoDataDir => {
                write!(f, "Could not determine a data directory for this platform")
            }
        }
    }
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            StorageError::Read { source, .. } | StorageError::Write { source, .. } => Some(source),
            StorageError::NoDataDir => None,
        }
    }
}

/// Durable string-keyed storage. Keys are flat; callers namespace them
/// (e.g. `nav/<conversation-id>`).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// File-per-key store rooted at a directory.
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    /// Store rooted at the platform data directory for this application.
    pub fn open_default() -> Result<Self, StorageError> {
        let dirs =
            ProjectDirs::from("org", "permacommons", "ensemble").ok_or(StorageError::NoDataDir)?;
        Self::open(dirs.data_dir().join("state"))
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::Write {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys may contain separators; flatten them into a single file name.
        let file_name: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join(format!("{file_name}.json"))
    }

    fn write_atomic(path: &Path, value: &str) -> Result<(), StorageError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|source| StorageError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        tmp.write_all(value.as_bytes())
            .map_err(|source| StorageError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        tmp.persist(path).map_err(|e| StorageError::Write {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Read { path, source }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        Self::write_atomic(&self.path_for(key), value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Write { path, source }),
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().expect("kv lock").get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .expect("kv lock")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().expect("kv lock").remove(key);
        Ok(())
    }
}
