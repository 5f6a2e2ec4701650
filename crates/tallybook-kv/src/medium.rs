use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use tallybook_core::StorageError;

/// A flat string-to-string medium. Each call is a single unit: a value is
/// either fully written or not written at all.
pub trait KvMedium: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Process-local medium with an optional byte quota over keys and values.
#[derive(Default)]
pub struct MemoryMedium {
    items: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: usize) -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            quota: Some(bytes),
        }
    }

    pub fn used_bytes(&self) -> usize {
        match self.items.lock() {
            Ok(items) => items.iter().map(|(k, v)| k.len() + v.len()).sum(),
            Err(_) => 0,
        }
    }
}

impl KvMedium for MemoryMedium {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock()?;
        if let Some(quota) = self.quota {
            let others: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if others + key.len() + value.len() > quota {
                return Err(StorageError::unavailable(format!(
                    "quota of {} bytes exceeded writing {}",
                    quota, key
                )));
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items.lock()?.keys().cloned().collect())
    }
}

/// A directory of `<key>.json` files. Writes go to a temporary file that is
/// renamed over the target, so readers never see a half-written value.
pub struct FileMedium {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

fn io_unavailable(path: &Path, err: std::io::Error) -> StorageError {
    StorageError::unavailable(format!("{}: {}", path.display(), err))
}

impl FileMedium {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_unavailable(&dir, e))?;
        Ok(Self {
            dir,
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl KvMedium for FileMedium {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_unavailable(&path, e)),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{}.{}.tmp", std::process::id(), seq));
        fs::write(&tmp, value).map_err(|e| io_unavailable(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_unavailable(&path, e))
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_unavailable(&path, e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| io_unavailable(&self.dir, e))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_unavailable(&self.dir, e))?;
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
