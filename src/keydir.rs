use crate::error::{DbError, DbResult};
use crate::log_file::FileId;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Location of the most recent value for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyDirEntry {
    pub file_id: FileId,
    pub value_size: u32,
    /// Absolute offset of the value bytes, not of the record.
    pub value_position: u64,
    pub timestamp: f64,
}

impl KeyDirEntry {
    /// Commit order of the record this entry describes: timestamp, then file
    /// id, then position.
    pub fn priority_cmp(&self, other: &KeyDirEntry) -> Ordering {
        self.timestamp
            .total_cmp(&other.timestamp)
            .then(self.file_id.cmp(&other.file_id))
            .then(self.value_position.cmp(&other.value_position))
    }

    pub fn is_newer_than(&self, other: &KeyDirEntry) -> bool {
        self.priority_cmp(other) == Ordering::Greater
    }
}

/// Concurrent map from raw key bytes to the location of the live value.
#[derive(Debug, Default)]
pub struct KeyDir {
    map: RwLock<HashMap<Vec<u8>, KeyDirEntry>>,
}

impl KeyDir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<Vec<u8>, KeyDirEntry>) -> Self {
        KeyDir {
            map: RwLock::new(map),
        }
    }

    fn read(&self) -> DbResult<std::sync::RwLockReadGuard<'_, HashMap<Vec<u8>, KeyDirEntry>>> {
        self.map
            .read()
            .map_err(|e| DbError::LockPoisoned(e.to_string()))
    }

    fn write(&self) -> DbResult<std::sync::RwLockWriteGuard<'_, HashMap<Vec<u8>, KeyDirEntry>>> {
        self.map
            .write()
            .map_err(|e| DbError::LockPoisoned(e.to_string()))
    }

    pub fn get(&self, key: &[u8]) -> DbResult<Option<KeyDirEntry>> {
        Ok(self.read()?.get(key).copied())
    }

    pub fn set(&self, key: Vec<u8>, entry: KeyDirEntry) -> DbResult<()> {
        self.write()?.insert(key, entry);
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> DbResult<Option<KeyDirEntry>> {
        Ok(self.write()?.remove(key))
    }

    /// Applies puts (`Some`) and removals (`None`) in order under one lock, so
    /// readers never observe half of a batch.
    pub fn apply(&self, updates: Vec<(Vec<u8>, Option<KeyDirEntry>)>) -> DbResult<()> {
        let mut map = self.write()?;
        for (key, update) in updates {
            match update {
                Some(entry) => {
                    map.insert(key, entry);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Replaces the entry for `key` only if it still equals `expected`.
    pub fn replace_if(
        &self,
        key: &[u8],
        expected: &KeyDirEntry,
        replacement: KeyDirEntry,
    ) -> DbResult<bool> {
        let mut map = self.write()?;
        match map.get_mut(key) {
            Some(current) if current == expected => {
                *current = replacement;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Keys present at the moment of the call, in no particular order.
    pub fn keys(&self) -> DbResult<Vec<Vec<u8>>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    pub fn len(&self) -> DbResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.read()?.is_empty())
    }

    pub fn clear(&self) -> DbResult<()> {
        self.write()?.clear();
        Ok(())
    }

    /// Point-in-time copy of every entry.
    pub fn copy_all(&self) -> DbResult<HashMap<Vec<u8>, KeyDirEntry>> {
        Ok(self.read()?.clone())
    }

    /// Every file id some entry currently points into.
    pub fn referenced_files(&self) -> DbResult<HashSet<FileId>> {
        Ok(self.read()?.values().map(|e| e.file_id).collect())
    }
}
