use crate::error::{DbError, DbResult};
use crate::keydir::KeyDirEntry;
use crate::log_file::FileId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Per-file count of open snapshots that still read from the file. The
/// compactor never deletes a file whose count is above zero.
#[derive(Debug, Clone, Default)]
pub struct FileReferences {
    counts: Arc<Mutex<HashMap<FileId, usize>>>,
}

impl FileReferences {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DbResult<std::sync::MutexGuard<'_, HashMap<FileId, usize>>> {
        self.counts
            .lock()
            .map_err(|e| DbError::LockPoisoned(e.to_string()))
    }

    pub fn pin(&self, ids: &[FileId]) -> DbResult<()> {
        let mut counts = self.lock()?;
        for id in ids {
            *counts.entry(*id).or_insert(0) += 1;
        }
        Ok(())
    }

    pub fn unpin(&self, ids: &[FileId]) -> DbResult<()> {
        let mut counts = self.lock()?;
        for id in ids {
            if let Some(count) = counts.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(id);
                }
            }
        }
        Ok(())
    }

    pub fn count(&self, id: FileId) -> DbResult<usize> {
        Ok(self.lock()?.get(&id).copied().unwrap_or(0))
    }

    pub fn pinned_ids(&self) -> DbResult<BTreeSet<FileId>> {
        Ok(self.lock()?.keys().copied().collect())
    }

    pub fn total(&self) -> DbResult<usize> {
        Ok(self.lock()?.values().sum())
    }
}

/// Frozen copy of the keydir. While open it pins every file its entries point
/// into. Dropping an open snapshot closes it.
#[derive(Debug)]
pub struct Snapshot {
    keydir: Option<HashMap<Vec<u8>, KeyDirEntry>>,
    file_ids: Vec<FileId>,
    references: FileReferences,
}

impl Snapshot {
    pub(crate) fn new(
        keydir: HashMap<Vec<u8>, KeyDirEntry>,
        references: FileReferences,
    ) -> DbResult<Self> {
        let file_ids: Vec<FileId> = keydir
            .values()
            .map(|e| e.file_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        references.pin(&file_ids)?;
        debug!(
            "Snapshot created over {} keys pinning files {:?}",
            keydir.len(),
            file_ids
        );
        Ok(Snapshot {
            keydir: Some(keydir),
            file_ids,
            references,
        })
    }

    fn frozen(&self) -> DbResult<&HashMap<Vec<u8>, KeyDirEntry>> {
        self.keydir.as_ref().ok_or(DbError::SnapshotClosed)
    }

    pub fn get(&self, key: &[u8]) -> DbResult<Option<KeyDirEntry>> {
        Ok(self.frozen()?.get(key).copied())
    }

    pub fn keys(&self) -> DbResult<Vec<Vec<u8>>> {
        Ok(self.frozen()?.keys().cloned().collect())
    }

    pub fn len(&self) -> DbResult<usize> {
        Ok(self.frozen()?.len())
    }

    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.frozen()?.is_empty())
    }

    /// Files this snapshot keeps alive, ascending.
    pub fn file_ids(&self) -> &[FileId] {
        &self.file_ids
    }

    pub fn is_closed(&self) -> bool {
        self.keydir.is_none()
    }

    pub fn close(&mut self) -> DbResult<()> {
        if self.keydir.take().is_none() {
            return Err(DbError::AlreadyClosed);
        }
        self.references.unpin(&self.file_ids)?;
        debug!("Snapshot closed, released files {:?}", self.file_ids);
        Ok(())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}
