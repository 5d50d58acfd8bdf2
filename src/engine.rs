use crate::batch::{BatchOp, WriteBatch};
use crate::clock::MonotonicClock;
use crate::codec::{self, HEADER_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE, TOMBSTONE};
use crate::compactor::{CompactionSummary, Compactor};
use crate::config::{Options, SyncStrategy};
use crate::error::{DbError, DbResult};
use crate::keydir::{KeyDir, KeyDirEntry};
use crate::lock::{self, ExclusiveLock};
use crate::log_file::{self, DataReader, FileId, LogFile};
use crate::recovery;
use crate::snapshot::{FileReferences, Snapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

/// The single append pipeline: the active file plus everything needed to
/// stamp and place the next record.
pub(crate) struct Writer {
    pub(crate) active: LogFile,
    pub(crate) clock: MonotonicClock,
    next_file_id: FileId,
    scratch: Vec<u8>,
}

impl Writer {
    /// Hands out the next unused file id. Rotation and merge output share it.
    pub(crate) fn allocate_file_id(&mut self) -> FileId {
        let id = self.next_file_id;
        self.next_file_id += 1;
        id
    }
}

/// Point-in-time counters, printed by `medea stats`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub dir: PathBuf,
    pub keys: usize,
    pub files: usize,
    pub active_file_id: Option<FileId>,
    pub data_bytes: u64,
    pub pinned_files: usize,
    pub snapshot_references: usize,
    pub read_only: bool,
    pub max_file_size: u64,
}

/// A log-structured hash table rooted at one directory.
///
/// Writes are serialized through one append pipeline; reads only take read
/// locks and use positioned reads, so they run concurrently with writes and
/// with each other.
pub struct Engine {
    pub(crate) dir: PathBuf,
    pub(crate) options: Options,
    pub(crate) keydir: KeyDir,
    pub(crate) files: RwLock<BTreeMap<FileId, Arc<DataReader>>>,
    pub(crate) writer: Mutex<Option<Writer>>,
    pub(crate) references: FileReferences,
    lock: Mutex<Option<ExclusiveLock>>,
    open: AtomicBool,
    // Held by compaction and snapshot creation.
    maintenance: Mutex<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.dir)
            .field("read_only", &self.options.read_only)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Engine {
    /// Opens (creating if needed) the database in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, options: Options) -> DbResult<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        info!(
            "Opening database in {:?} (read_only: {}, max_file_size: {}, sync: {:?})",
            dir, options.read_only, options.max_file_size, options.sync
        );

        if !options.read_only {
            fs::create_dir_all(&dir)?;
        } else if !dir.is_dir() {
            return Err(DbError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("database directory {:?} does not exist", dir),
            )));
        }

        let lock = if options.read_only {
            None
        } else {
            let lock = ExclusiveLock::acquire(&dir)?;
            let removed = recovery::remove_empty_files(&dir)?;
            if removed > 0 {
                info!("Removed {} empty files left by an earlier crash", removed);
            }
            Some(lock)
        };

        let mut files = BTreeMap::new();
        for id in log_file::list_data_file_ids(&dir)? {
            files.insert(id, Arc::new(DataReader::open(&dir, id)?));
        }

        let recovered = recovery::rebuild(&dir, &files)?;
        let clock = MonotonicClock::starting_after(recovered.max_timestamp);

        let writer = if options.read_only {
            None
        } else {
            let id = files.keys().next_back().map_or(1, |last| last + 1);
            let active = LogFile::create(&dir, id)?;
            files.insert(id, Arc::new(DataReader::open(&dir, id)?));
            sync_directory(&dir);
            info!("Active file is {}", id);
            Some(Writer {
                active,
                clock,
                next_file_id: id + 1,
                scratch: Vec::with_capacity(4096),
            })
        };

        info!(
            "Database open with {} keys across {} files",
            recovered.entries.len(),
            files.len()
        );
        Ok(Engine {
            dir,
            options,
            keydir: KeyDir::from_map(recovered.entries),
            files: RwLock::new(files),
            writer: Mutex::new(writer),
            references: FileReferences::new(),
            lock: Mutex::new(lock),
            open: AtomicBool::new(true),
            maintenance: Mutex::new(()),
        })
    }

    /// Opens the directory named by `options.dirname`.
    pub fn open_with_options(options: Options) -> DbResult<Self> {
        let dir = options.dirname.clone();
        Self::open(dir, options)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DbError::NotOpen)
        }
    }

    fn ensure_writable(&self) -> DbResult<()> {
        self.ensure_open()?;
        if self.options.read_only {
            return Err(DbError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn lock_writer(&self) -> DbResult<MutexGuard<'_, Option<Writer>>> {
        self.writer
            .lock()
            .map_err(|e| DbError::LockPoisoned(e.to_string()))
    }

    pub(crate) fn files_read(
        &self,
    ) -> DbResult<RwLockReadGuard<'_, BTreeMap<FileId, Arc<DataReader>>>> {
        self.files
            .read()
            .map_err(|e| DbError::LockPoisoned(e.to_string()))
    }

    pub(crate) fn files_write(
        &self,
    ) -> DbResult<RwLockWriteGuard<'_, BTreeMap<FileId, Arc<DataReader>>>> {
        self.files
            .write()
            .map_err(|e| DbError::LockPoisoned(e.to_string()))
    }

    fn reader(&self, id: FileId) -> DbResult<Arc<DataReader>> {
        self.files_read()?
            .get(&id)
            .cloned()
            .ok_or(DbError::InvalidFileId(id))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.ensure_writable()?;
        validate_key(key)?;
        validate_value(value)?;
        debug!(
            "PUT operation: key length = {}, value length = {}",
            key.len(),
            value.len()
        );
        let entry = self.append_single(key, value)?;
        debug!(
            "PUT record written to file {} at value offset {}",
            entry.file_id, entry.value_position
        );
        Ok(())
    }

    /// Writes a tombstone for `key` and drops it from the keydir.
    pub fn remove(&self, key: &[u8]) -> DbResult<()> {
        self.ensure_writable()?;
        validate_key(key)?;
        debug!("REMOVE operation: key length = {}", key.len());
        self.append_single(key, TOMBSTONE)?;
        Ok(())
    }

    fn append_single(&self, key: &[u8], value: &[u8]) -> DbResult<KeyDirEntry> {
        let sync = self.options.sync == SyncStrategy::Always;
        let mut guard = self.lock_writer()?;
        let writer = guard.as_mut().ok_or(DbError::NotOpen)?;

        let timestamp = writer.clock.next();
        writer.scratch.clear();
        let len = codec::encode_record_into(&mut writer.scratch, key, value, timestamp);
        self.rotate_if_needed(writer, len as u64)?;

        let offset = match writer.active.append_records(&writer.scratch, sync) {
            Ok(offset) => offset,
            Err(e) => {
                error!("Failed to append to file {}: {}", writer.active.id(), e);
                return Err(e);
            }
        };
        let entry = KeyDirEntry {
            file_id: writer.active.id(),
            value_size: value.len() as u32,
            value_position: offset + (HEADER_SIZE + key.len()) as u64,
            timestamp,
        };
        if codec::is_tombstone(value) {
            self.keydir.remove(key)?;
        } else {
            self.keydir.set(key.to_vec(), entry)?;
        }
        Ok(entry)
    }

    /// Rotates before `incoming` bytes would push a non-empty active file past
    /// `max_file_size`. A record never spans two files.
    fn rotate_if_needed(&self, writer: &mut Writer, incoming: u64) -> DbResult<()> {
        let offset = writer.active.offset();
        if offset > 0 && offset + incoming > self.options.max_file_size {
            self.rotate(writer)?;
        }
        Ok(())
    }

    pub(crate) fn rotate(&self, writer: &mut Writer) -> DbResult<()> {
        let id = writer.allocate_file_id();
        let fresh = LogFile::create(&self.dir, id)?;
        let reader = Arc::new(DataReader::open(&self.dir, id)?);
        self.files_write()?.insert(id, reader);

        let mut old = std::mem::replace(&mut writer.active, fresh);
        if let Err(e) = old.close_for_writing() {
            error!("Failed to close file {} during rotation: {}", old.id(), e);
            return Err(e);
        }
        sync_directory(&self.dir);
        info!(
            "Rotated active file {} ({} bytes) to {}",
            old.id(),
            old.offset(),
            id
        );
        Ok(())
    }

    /// Reads the current value of `key`.
    pub fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        debug!("GET operation: key length = {}", key.len());
        let mut entry = match self.keydir.get(key)? {
            Some(entry) => entry,
            None => {
                debug!("Key not found in keydir");
                return Ok(None);
            }
        };
        loop {
            match self.read_value(key, &entry) {
                // Compaction moved the key and retired the file after the lookup.
                Err(DbError::InvalidFileId(id)) => match self.keydir.get(key)? {
                    Some(current) if current != entry => entry = current,
                    Some(_) => return Err(DbError::InvalidFileId(id)),
                    None => return Ok(None),
                },
                other => return other,
            }
        }
    }

    /// Reads `key` as it was when `snapshot` was taken.
    pub fn get_with_snapshot(&self, key: &[u8], snapshot: &Snapshot) -> DbResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        match snapshot.get(key)? {
            Some(entry) => self.read_value(key, &entry),
            None => Ok(None),
        }
    }

    fn read_value(&self, key: &[u8], entry: &KeyDirEntry) -> DbResult<Option<Vec<u8>>> {
        let reader = self.reader(entry.file_id)?;
        let header_and_key = (HEADER_SIZE + key.len()) as u64;
        let start = entry
            .value_position
            .checked_sub(header_and_key)
            .ok_or_else(|| {
                DbError::corrupt(entry.file_id, entry.value_position, "value offset inside header")
            })?;

        let mut buf = vec![0u8; header_and_key as usize + entry.value_size as usize];
        reader.read_exact_at(&mut buf, start).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                DbError::corrupt(entry.file_id, start, "record extends past end of file")
            } else {
                DbError::Io(e)
            }
        })?;

        let record = codec::decode_record(&buf)
            .map_err(|e| DbError::corrupt(entry.file_id, start, e.to_string()))?;
        if record.key != key {
            return Err(DbError::corrupt(entry.file_id, start, "key mismatch"));
        }
        if record.is_tombstone() {
            return Ok(None);
        }
        Ok(Some(record.value.to_vec()))
    }

    pub fn create_batch(&self) -> WriteBatch {
        WriteBatch::new()
    }

    /// Appends every operation of `batch` as one contiguous region with one
    /// fsync, then applies the keydir updates in batch order.
    pub fn write(&self, batch: &WriteBatch) -> DbResult<()> {
        self.ensure_writable()?;
        if batch.is_empty() {
            return Ok(());
        }
        for op in batch.ops() {
            validate_key(op.key())?;
            if let BatchOp::Put { value, .. } = op {
                validate_value(value)?;
            }
        }
        debug!("Starting batch write of {} operations", batch.len());

        let mut guard = self.lock_writer()?;
        let writer = guard.as_mut().ok_or(DbError::NotOpen)?;

        writer.scratch.clear();
        // (relative record offset, timestamp) per op
        let mut placed = Vec::with_capacity(batch.len());
        for op in batch.ops() {
            let timestamp = writer.clock.next();
            let at = writer.scratch.len() as u64;
            let value = match op {
                BatchOp::Put { value, .. } => value.as_slice(),
                BatchOp::Remove { .. } => TOMBSTONE,
            };
            codec::encode_record_into(&mut writer.scratch, op.key(), value, timestamp);
            placed.push((at, timestamp));
        }
        let total = writer.scratch.len() as u64;
        self.rotate_if_needed(writer, total)?;

        let start = match writer.active.append_records(&writer.scratch, true) {
            Ok(start) => start,
            Err(e) => {
                error!("Failed to append batch to file {}: {}", writer.active.id(), e);
                return Err(e);
            }
        };
        let file_id = writer.active.id();

        let updates = batch
            .ops()
            .iter()
            .zip(placed)
            .map(|(op, (at, timestamp))| match op {
                BatchOp::Put { key, value } => (
                    key.clone(),
                    Some(KeyDirEntry {
                        file_id,
                        value_size: value.len() as u32,
                        value_position: start + at + (HEADER_SIZE + key.len()) as u64,
                        timestamp,
                    }),
                ),
                BatchOp::Remove { key } => (key.clone(), None),
            })
            .collect();
        self.keydir.apply(updates)?;
        debug!(
            "Batch of {} operations written to file {} at offset {}",
            batch.len(),
            file_id,
            start
        );
        Ok(())
    }

    /// Live keys, in no particular order.
    pub fn list_keys(&self) -> DbResult<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.keydir.keys()
    }

    /// Freezes the keydir and pins every file it points into until the
    /// snapshot is closed or dropped.
    pub fn create_snapshot(&self) -> DbResult<Snapshot> {
        self.ensure_open()?;
        let _gate = self
            .maintenance
            .lock()
            .map_err(|e| DbError::LockPoisoned(e.to_string()))?;
        Snapshot::new(self.keydir.copy_all()?, self.references.clone())
    }

    /// Flushes and fsyncs the active data and hint files.
    pub fn sync(&self) -> DbResult<()> {
        self.ensure_open()?;
        debug!("Manual sync requested.");
        let mut guard = self.lock_writer()?;
        if let Some(writer) = guard.as_mut() {
            writer.active.sync()?;
            info!("Manual sync completed for file {}.", writer.active.id());
        }
        Ok(())
    }

    /// Rewrites the live records of every unpinned read-only file into fresh
    /// files and deletes the originals.
    pub fn compact(&self) -> DbResult<CompactionSummary> {
        self.ensure_writable()?;
        let _gate = self
            .maintenance
            .lock()
            .map_err(|e| DbError::LockPoisoned(e.to_string()))?;
        Compactor::new(self).run()
    }

    pub fn stats(&self) -> DbResult<EngineStats> {
        self.ensure_open()?;
        let active_file_id = self.lock_writer()?.as_ref().map(|w| w.active.id());
        let (files, data_bytes) = {
            let files = self.files_read()?;
            let mut bytes = 0;
            for reader in files.values() {
                bytes += reader.len()?;
            }
            (files.len(), bytes)
        };
        Ok(EngineStats {
            dir: self.dir.clone(),
            keys: self.keydir.len()?,
            files,
            active_file_id,
            data_bytes,
            pinned_files: self.references.pinned_ids()?.len(),
            snapshot_references: self.references.total()?,
            read_only: self.options.read_only,
            max_file_size: self.options.max_file_size,
        })
    }

    /// Closes the active file for writing, drops every read handle and
    /// releases the directory lock. Handles and the lock are released even if
    /// closing the active file fails. Further calls fail with `NotOpen`.
    pub fn close(&self) -> DbResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(DbError::NotOpen);
        }
        info!("Closing database in {:?}", self.dir);

        let closed = self.close_active_file();
        if let Err(e) = &closed {
            error!("Failed to close active file: {}", e);
        }
        let cleared = self
            .files_write()
            .map(|mut files| files.clear())
            .and_then(|_| self.keydir.clear());
        let released = match self
            .lock
            .lock()
            .map_err(|e| DbError::LockPoisoned(e.to_string()))?
            .take()
        {
            Some(mut lock) => lock.release(),
            None => Ok(()),
        };

        closed?;
        cleared?;
        released?;
        info!("Database closed.");
        Ok(())
    }

    fn close_active_file(&self) -> DbResult<()> {
        let Some(mut writer) = self.lock_writer()?.take() else {
            return Ok(());
        };
        let id = writer.active.id();
        let empty = writer.active.offset() == 0;
        writer.active.close_for_writing()?;
        if empty {
            self.files_write()?.remove(&id);
            debug!("Removing unused active file {}", id);
            remove_file_if_exists(&log_file::data_path(&self.dir, id))?;
            remove_file_if_exists(&log_file::hint_path(&self.dir, id))?;
            sync_directory(&self.dir);
        }
        Ok(())
    }

    /// Deletes every data and hint file in `dir`, then `dir` itself if nothing
    /// else is left in it. Fails with `AlreadyOpen` while the directory is
    /// locked by a running process.
    pub fn destroy<P: AsRef<Path>>(dir: P) -> DbResult<()> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(());
        }
        if lock::is_locked(dir)? {
            return Err(DbError::AlreadyOpen {
                path: dir.to_path_buf(),
            });
        }

        let mut removed = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if log_file::parse_data_file_name(name).is_some()
                || log_file::parse_hint_file_name(name).is_some()
                || name == lock::LOCK_FILE_NAME
            {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if fs::read_dir(dir)?.next().is_none() {
            fs::remove_dir(dir)?;
        }
        info!("Destroyed database in {:?} ({} files removed)", dir, removed);
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_open() {
            info!("Shutting down database, closing active file...");
            if let Err(e) = self.close() {
                error!("Error closing database during drop: {:?}", e);
            }
        }
    }
}

fn validate_key(key: &[u8]) -> DbResult<()> {
    if key.is_empty() {
        return Err(DbError::EmptyKey);
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(DbError::KeyTooLarge {
            limit: MAX_KEY_SIZE,
            actual: key.len(),
        });
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> DbResult<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(DbError::ValueTooLarge {
            limit: MAX_VALUE_SIZE,
            actual: value.len(),
        });
    }
    if codec::is_tombstone(value) {
        return Err(DbError::ReservedValue);
    }
    Ok(())
}

pub(crate) fn remove_file_if_exists(path: &Path) -> DbResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Best-effort fsync of a directory so created and deleted entries survive a
/// crash.
pub(crate) fn sync_directory(dir: &Path) {
    match File::open(dir) {
        Ok(handle) => {
            if let Err(e) = handle.sync_all() {
                warn!("Failed to sync directory {:?}: {}", dir, e);
            } else {
                debug!("Synced directory {:?}", dir);
            }
        }
        Err(e) => {
            warn!("Could not open directory {:?} to sync: {}", dir, e);
        }
    }
}
