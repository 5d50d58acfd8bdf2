//! Merges the live records of read-only files into fresh files.
//!
//! A run works on the read-only files no snapshot pins, oldest first. A value
//! record survives only if the keydir still points at exactly that record. A
//! tombstone survives only while some older file outlives the run (a pinned
//! one) and no newer write or newer tombstone for the key exists. Candidates
//! are deleted only after every output file is fsynced and closed, oldest
//! newest-record first, so a crash part way through never leaves a value
//! without the tombstone that deleted it.

use crate::engine::{remove_file_if_exists, sync_directory, Engine, Writer};
use crate::error::{DbError, DbResult};
use crate::keydir::KeyDirEntry;
use crate::log_file::{self, DataReader, FileId, LogFile};
use crate::recovery::{self, DataFileScanner, ScannedRecord};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What one compaction run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompactionSummary {
    pub candidates: Vec<FileId>,
    pub files_written: Vec<FileId>,
    pub files_removed: Vec<FileId>,
    pub records_copied: usize,
    pub tombstones_kept: usize,
    pub records_dropped: usize,
    pub orphan_hints_removed: usize,
    /// True when nothing was reclaimable and no file was touched.
    pub skipped: bool,
}

pub struct Compactor<'a> {
    engine: &'a Engine,
    candidates: Vec<FileId>,
    retain_tombstones: bool,
    // Newest tombstone per key across the candidates.
    shadow: HashMap<Vec<u8>, KeyDirEntry>,
    // Keys whose tombstone must be copied because an older record of the key
    // sits in a candidate retired after the tombstone's file.
    guarded: HashSet<Vec<u8>>,
    // Candidates by ascending newest timestamp.
    retire_order: Vec<FileId>,
    output: MergeOutput,
}

#[derive(Default)]
struct MergeOutput {
    current: Option<LogFile>,
    written: Vec<FileId>,
}

impl MergeOutput {
    /// Appends `raw` to the current output file, creating or rotating it the
    /// way the active file rotates.
    fn append(&mut self, engine: &Engine, writer: &mut Writer, raw: &[u8]) -> DbResult<(FileId, u64)> {
        let len = raw.len() as u64;
        let max = engine.options.max_file_size;
        let file = match self.current.take() {
            Some(file) if file.offset() == 0 || file.offset() + len <= max => {
                self.current.insert(file)
            }
            previous => {
                if let Some(mut previous) = previous {
                    previous.close_for_writing()?;
                }
                let id = writer.allocate_file_id();
                let file = LogFile::create(&engine.dir, id)?;
                engine
                    .files_write()?
                    .insert(id, Arc::new(DataReader::open(&engine.dir, id)?));
                self.written.push(id);
                debug!("Compaction output file {} created", id);
                self.current.insert(file)
            }
        };
        let offset = file.append_records(raw, false)?;
        Ok((file.id(), offset))
    }

    fn finish(&mut self) -> DbResult<()> {
        if let Some(mut file) = self.current.take() {
            file.close_for_writing()?;
        }
        Ok(())
    }
}

impl<'a> Compactor<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Compactor {
            engine,
            candidates: Vec::new(),
            retain_tombstones: false,
            shadow: HashMap::new(),
            guarded: HashSet::new(),
            retire_order: Vec::new(),
            output: MergeOutput::default(),
        }
    }

    pub fn run(mut self) -> DbResult<CompactionSummary> {
        info!("Starting compaction in {:?}", self.engine.dir);
        let active_id = self
            .engine
            .lock_writer()?
            .as_ref()
            .map(|w| w.active.id())
            .ok_or(DbError::NotOpen)?;
        let pinned = self.engine.references.pinned_ids()?;
        let read_only: Vec<FileId> = self
            .engine
            .files_read()?
            .keys()
            .copied()
            .filter(|id| *id != active_id)
            .collect();

        self.candidates = read_only
            .iter()
            .copied()
            .filter(|id| !pinned.contains(id))
            .collect();
        self.retain_tombstones = read_only.iter().any(|id| pinned.contains(id));
        let orphans = recovery::orphan_hint_files(&self.engine.dir)?;

        let mut summary = CompactionSummary {
            candidates: self.candidates.clone(),
            ..Default::default()
        };
        debug!(
            "Compaction candidates {:?}, pinned {:?}, retaining tombstones: {}",
            self.candidates, pinned, self.retain_tombstones
        );

        if !self.survey()? && orphans.is_empty() {
            info!("Compaction found nothing to reclaim.");
            summary.skipped = true;
            return Ok(summary);
        }

        if let Err(e) = self.merge(&mut summary) {
            error!("Compaction aborted, source files left in place: {}", e);
            if let Err(close_err) = self.output.finish() {
                error!("Failed to close compaction output: {}", close_err);
            }
            return Err(e);
        }
        self.output.finish()?;
        summary.files_written = std::mem::take(&mut self.output.written);
        sync_directory(&self.engine.dir);

        self.retire_candidates(&mut summary)?;
        for orphan in recovery::orphan_hint_files(&self.engine.dir)? {
            debug!("Removing orphaned hint file {:?}", orphan);
            remove_file_if_exists(&orphan)?;
            summary.orphan_hints_removed += 1;
        }
        sync_directory(&self.engine.dir);

        info!(
            "Compaction complete: {} records copied ({} tombstones), {} dropped, files {:?} replaced by {:?}",
            summary.records_copied,
            summary.tombstones_kept,
            summary.records_dropped,
            summary.files_removed,
            summary.files_written
        );
        Ok(summary)
    }

    /// Read-only pass over the candidates. Fills the tombstone shadow, fixes
    /// the retirement order and reports whether rewriting would reclaim
    /// anything.
    fn survey(&mut self) -> DbResult<bool> {
        let mut reclaimable = false;
        let mut newest_per_file = Vec::with_capacity(self.candidates.len());
        for &id in &self.candidates {
            let path = log_file::data_path(&self.engine.dir, id);
            let mut scanner = DataFileScanner::open(&path, id)?;
            let keydir = &self.engine.keydir;
            let shadow = &mut self.shadow;
            let retain = self.retain_tombstones;
            let mut newest = f64::NEG_INFINITY;

            let scanned = scanner.scan(|rec| {
                let entry = rec.keydir_entry();
                if entry.timestamp.total_cmp(&newest).is_gt() {
                    newest = entry.timestamp;
                }
                if rec.record.is_tombstone() {
                    let superseded =
                        matches!(keydir.get(rec.record.key)?, Some(c) if c.is_newer_than(&entry));
                    if superseded || !retain {
                        reclaimable = true;
                    }
                    match shadow.get_mut(rec.record.key) {
                        Some(newest_tombstone) => {
                            // Two tombstones for one key: the older is dead.
                            reclaimable = true;
                            if entry.is_newer_than(newest_tombstone) {
                                *newest_tombstone = entry;
                            }
                        }
                        None => {
                            shadow.insert(rec.record.key.to_vec(), entry);
                        }
                    }
                } else if keydir.get(rec.record.key)? != Some(entry) {
                    reclaimable = true;
                }
                Ok(())
            })?;
            if scanned.records == 0 {
                reclaimable = true;
            }
            newest_per_file.push((newest, id));
        }

        newest_per_file.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        self.retire_order = newest_per_file.into_iter().map(|(_, id)| id).collect();
        if !self.retain_tombstones && !self.shadow.is_empty() {
            self.guard_tombstones()?;
        }
        Ok(reclaimable)
    }

    /// Second pass, only needed when tombstones would be dropped. A tombstone
    /// whose file is retired before a file holding an older record of the same
    /// key is copied instead.
    fn guard_tombstones(&mut self) -> DbResult<()> {
        let rank: HashMap<FileId, usize> = self
            .retire_order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        for &id in &self.candidates {
            let path = log_file::data_path(&self.engine.dir, id);
            let mut scanner = DataFileScanner::open(&path, id)?;
            let shadow = &self.shadow;
            let guarded = &mut self.guarded;
            let rank = &rank;

            scanner.scan(|rec| {
                if let Some(tombstone) = shadow.get(rec.record.key) {
                    let entry = rec.keydir_entry();
                    if tombstone.is_newer_than(&entry)
                        && rank.get(&entry.file_id) > rank.get(&tombstone.file_id)
                    {
                        guarded.insert(rec.record.key.to_vec());
                    }
                }
                Ok(())
            })?;
        }
        if !self.guarded.is_empty() {
            debug!(
                "{} tombstones outlive their file and will be copied",
                self.guarded.len()
            );
        }
        Ok(())
    }

    fn is_live(&self, key: &[u8], entry: &KeyDirEntry, tombstone: bool) -> DbResult<bool> {
        let current = self.engine.keydir.get(key)?;
        if !tombstone {
            return Ok(current.as_ref() == Some(entry));
        }
        if self.shadow.get(key) != Some(entry) {
            return Ok(false);
        }
        if !self.retain_tombstones && !self.guarded.contains(key) {
            return Ok(false);
        }
        Ok(!matches!(current, Some(c) if c.is_newer_than(entry)))
    }

    fn merge(&mut self, summary: &mut CompactionSummary) -> DbResult<()> {
        let candidates = self.candidates.clone();
        for id in candidates {
            let path = log_file::data_path(&self.engine.dir, id);
            let mut scanner = DataFileScanner::open(&path, id)?;
            let scanned = scanner.scan(|rec| self.merge_record(&rec, summary))?;
            debug!("Compaction merged file {}: {:?}", id, scanned);
        }
        Ok(())
    }

    fn merge_record(&mut self, rec: &ScannedRecord<'_>, summary: &mut CompactionSummary) -> DbResult<()> {
        let key = rec.record.key;
        let entry = rec.keydir_entry();
        let tombstone = rec.record.is_tombstone();

        let mut guard = self.engine.lock_writer()?;
        let writer = guard.as_mut().ok_or(DbError::NotOpen)?;
        // Checked under the writer lock so no put can land in between.
        if !self.is_live(key, &entry, tombstone)? {
            summary.records_dropped += 1;
            return Ok(());
        }

        let (file_id, offset) = self.output.append(self.engine, writer, rec.raw)?;
        summary.records_copied += 1;
        if tombstone {
            summary.tombstones_kept += 1;
            return Ok(());
        }
        let moved = KeyDirEntry {
            file_id,
            value_position: offset + (entry.value_position - rec.offset),
            ..entry
        };
        if !self.engine.keydir.replace_if(key, &entry, moved)? {
            debug!("Key changed while merging; copy in file {} is dead", file_id);
        }
        Ok(())
    }

    fn retire_candidates(&self, summary: &mut CompactionSummary) -> DbResult<()> {
        let referenced = self.engine.keydir.referenced_files()?;
        let pinned = self.engine.references.pinned_ids()?;
        for (i, &id) in self.retire_order.iter().enumerate() {
            if referenced.contains(&id) || pinned.contains(&id) {
                // Later files may hold records only this one shadows.
                warn!(
                    "File {} is still referenced after compaction; keeping it and {} later files",
                    id,
                    self.retire_order.len() - i - 1
                );
                break;
            }
            self.engine.files_write()?.remove(&id);
            remove_file_if_exists(&log_file::data_path(&self.engine.dir, id))?;
            remove_file_if_exists(&log_file::hint_path(&self.engine.dir, id))?;
            // Unlinks must reach disk in retirement order.
            sync_directory(&self.engine.dir);
            summary.files_removed.push(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_record, TOMBSTONE};
    use crate::config::Options;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    struct SavedFile {
        id: FileId,
        data: Vec<u8>,
        hint: Vec<u8>,
    }

    fn save_files(dir: &Path, ids: &[FileId]) -> Vec<SavedFile> {
        ids.iter()
            .map(|&id| SavedFile {
                id,
                data: fs::read(log_file::data_path(dir, id)).unwrap(),
                hint: fs::read(log_file::hint_path(dir, id)).unwrap(),
            })
            .collect()
    }

    /// Rebuilds every directory state a crash during retirement could leave
    /// (the first `n` files of `removed` gone, the rest still present) and
    /// checks that `key` reads as deleted in each.
    fn assert_deleted_at_every_crash_point(
        dir: &Path,
        saved: &[SavedFile],
        removed: &[FileId],
        key: &[u8],
    ) {
        for n in 0..=removed.len() {
            let crashed = tempdir().unwrap();
            for entry in fs::read_dir(dir).unwrap() {
                let entry = entry.unwrap();
                if entry.file_name() != crate::lock::LOCK_FILE_NAME {
                    fs::copy(entry.path(), crashed.path().join(entry.file_name())).unwrap();
                }
            }
            for file in saved.iter().filter(|f| removed[n..].contains(&f.id)) {
                fs::write(log_file::data_path(crashed.path(), file.id), &file.data).unwrap();
                fs::write(log_file::hint_path(crashed.path(), file.id), &file.hint).unwrap();
            }
            let engine = Engine::open(crashed.path(), Options::default()).unwrap();
            assert_eq!(
                engine.get(key).unwrap(),
                None,
                "key came back with {:?} still on disk",
                &removed[n..]
            );
        }
    }

    fn rotate(engine: &Engine) {
        let mut guard = engine.lock_writer().unwrap();
        engine.rotate(guard.as_mut().unwrap()).unwrap();
    }

    fn data_ids(dir: &Path) -> Vec<FileId> {
        log_file::list_data_file_ids(dir).unwrap()
    }

    #[test]
    fn test_drops_stale_records_and_keeps_live_ones() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(dir.path(), Options::default()).unwrap();
            engine.put(b"a", b"1").unwrap();
            engine.put(b"b", b"2").unwrap();
            engine.put(b"a", b"3").unwrap();
            engine.remove(b"b").unwrap();
            engine.put(b"c", b"4").unwrap();
        }
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        let before = fs::metadata(log_file::data_path(dir.path(), 1)).unwrap().len();

        let summary = engine.compact().unwrap();
        assert!(!summary.skipped);
        assert_eq!(summary.candidates, vec![1]);
        assert_eq!(summary.files_removed, vec![1]);
        assert_eq!(summary.files_written, vec![3]);
        assert_eq!(summary.records_copied, 2);
        assert_eq!(summary.records_dropped, 3);
        assert_eq!(summary.tombstones_kept, 0);

        assert_eq!(data_ids(dir.path()), vec![2, 3]);
        let after = fs::metadata(log_file::data_path(dir.path(), 3)).unwrap().len();
        assert!(after < before);

        assert_eq!(engine.get(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(engine.get(b"b").unwrap(), None);
        assert_eq!(engine.get(b"c").unwrap(), Some(b"4".to_vec()));
        assert_eq!(engine.keydir.get(b"a").unwrap().unwrap().file_id, 3);
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        engine.put(b"k", b"v1").unwrap();
        engine.put(b"k", b"v2").unwrap();
        engine.put(b"j", b"w").unwrap();
        rotate(&engine);

        let first = engine.compact().unwrap();
        assert!(!first.skipped);
        let files = data_ids(dir.path());

        let second = engine.compact().unwrap();
        assert!(second.skipped);
        assert_eq!(data_ids(dir.path()), files);
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(engine.get(b"j").unwrap(), Some(b"w".to_vec()));
    }

    #[test]
    fn test_nothing_to_do_without_read_only_files() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        engine.put(b"k", b"v").unwrap();
        let summary = engine.compact().unwrap();
        assert!(summary.skipped);
        assert!(summary.candidates.is_empty());
    }

    #[test]
    fn test_pinned_file_survives_and_tombstones_are_kept() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        engine.put(b"k", b"v1").unwrap();
        engine.put(b"j", b"x1").unwrap();
        rotate(&engine); // file 1 read-only, active 2

        let mut snap = engine.create_snapshot().unwrap();
        assert_eq!(snap.file_ids(), &[1]);

        engine.put(b"j", b"x2").unwrap();
        engine.put(b"j", b"x3").unwrap();
        engine.remove(b"k").unwrap();
        rotate(&engine); // file 2 read-only, active 3

        let summary = engine.compact().unwrap();
        assert_eq!(summary.candidates, vec![2]);
        assert_eq!(summary.files_removed, vec![2]);
        assert_eq!(summary.tombstones_kept, 1);
        assert!(log_file::data_path(dir.path(), 1).exists());

        assert_eq!(engine.get_with_snapshot(b"k", &snap).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(engine.get_with_snapshot(b"j", &snap).unwrap(), Some(b"x1".to_vec()));
        assert_eq!(engine.get(b"k").unwrap(), None);
        assert_eq!(engine.get(b"j").unwrap(), Some(b"x3".to_vec()));

        snap.close().unwrap();
        let summary = engine.compact().unwrap();
        assert!(summary.files_removed.contains(&1));
        assert!(!log_file::data_path(dir.path(), 1).exists());
        assert_eq!(summary.tombstones_kept, 0);
        assert_eq!(engine.get(b"k").unwrap(), None);
        assert_eq!(engine.get(b"j").unwrap(), Some(b"x3".to_vec()));
    }

    #[test]
    fn test_kept_tombstone_shadows_pinned_value_after_restart() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(dir.path(), Options::default()).unwrap();
            engine.put(b"k", b"v1").unwrap();
            rotate(&engine);
            let _snap = engine.create_snapshot().unwrap();
            engine.remove(b"k").unwrap();
            engine.put(b"other", b"a").unwrap();
            engine.put(b"other", b"b").unwrap();
            rotate(&engine);
            let summary = engine.compact().unwrap();
            assert_eq!(summary.tombstones_kept, 1);
        }
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), None);
        assert_eq!(engine.get(b"other").unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn test_merged_value_is_retired_before_its_tombstone() {
        let dir = tempdir().unwrap();
        let (saved, removed) = {
            let engine = Engine::open(dir.path(), Options::default()).unwrap();
            engine.put(b"k", b"v1").unwrap();
            rotate(&engine); // active 2
            engine.compact().unwrap(); // v1 now in merge file 3
            engine.remove(b"k").unwrap(); // tombstone in file 2
            rotate(&engine); // active 4

            let saved = save_files(dir.path(), &[2, 3]);
            let summary = engine.compact().unwrap();
            assert_eq!(summary.candidates, vec![2, 3]);
            assert_eq!(summary.tombstones_kept, 0);
            // The merge file holds only older records, so it goes first.
            assert_eq!(summary.files_removed, vec![3, 2]);
            assert_eq!(engine.get(b"k").unwrap(), None);
            engine.close().unwrap();
            (saved, summary.files_removed)
        };
        assert_deleted_at_every_crash_point(dir.path(), &saved, &removed, b"k");
    }

    #[test]
    fn test_tombstone_copied_when_older_value_is_retired_later() {
        let dir = tempdir().unwrap();
        // File 1 is retired first (newest record 10.0) yet its tombstone
        // shadows a value in file 2 (newest record 20.0).
        for (id, records) in [
            (1, vec![(&b"k"[..], TOMBSTONE, 10.0)]),
            (2, vec![(&b"k"[..], &b"v1"[..], 5.0), (&b"j"[..], &b"w"[..], 20.0)]),
        ] {
            let mut file = LogFile::create(dir.path(), id).unwrap();
            for (k, v, ts) in records {
                file.append_records(&encode_record(k, v, ts), false).unwrap();
            }
            file.close_for_writing().unwrap();
        }

        let (saved, removed) = {
            let engine = Engine::open(dir.path(), Options::default()).unwrap();
            assert_eq!(engine.get(b"k").unwrap(), None);
            let saved = save_files(dir.path(), &[1, 2]);

            let summary = engine.compact().unwrap();
            assert_eq!(summary.files_removed, vec![1, 2]);
            assert_eq!(summary.tombstones_kept, 1);
            assert_eq!(summary.records_copied, 2);
            assert_eq!(engine.get(b"j").unwrap(), Some(b"w".to_vec()));
            engine.close().unwrap();
            (saved, summary.files_removed)
        };
        assert_deleted_at_every_crash_point(dir.path(), &saved, &removed, b"k");

        // Once the value is gone the tombstone is dropped on the next run.
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        let summary = engine.compact().unwrap();
        assert!(!summary.skipped);
        assert_eq!(summary.tombstones_kept, 0);
        assert_eq!(engine.get(b"k").unwrap(), None);
        assert_eq!(engine.get(b"j").unwrap(), Some(b"w".to_vec()));
    }

    #[test]
    fn test_orphan_hint_files_are_swept() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        let orphan = log_file::hint_path(dir.path(), 99);
        fs::write(&orphan, b"junk").unwrap();

        let summary = engine.compact().unwrap();
        assert!(!summary.skipped);
        assert_eq!(summary.orphan_hints_removed, 1);
        assert!(!orphan.exists());
    }

    #[test]
    fn test_output_rotates_at_max_file_size() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Options::default().with_max_file_size(64)).unwrap();
        for i in 0..4 {
            let key = format!("k{}", i);
            engine.put(key.as_bytes(), &[b'a' + i as u8; 20]).unwrap();
        }
        engine.put(b"k0", &[b'z'; 20]).unwrap();
        rotate(&engine);

        let summary = engine.compact().unwrap();
        assert_eq!(summary.records_copied, 4);
        assert_eq!(summary.files_written.len(), 4);
        for id in data_ids(dir.path()) {
            let len = fs::metadata(log_file::data_path(dir.path(), id)).unwrap().len();
            assert!(len <= 64);
        }
        assert_eq!(engine.get(b"k0").unwrap(), Some(vec![b'z'; 20]));
        assert_eq!(engine.get(b"k3").unwrap(), Some(vec![b'd'; 20]));
    }
}
