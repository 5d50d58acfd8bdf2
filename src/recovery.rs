//! Rebuilds the keydir when a database is opened.
//!
//! Every data file is visited oldest first. A file's hint file is used when it
//! passes validation (trailer CRC, every entry inside the data file); anything
//! else falls back to parsing the data file itself. Entries are arbitrated by
//! commit order (timestamp, file id, position), tombstones included, and keys
//! whose newest record is a tombstone are dropped at the end.

use crate::codec::{self, RecordHeader, HEADER_SIZE, HINT_CRC, HINT_HEADER_SIZE};
use crate::error::{DbError, DbResult};
use crate::keydir::KeyDirEntry;
use crate::log_file::{self, DataReader, FileId};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A record read from a data file, borrowed from the scanner's buffer.
#[derive(Debug)]
pub struct ScannedRecord<'a> {
    pub file_id: FileId,
    pub offset: u64,
    /// The full encoded record, header included.
    pub raw: &'a [u8],
    pub record: codec::Record<'a>,
}

impl ScannedRecord<'_> {
    pub fn keydir_entry(&self) -> KeyDirEntry {
        KeyDirEntry {
            file_id: self.file_id,
            value_size: self.record.header.value_size,
            value_position: self.offset + HEADER_SIZE as u64 + self.record.key.len() as u64,
            timestamp: self.record.timestamp(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanSummary {
    pub records: usize,
    pub skipped: usize,
    /// Bytes up to the end of the last complete record.
    pub valid_len: u64,
    pub torn_tail: bool,
}

/// Streams the records of one data file in append order.
pub struct DataFileScanner {
    file_id: FileId,
    reader: BufReader<File>,
    offset: u64,
    file_len: u64,
    buf: Vec<u8>,
}

impl DataFileScanner {
    pub fn open(path: &Path, file_id: FileId) -> DbResult<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(DataFileScanner {
            file_id,
            reader: BufReader::with_capacity(64 * 1024, file),
            offset: 0,
            file_len,
            buf: Vec::with_capacity(4096),
        })
    }

    /// Calls `visit` for every complete record.
    ///
    /// A record cut short by the end of the file is treated as a torn write and
    /// ends the scan cleanly. A record with an empty key is filler and is
    /// skipped. A complete record failing its CRC is `CorruptRecord`.
    pub fn scan<F>(&mut self, mut visit: F) -> DbResult<ScanSummary>
    where
        F: FnMut(ScannedRecord<'_>) -> DbResult<()>,
    {
        let mut summary = ScanSummary::default();
        loop {
            let record_offset = self.offset;

            self.buf.clear();
            self.buf.resize(HEADER_SIZE, 0);
            let got = read_full(&mut self.reader, &mut self.buf)?;
            if got == 0 {
                break;
            }
            if got < HEADER_SIZE {
                warn!(
                    "File {}: torn header at offset {} ({} of {} bytes)",
                    self.file_id, record_offset, got, HEADER_SIZE
                );
                summary.torn_tail = true;
                break;
            }

            let header = RecordHeader::parse(&self.buf)
                .map_err(|e| DbError::corrupt(self.file_id, record_offset, e.to_string()))?;
            // Sizes come from disk; never allocate past the end of the file.
            let remaining = self.file_len.saturating_sub(record_offset);
            if header.record_len() > remaining {
                warn!(
                    "File {}: record at offset {} claims {} bytes, only {} remain",
                    self.file_id,
                    record_offset,
                    header.record_len(),
                    remaining
                );
                summary.torn_tail = true;
                break;
            }
            let len = header.record_len() as usize;
            self.buf.resize(len, 0);
            let body = read_full(&mut self.reader, &mut self.buf[HEADER_SIZE..])?;
            if body < len - HEADER_SIZE {
                warn!(
                    "File {}: torn record at offset {} ({} of {} bytes)",
                    self.file_id,
                    record_offset,
                    HEADER_SIZE + body,
                    len
                );
                summary.torn_tail = true;
                break;
            }
            self.offset += len as u64;

            if header.key_size == 0 {
                debug!(
                    "File {}: skipping {} filler bytes at offset {}",
                    self.file_id, len, record_offset
                );
                summary.skipped += 1;
                summary.valid_len = self.offset;
                continue;
            }

            let record = codec::decode_record(&self.buf)
                .map_err(|e| DbError::corrupt(self.file_id, record_offset, e.to_string()))?;
            visit(ScannedRecord {
                file_id: self.file_id,
                offset: record_offset,
                raw: &self.buf[..len],
                record,
            })?;
            summary.records += 1;
            summary.valid_len = self.offset;
        }
        Ok(summary)
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// An owned hint entry, already translated to a keydir location.
#[derive(Debug, Clone, PartialEq)]
pub struct HintRecord {
    pub key: Vec<u8>,
    pub entry: KeyDirEntry,
}

/// Reads and validates a whole hint file. `Err` carries the reason the hint
/// file cannot be trusted; the caller falls back to the data file.
pub fn load_hint_file(path: &Path, file_id: FileId, data_len: u64) -> Result<Vec<HintRecord>, String> {
    let bytes = fs::read(path).map_err(|e| format!("unreadable: {}", e))?;
    if bytes.is_empty() && data_len > 0 {
        return Err("empty hint file for non-empty data file".to_string());
    }

    let mut digest = HINT_CRC.digest();
    let mut records = Vec::new();
    let mut covered = 0u64;
    let mut pos = 0usize;
    while pos < bytes.len() {
        let remaining = bytes.len() - pos;
        if remaining < HINT_HEADER_SIZE {
            if remaining != codec::CRC_SIZE {
                return Err(format!("{} trailing bytes at offset {}", remaining, pos));
            }
            let mut trailer = [0u8; codec::CRC_SIZE];
            trailer.copy_from_slice(&bytes[pos..]);
            let stored = u32::from_be_bytes(trailer);
            let computed = digest.finalize();
            if stored != computed {
                return Err(format!(
                    "trailer CRC mismatch: stored 0x{:08x}, computed 0x{:08x}",
                    stored, computed
                ));
            }
            return check_coverage(records, covered, data_len);
        }

        let hint = codec::decode_hint(&bytes[pos..])
            .map_err(|e| format!("bad hint at offset {}: {}", pos, e))?;
        let end = hint.record_offset.saturating_add(hint.total_size as u64);
        if end > data_len {
            return Err(format!(
                "hint at offset {} points past the data file ({} > {})",
                pos, end, data_len
            ));
        }
        covered = covered.max(end);
        digest.update(&bytes[pos..pos + hint.len()]);
        pos += hint.len();

        if hint.key.is_empty() {
            continue;
        }
        records.push(HintRecord {
            key: hint.key.to_vec(),
            entry: KeyDirEntry {
                file_id,
                value_size: hint.value_size(),
                value_position: hint.value_position(),
                timestamp: hint.timestamp,
            },
        });
    }
    // No trailer: the file was never closed for writing.
    check_coverage(records, covered, data_len)
}

// A crash between the data append and the hint append leaves records the
// hint file never heard of.
fn check_coverage(
    records: Vec<HintRecord>,
    covered: u64,
    data_len: u64,
) -> Result<Vec<HintRecord>, String> {
    if covered != data_len {
        return Err(format!(
            "hint file covers {} of {} data bytes",
            covered, data_len
        ));
    }
    Ok(records)
}

/// Result of rebuilding the keydir.
#[derive(Debug, Default)]
pub struct Recovered {
    pub entries: HashMap<Vec<u8>, KeyDirEntry>,
    /// Newest timestamp seen in any record, tombstones included.
    pub max_timestamp: f64,
    pub hint_files_used: usize,
    pub data_files_scanned: usize,
}

#[derive(Default)]
struct Arbiter {
    table: HashMap<Vec<u8>, (KeyDirEntry, bool)>,
    max_timestamp: f64,
}

impl Arbiter {
    fn offer(&mut self, key: Vec<u8>, entry: KeyDirEntry, tombstone: bool) {
        if entry.timestamp > self.max_timestamp {
            self.max_timestamp = entry.timestamp;
        }
        match self.table.get(&key) {
            Some((current, _)) if !entry.is_newer_than(current) => {}
            _ => {
                self.table.insert(key, (entry, tombstone));
            }
        }
    }

    fn finish(self) -> (HashMap<Vec<u8>, KeyDirEntry>, f64) {
        let entries = self
            .table
            .into_iter()
            .filter(|(_, (_, tombstone))| !tombstone)
            .map(|(k, (e, _))| (k, e))
            .collect();
        (entries, self.max_timestamp)
    }
}

fn hint_points_at_tombstone(reader: &DataReader, entry: &KeyDirEntry) -> DbResult<bool> {
    if entry.value_size as usize != codec::TOMBSTONE.len() {
        return Ok(false);
    }
    let mut value = [0u8; 15];
    reader.read_exact_at(&mut value, entry.value_position)?;
    Ok(codec::is_tombstone(&value))
}

/// Rebuilds the keydir from every readable data file.
pub fn rebuild(dir: &Path, files: &BTreeMap<FileId, Arc<DataReader>>) -> DbResult<Recovered> {
    let mut arbiter = Arbiter::default();
    let mut recovered = Recovered::default();

    for (&file_id, reader) in files {
        let data_len = reader.len()?;
        let hint_path = log_file::hint_path(dir, file_id);

        match load_hint_file(&hint_path, file_id, data_len) {
            Ok(hints) => {
                debug!("File {}: loaded {} hint entries", file_id, hints.len());
                for hint in hints {
                    let tombstone = hint_points_at_tombstone(reader, &hint.entry)?;
                    arbiter.offer(hint.key, hint.entry, tombstone);
                }
                recovered.hint_files_used += 1;
            }
            Err(reason) => {
                warn!(
                    "Hint file {:?} rejected ({}). Scanning data file instead.",
                    hint_path, reason
                );
                let mut scanner = DataFileScanner::open(reader.path(), file_id)?;
                let summary = scanner.scan(|scanned| {
                    arbiter.offer(
                        scanned.record.key.to_vec(),
                        scanned.keydir_entry(),
                        scanned.record.is_tombstone(),
                    );
                    Ok(())
                })?;
                debug!("File {}: scanned {:?}", file_id, summary);
                recovered.data_files_scanned += 1;
            }
        }
    }

    let (entries, max_timestamp) = arbiter.finish();
    recovered.entries = entries;
    recovered.max_timestamp = max_timestamp;
    info!(
        "Recovered {} keys from {} files ({} via hint files, {} via data scan)",
        recovered.entries.len(),
        files.len(),
        recovered.hint_files_used,
        recovered.data_files_scanned
    );
    Ok(recovered)
}

/// Removes zero-byte data files with their hint files, and zero-byte hint
/// files, left behind by a crash during file creation. Returns how many files
/// were removed.
pub fn remove_empty_files(dir: &Path) -> DbResult<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if let Some(id) = log_file::parse_data_file_name(name) {
            if entry.metadata()?.len() == 0 {
                warn!("Removing empty data file {:?}", entry.path());
                fs::remove_file(entry.path())?;
                removed += 1;
                let hint = log_file::hint_path(dir, id);
                if hint.exists() {
                    fs::remove_file(&hint)?;
                    removed += 1;
                }
            }
        } else if log_file::parse_hint_file_name(name).is_some()
            && entry.path().exists()
            && entry.metadata()?.len() == 0
        {
            warn!("Removing empty hint file {:?}", entry.path());
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Hint files whose data file no longer exists.
pub fn orphan_hint_files(dir: &Path) -> DbResult<Vec<PathBuf>> {
    let mut orphans = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(log_file::parse_hint_file_name) {
            if !log_file::data_path(dir, id).exists() {
                orphans.push(entry.path());
            }
        }
    }
    orphans.sort();
    Ok(orphans)
}
