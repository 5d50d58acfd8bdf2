use crate::codec::{self, HINT_CRC};
use crate::error::{DbError, DbResult};
use crc::Digest;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Identity of a log file; higher ids were created later.
pub type FileId = u64;

const DATA_SUFFIX: &str = ".medea.data";
const HINT_SUFFIX: &str = ".medea.hint";

pub fn data_path(dir: &Path, id: FileId) -> PathBuf {
    dir.join(format!("{}{}", id, DATA_SUFFIX))
}

pub fn hint_path(dir: &Path, id: FileId) -> PathBuf {
    dir.join(format!("{}{}", id, HINT_SUFFIX))
}

pub fn parse_data_file_name(name: &str) -> Option<FileId> {
    parse_numbered(name, DATA_SUFFIX)
}

pub fn parse_hint_file_name(name: &str) -> Option<FileId> {
    parse_numbered(name, HINT_SUFFIX)
}

fn parse_numbered(name: &str, suffix: &str) -> Option<FileId> {
    let stem = name.strip_suffix(suffix)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Ids of every `.medea.data` file in `dir`, oldest first.
pub fn list_data_file_ids(dir: &Path) -> io::Result<Vec<FileId>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_data_file_name) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Shared, read-only handle on a data file. Reads are positioned, so one
/// handle serves any number of concurrent readers.
#[derive(Debug)]
pub struct DataReader {
    id: FileId,
    path: PathBuf,
    file: File,
}

impl DataReader {
    pub fn open(dir: &Path, id: FileId) -> io::Result<Self> {
        let path = data_path(dir, id);
        let file = File::open(&path)?;
        Ok(DataReader { id, path, file })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        read_exact_at(&self.file, buf, offset)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Fresh,
    Writable,
    Closing,
    ReadOnly,
}

/// The writable side of one data file and its paired hint file.
///
/// `LogFile` assumes a single writer; the engine serializes access.
pub struct LogFile {
    id: FileId,
    data_path: PathBuf,
    hint_path: PathBuf,
    data: BufWriter<File>,
    hint: Option<BufWriter<File>>,
    offset: u64,
    hint_digest: Digest<'static, u32>,
    trailer_written: bool,
    state: FileState,
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("id", &self.id)
            .field("data_path", &self.data_path)
            .field("offset", &self.offset)
            .field("state", &self.state)
            .finish()
    }
}

impl LogFile {
    /// Creates `{id}.medea.data` and `{id}.medea.hint` in `dir`. Both must not
    /// exist yet.
    pub fn create(dir: &Path, id: FileId) -> DbResult<Self> {
        let data_path = data_path(dir, id);
        let hint_path = hint_path(dir, id);

        let data = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&data_path)?;
        let hint = match OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&hint_path)
        {
            Ok(f) => f,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&data_path) {
                    warn!(
                        "Failed to remove {:?} after hint file creation failed: {}",
                        data_path, cleanup
                    );
                }
                return Err(e.into());
            }
        };

        debug!("Created log file {} at {:?}", id, data_path);
        Ok(LogFile {
            id,
            data_path,
            hint_path,
            data: BufWriter::new(data),
            hint: Some(BufWriter::new(hint)),
            offset: 0,
            hint_digest: HINT_CRC.digest(),
            trailer_written: false,
            state: FileState::Fresh,
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn hint_path(&self) -> &Path {
        &self.hint_path
    }

    fn ensure_writable(&self) -> DbResult<()> {
        match self.state {
            FileState::Fresh | FileState::Writable => Ok(()),
            _ => Err(DbError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("log file {} is closed for writing", self.id),
            ))),
        }
    }

    /// Appends raw record bytes and returns the offset they start at.
    pub fn append(&mut self, bytes: &[u8]) -> DbResult<u64> {
        self.ensure_writable()?;
        let start = self.offset;
        self.data.write_all(bytes)?;
        self.data.flush()?;
        self.offset += bytes.len() as u64;
        self.state = FileState::Writable;
        Ok(start)
    }

    /// Appends hint bytes and folds them into the running hint CRC.
    pub fn append_hint(&mut self, bytes: &[u8]) -> DbResult<()> {
        self.ensure_writable()?;
        if let Some(hint) = self.hint.as_mut() {
            hint.write_all(bytes)?;
            hint.flush()?;
            self.hint_digest.update(bytes);
        }
        Ok(())
    }

    /// Appends one or more concatenated records, then the hint records derived
    /// from exactly those bytes. Returns the offset of the first record.
    pub fn append_records(&mut self, records: &[u8], sync: bool) -> DbResult<u64> {
        let start = self.append(records)?;

        let mut hints = Vec::with_capacity(records.len().min(4096));
        let mut pos = 0usize;
        while pos < records.len() {
            let header = codec::RecordHeader::parse(&records[pos..])
                .map_err(|e| DbError::corrupt(self.id, start + pos as u64, e.to_string()))?;
            let len = header.record_len() as usize;
            codec::encode_hint_into(&mut hints, &records[pos..pos + len], start + pos as u64);
            pos += len;
        }
        self.append_hint(&hints)?;

        if sync {
            self.sync()?;
        }
        Ok(start)
    }

    /// Flushes and fsyncs both streams.
    pub fn sync(&mut self) -> DbResult<()> {
        if self.state == FileState::ReadOnly {
            return Ok(());
        }
        self.data.flush()?;
        if let Err(e) = self.data.get_ref().sync_all() {
            error!("Failed to sync data file {:?}: {}", self.data_path, e);
            return Err(e.into());
        }
        if let Some(hint) = self.hint.as_mut() {
            hint.flush()?;
            if let Err(e) = hint.get_ref().sync_all() {
                error!("Failed to sync hint file {:?}: {}", self.hint_path, e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Flushes and fsyncs the data file, appends the hint CRC trailer, fsyncs
    /// and closes the hint file. Calling it again is a no-op.
    pub fn close_for_writing(&mut self) -> DbResult<()> {
        if self.state == FileState::ReadOnly {
            return Ok(());
        }
        self.state = FileState::Closing;

        self.data.flush()?;
        self.data.get_ref().sync_all()?;

        if let Some(hint) = self.hint.as_mut() {
            if !self.trailer_written {
                let crc = self.hint_digest.clone().finalize();
                hint.write_all(&crc.to_be_bytes())?;
                self.trailer_written = true;
            }
            hint.flush()?;
            hint.get_ref().sync_all()?;
        }
        self.hint = None;
        self.state = FileState::ReadOnly;
        info!("Closed log file {} for writing at offset {}", self.id, self.offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_hint, encode_record, HINT_HEADER_SIZE};
    use tempfile::tempdir;

    #[test]
    fn test_file_names() {
        let dir = Path::new("/tmp/db");
        assert_eq!(data_path(dir, 7), PathBuf::from("/tmp/db/7.medea.data"));
        assert_eq!(hint_path(dir, 7), PathBuf::from("/tmp/db/7.medea.hint"));
        assert_eq!(parse_data_file_name("12.medea.data"), Some(12));
        assert_eq!(parse_data_file_name("12.medea.hint"), None);
        assert_eq!(parse_data_file_name("x12.medea.data"), None);
        assert_eq!(parse_data_file_name(".medea.data"), None);
        assert_eq!(parse_hint_file_name("3.medea.hint"), Some(3));
    }

    #[test]
    fn test_append_returns_pre_write_offset() {
        let dir = tempdir().unwrap();
        let mut file = LogFile::create(dir.path(), 1).unwrap();
        assert_eq!(file.state(), FileState::Fresh);

        let first = encode_record(b"a", b"1", 1.0);
        let second = encode_record(b"bb", b"22", 2.0);
        assert_eq!(file.append_records(&first, false).unwrap(), 0);
        assert_eq!(
            file.append_records(&second, false).unwrap(),
            first.len() as u64
        );
        assert_eq!(file.state(), FileState::Writable);
        assert_eq!(file.offset(), (first.len() + second.len()) as u64);

        let reader = DataReader::open(dir.path(), 1).unwrap();
        let mut buf = vec![0u8; second.len()];
        reader.read_exact_at(&mut buf, first.len() as u64).unwrap();
        assert_eq!(buf, second);
    }

    #[test]
    fn test_hints_follow_records_and_trailer_written_once() {
        let dir = tempdir().unwrap();
        let mut file = LogFile::create(dir.path(), 3).unwrap();
        let mut batch = encode_record(b"k1", b"v1", 1.0);
        batch.extend(encode_record(b"k2", b"value2", 2.0));
        file.append_records(&batch, true).unwrap();

        file.close_for_writing().unwrap();
        file.close_for_writing().unwrap();
        assert_eq!(file.state(), FileState::ReadOnly);

        let hints = fs::read(hint_path(dir.path(), 3)).unwrap();
        assert_eq!(hints.len(), 2 * HINT_HEADER_SIZE + 4 + 4);

        let h1 = decode_hint(&hints).unwrap();
        assert_eq!(h1.key, b"k1");
        assert_eq!(h1.record_offset, 0);
        let h2 = decode_hint(&hints[h1.len()..]).unwrap();
        assert_eq!(h2.key, b"k2");
        assert_eq!(h2.record_offset, h1.total_size as u64);

        let body = &hints[..hints.len() - 4];
        let trailer = u32::from_be_bytes(hints[hints.len() - 4..].try_into().unwrap());
        assert_eq!(trailer, HINT_CRC.checksum(body));
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = tempdir().unwrap();
        let mut file = LogFile::create(dir.path(), 1).unwrap();
        file.close_for_writing().unwrap();
        assert!(file.append(b"late").is_err());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let _first = LogFile::create(dir.path(), 5).unwrap();
        assert!(LogFile::create(dir.path(), 5).is_err());
    }

    #[test]
    fn test_create_cleans_up_data_file_when_hint_exists() {
        let dir = tempdir().unwrap();
        fs::write(hint_path(dir.path(), 7), b"stale").unwrap();
        assert!(LogFile::create(dir.path(), 7).is_err());
        assert!(!data_path(dir.path(), 7).exists());
    }

    #[test]
    fn test_list_data_file_ids_sorted() {
        let dir = tempdir().unwrap();
        for id in [10u64, 2, 33] {
            LogFile::create(dir.path(), id).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(list_data_file_ids(dir.path()).unwrap(), vec![2, 10, 33]);
    }
}
