//! Append-only page log.
//!
//! Every `put` appends one framed entry; the newest entry for a date wins.
//! Layout:
//!
//! ```text
//! header: "PGL\0" | version u8
//! entry:  "PGE\0" | version u8 | len u32 LE | MessagePack(DailyPage) | crc32 u32 LE
//! ```

use crate::error::{PageError, Result};
use crate::types::{DailyPage, PageDate};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the log file header.
const LOG_MAGIC: &[u8; 4] = b"PGL\0";

/// Magic bytes opening every entry.
const ENTRY_MAGIC: &[u8; 4] = b"PGE\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Size of the file header.
const HEADER_SIZE: u64 = 5;

/// Fixed bytes around each payload (magic + version + len + crc).
const ENTRY_OVERHEAD: u64 = 4 + 1 + 4 + 4;

/// Upper bound on a single encoded page.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// New entries found by [`PageLog::follow`].
#[derive(Debug, PartialEq, Eq)]
pub enum LogTail {
    /// `(offset, date)` of entries written after the last known end.
    Appended(Vec<(u64, PageDate)>),
    /// The log no longer continues from the last known end; every entry it
    /// now holds.
    Rewritten(Vec<(u64, PageDate)>),
}

/// Append-only log of page records.
pub struct PageLog {
    /// Path to the log file.
    path: PathBuf,

    /// Log file handle.
    file: Mutex<File>,

    /// Logical end of the log.
    file_size: RwLock<u64>,

    /// fsync after every append.
    sync_writes: bool,
}

impl PageLog {
    /// Open or create a page log.
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            Self::write_header(&mut file)?;
            file.sync_all()?;
        } else {
            Self::verify_header(&mut file)?;
        }

        let file_size = file.metadata()?.len();

        Ok(Self {
            path,
            file: Mutex::new(file),
            file_size: RwLock::new(file_size),
            sync_writes,
        })
    }

    /// Open an existing log for reading only.
    ///
    /// Nothing is scanned yet; call [`PageLog::follow`] to load entries.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = File::open(&path)?;
        Self::verify_header(&mut file)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            file_size: RwLock::new(HEADER_SIZE),
            sync_writes: false,
        })
    }

    /// Scan every entry, returning `(offset, date)` in log order.
    ///
    /// A partially written final entry is cut off so the next append starts
    /// on a clean boundary. A damaged entry anywhere else is an error.
    pub fn recover(&self) -> Result<Vec<(u64, PageDate)>> {
        let mut file = self.file.lock();
        let end = *self.file_size.read();

        let (entries, offset) = Self::scan(&mut *file, HEADER_SIZE, end)?;

        if offset < end {
            warn!(
                path = %self.path.display(),
                offset,
                dropped_bytes = end - offset,
                "truncating torn entry at end of page log"
            );
            file.set_len(offset)?;
            file.sync_all()?;
            *self.file_size.write() = offset;
        }

        Ok(entries)
    }

    /// Pick up entries another handle wrote since the last call.
    ///
    /// Never modifies the file: an entry still being written is left for
    /// the next call. When the bytes at the last known end are no longer an
    /// entry boundary, or the file shrank, the log is rescanned from the
    /// header.
    pub fn follow(&self) -> Result<LogTail> {
        let mut file = self.file.lock();
        let mut size = self.file_size.write();
        let end = file.metadata()?.len();

        if end >= *size {
            match Self::scan(&mut *file, *size, end) {
                Ok((entries, next)) => {
                    *size = next;
                    return Ok(LogTail::Appended(entries));
                }
                Err(PageError::Corruption(reason)) => {
                    debug!(
                        path = %self.path.display(),
                        offset = *size,
                        %reason,
                        "page log no longer continues at last known end, rescanning"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let (entries, next) = Self::scan(&mut *file, HEADER_SIZE, end)?;
        *size = next;
        Ok(LogTail::Rewritten(entries))
    }

    /// Append a page, returning the offset of its entry.
    ///
    /// On error nothing of the entry is left in the file.
    pub fn append(&self, page: &DailyPage) -> Result<u64> {
        self.append_with_sync(page, |file| file.sync_data())
    }

    fn append_with_sync(
        &self,
        page: &DailyPage,
        sync: impl FnOnce(&File) -> io::Result<()>,
    ) -> Result<u64> {
        let frame = Self::encode_entry(page)?;

        let mut file = self.file.lock();
        let mut size = self.file_size.write();
        let offset = *size;

        file.seek(SeekFrom::Start(offset))?;
        let mut written = file.write_all(&frame);
        if written.is_ok() && self.sync_writes {
            written = sync(&*file);
        }

        if let Err(e) = written {
            // A later sync must not persist an entry the caller saw fail.
            if let Err(rollback) = file.set_len(offset) {
                warn!(
                    path = %self.path.display(),
                    offset,
                    error = %e,
                    "could not roll back failed append"
                );
                return Err(rollback.into());
            }
            return Err(e.into());
        }

        *size = offset + frame.len() as u64;
        Ok(offset)
    }

    /// Read the page stored at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<DailyPage> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let (page, _) = Self::read_entry(&mut *file)?;
        Ok(page)
    }

    /// Replace the whole log with `pages`, returning their new offsets.
    ///
    /// The new log is written beside the old one and renamed over it, so a
    /// crash leaves either the old or the new file intact.
    pub fn rewrite(&self, pages: &[DailyPage]) -> Result<Vec<(u64, PageDate)>> {
        let mut file = self.file.lock();
        let mut size = self.file_size.write();

        let tmp_path = self.path.with_extension("log.compact");
        let mut offsets = Vec::with_capacity(pages.len());
        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            writer.write_all(LOG_MAGIC)?;
            writer.write_all(&[LOG_VERSION])?;

            let mut offset = HEADER_SIZE;
            for page in pages {
                let frame = Self::encode_entry(page)?;
                writer.write_all(&frame)?;
                offsets.push((offset, page.date));
                offset += frame.len() as u64;
            }

            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;

        let reopened = OpenOptions::new().read(true).write(true).open(&self.path)?;
        *size = reopened.metadata()?.len();
        *file = reopened;

        debug!(entries = pages.len(), size = *size, "rewrote page log");
        Ok(offsets)
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> u64 {
        *self.file_size.read()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        Ok(())
    }

    fn verify_header(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| PageError::InvalidFormat("Truncated page log header".into()))?;
        if &magic != LOG_MAGIC {
            return Err(PageError::InvalidFormat("Invalid page log magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)
            .map_err(|_| PageError::InvalidFormat("Truncated page log header".into()))?;
        if version[0] != LOG_VERSION {
            return Err(PageError::InvalidFormat(format!(
                "Unsupported page log version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    /// Read entries from `start` until `end` or the first incomplete one.
    ///
    /// Returns the entries and the offset just past the last complete one.
    fn scan(file: &mut File, start: u64, end: u64) -> Result<(Vec<(u64, PageDate)>, u64)> {
        let mut entries = Vec::new();
        let mut offset = start;

        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);
        while offset < end {
            match Self::read_entry(&mut reader) {
                Ok((page, consumed)) => {
                    entries.push((offset, page.date));
                    offset += consumed;
                }
                Err(PageError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }

        Ok((entries, offset))
    }

    fn encode_entry(page: &DailyPage) -> Result<Vec<u8>> {
        let payload = rmp_serde::to_vec_named(page)?;
        if payload.len() > MAX_ENTRY_SIZE {
            return Err(PageError::Serialization(format!(
                "page for {} is too large ({} bytes)",
                page.date,
                payload.len()
            )));
        }

        let mut frame = Vec::with_capacity(payload.len() + ENTRY_OVERHEAD as usize);
        frame.extend_from_slice(ENTRY_MAGIC);
        frame.push(LOG_VERSION);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(frame)
    }

    /// Read one entry, returning the page and the bytes consumed.
    fn read_entry(reader: &mut impl Read) -> Result<(DailyPage, u64)> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != ENTRY_MAGIC {
            return Err(PageError::Corruption("Invalid page entry magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(PageError::InvalidFormat(format!(
                "Unsupported page entry version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_SIZE {
            return Err(PageError::Corruption("Page entry too large".into()));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&payload);
        if stored != computed {
            return Err(PageError::Corruption(format!(
                "Page entry checksum mismatch: expected {stored:#010x}, got {computed:#010x}"
            )));
        }

        let page: DailyPage = rmp_serde::from_slice(&payload)?;
        Ok((page, ENTRY_OVERHEAD + len as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn page(date: &str, journal: &str) -> DailyPage {
        let mut page = DailyPage::empty(PageDate::parse(date).unwrap());
        page.journal = journal.to_string();
        page
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = PageLog::open(dir.path().join("pages.log"), true).unwrap();

        let first = page("2024-03-01", "first");
        let second = page("2024-03-02", "second");
        let off1 = log.append(&first).unwrap();
        let off2 = log.append(&second).unwrap();

        assert_eq!(off1, HEADER_SIZE);
        assert!(off2 > off1);
        assert_eq!(log.read_at(off1).unwrap(), first);
        assert_eq!(log.read_at(off2).unwrap(), second);
    }

    #[test]
    fn test_recover_lists_entries_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.log");

        {
            let log = PageLog::open(&path, true).unwrap();
            log.append(&page("2024-03-02", "a")).unwrap();
            log.append(&page("2024-03-01", "b")).unwrap();
            log.append(&page("2024-03-02", "c")).unwrap();
        }

        let log = PageLog::open(&path, true).unwrap();
        let dates: Vec<String> = log
            .recover()
            .unwrap()
            .into_iter()
            .map(|(_, d)| d.to_string())
            .collect();
        assert_eq!(dates, vec!["2024-03-02", "2024-03-01", "2024-03-02"]);
    }

    #[test]
    fn test_recover_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.log");

        let intact_size = {
            let log = PageLog::open(&path, true).unwrap();
            log.append(&page("2024-03-01", "kept")).unwrap();
            let size = log.size();
            log.append(&page("2024-03-02", "torn")).unwrap();
            size
        };

        // Chop the second entry in half.
        let full = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(intact_size + (full - intact_size) / 2).unwrap();
        drop(file);

        let log = PageLog::open(&path, true).unwrap();
        let entries = log.recover().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(log.size(), intact_size);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_size);

        // Appends land right after the surviving entry.
        let offset = log.append(&page("2024-03-03", "after")).unwrap();
        assert_eq!(offset, intact_size);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.log");

        {
            let log = PageLog::open(&path, true).unwrap();
            log.append(&page("2024-03-01", "some journal text")).unwrap();
        }

        // Flip a byte inside the payload.
        let mut bytes = fs::read(&path).unwrap();
        let idx = HEADER_SIZE as usize + 9 + 3;
        bytes[idx] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let log = PageLog::open(&path, true).unwrap();
        assert!(matches!(log.recover(), Err(PageError::Corruption(_))));
    }

    #[test]
    fn test_bad_header_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.log");
        fs::write(&path, b"NOPE!").unwrap();

        assert!(matches!(
            PageLog::open(&path, true),
            Err(PageError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_failed_sync_rolls_back_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.log");

        let kept = page("2024-03-01", "kept");
        let before = {
            let log = PageLog::open(&path, true).unwrap();
            log.append(&kept).unwrap();
            let before = log.size();

            let result = log.append_with_sync(&page("2024-03-02", "lost"), |_| {
                Err(io::Error::new(ErrorKind::Other, "device gone"))
            });
            assert!(matches!(result, Err(PageError::Io(_))));
            assert_eq!(log.size(), before);
            assert_eq!(fs::metadata(&path).unwrap().len(), before);

            // A flush after the failure must not bring the entry back.
            log.sync().unwrap();
            before
        };

        let log = PageLog::open(&path, true).unwrap();
        let entries = log.recover().unwrap();
        assert_eq!(entries, vec![(HEADER_SIZE, kept.date)]);
        assert_eq!(log.append(&page("2024-03-03", "next")).unwrap(), before);
    }

    #[test]
    fn test_follow_picks_up_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.log");

        let writer = PageLog::open(&path, true).unwrap();
        let reader = PageLog::open_read_only(&path).unwrap();
        assert_eq!(reader.follow().unwrap(), LogTail::Appended(vec![]));

        let first = page("2024-03-01", "one");
        let off1 = writer.append(&first).unwrap();
        assert_eq!(
            reader.follow().unwrap(),
            LogTail::Appended(vec![(off1, first.date)])
        );
        assert_eq!(reader.read_at(off1).unwrap(), first);

        // Half an entry is left alone until the rest arrives.
        let second = page("2024-03-02", "two");
        let frame = PageLog::encode_entry(&second).unwrap();
        let off2 = writer.size();
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&frame[..frame.len() / 2]).unwrap();
        assert_eq!(reader.follow().unwrap(), LogTail::Appended(vec![]));
        assert_eq!(fs::metadata(&path).unwrap().len(), off2 + (frame.len() / 2) as u64);

        raw.write_all(&frame[frame.len() / 2..]).unwrap();
        assert_eq!(
            reader.follow().unwrap(),
            LogTail::Appended(vec![(off2, second.date)])
        );
    }

    #[test]
    fn test_follow_rescans_after_shrink() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.log");

        let writer = PageLog::open(&path, true).unwrap();
        let first = page("2024-03-01", "one");
        writer.append(&first).unwrap();
        let after_first = writer.size();
        writer.append(&page("2024-03-02", "two")).unwrap();

        let reader = PageLog::open_read_only(&path).unwrap();
        assert!(matches!(reader.follow().unwrap(), LogTail::Appended(e) if e.len() == 2));

        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(after_first)
            .unwrap();
        assert_eq!(
            reader.follow().unwrap(),
            LogTail::Rewritten(vec![(HEADER_SIZE, first.date)])
        );
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let log = PageLog::open(dir.path().join("pages.log"), true).unwrap();

        for i in 0..5 {
            log.append(&page("2024-03-01", &format!("draft {i}"))).unwrap();
        }
        let before = log.size();

        let last = page("2024-03-01", "draft 4");
        let offsets = log.rewrite(std::slice::from_ref(&last)).unwrap();

        assert_eq!(offsets.len(), 1);
        assert!(log.size() < before);
        assert_eq!(log.read_at(offsets[0].0).unwrap(), last);
        assert!(!dir.path().join("pages.log.compact").exists());

        let offset = log.append(&page("2024-03-02", "next")).unwrap();
        assert_eq!(offset, offsets[0].0 + (before - HEADER_SIZE) / 5);
    }
}
