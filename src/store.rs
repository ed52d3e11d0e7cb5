//! Main Store struct tying the page log, index and cache together.

use crate::error::{PageError, Result};
use crate::pages::{LogTail, PageIndex, PageLog};
use crate::types::{DailyPage, PageDate, StoreStats};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable overriding the store directory.
pub const PATH_ENV_VAR: &str = "GROWTH_BOOK_PATH";

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Page cache size (number of pages).
    pub page_cache_size: usize,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync the log after every `put`.
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./growth-book"),
            page_cache_size: 256,
            create_if_missing: true,
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    /// Defaults, with the path taken from `GROWTH_BOOK_PATH` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(PATH_ENV_VAR).filter(|p| !p.is_empty()) {
            config.path = PathBuf::from(path);
        }
        config
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"GBK\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// File name of the page log inside the store directory.
const LOG_FILE: &str = "pages.log";

/// The date-keyed page store.
///
/// Holds at most one page per date. `put` is an upsert: writing a page for
/// a date that already has one replaces it whole.
///
/// One process writes at a time. Any number of read-only handles
/// ([`Store::open_read_only`]) may follow the writer and see each page as
/// soon as its `put` returns.
pub struct Store {
    /// Store configuration.
    config: StoreConfig,

    /// Exclusive `LOCK` for a writer, shared `READERS` for a reader.
    _lock_file: File,

    /// Opened with [`Store::open_read_only`].
    read_only: bool,

    /// Append-only page log.
    log: PageLog,

    /// Date -> live log offset.
    index: PageIndex,

    /// Recently read or written pages.
    cache: Mutex<LruCache<PageDate, DailyPage>>,

    /// Serializes writers so index and log stay in step.
    write_lock: Mutex<()>,

    /// Held exclusively while compaction moves entries around.
    layout_lock: RwLock<()>,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if Self::manifest_path(&config.path).exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(PageError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        if Self::manifest_path(&config.path).exists() {
            return Err(PageError::InvalidOperation(format!(
                "store already exists at {}",
                config.path.display()
            )));
        }

        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        // The log header goes down before the manifest, so a reader that
        // finds the manifest always finds a readable log.
        let log = PageLog::open(config.path.join(LOG_FILE), config.sync_writes)?;
        Self::write_manifest(&config.path)?;

        let cache = Self::new_cache(config.page_cache_size);

        info!(path = %config.path.display(), "created page store");

        Ok(Self {
            config,
            _lock_file: lock_file,
            read_only: false,
            log,
            index: PageIndex::new(),
            cache,
            write_lock: Mutex::new(()),
            layout_lock: RwLock::new(()),
        })
    }

    /// Open an existing store.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if !Self::manifest_path(&config.path).exists() {
            return Err(PageError::NotInitialized);
        }
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;

        let log = PageLog::open(config.path.join(LOG_FILE), config.sync_writes)?;
        let index = PageIndex::from_entries(log.recover()?);
        let cache = Self::new_cache(config.page_cache_size);

        info!(
            path = %config.path.display(),
            pages = index.len(),
            entries = index.total_entries(),
            "opened page store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            read_only: false,
            log,
            index,
            cache,
            write_lock: Mutex::new(()),
            layout_lock: RwLock::new(()),
        })
    }

    /// Open an existing store for reading while a writer may have it open.
    ///
    /// Does not take the writer's lock. Every `get` first picks up pages
    /// saved since the last call; `put` and `compact` fail with
    /// `InvalidOperation`. While any reader is open the writer cannot
    /// compact, and a reader cannot open during a compaction (`Locked`).
    pub fn open_read_only(config: StoreConfig) -> Result<Self> {
        if !Self::manifest_path(&config.path).exists() {
            return Err(PageError::NotInitialized);
        }
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_reader_lock(&config.path)?;

        let log = PageLog::open_read_only(config.path.join(LOG_FILE))?;
        let cache = Self::new_cache(config.page_cache_size);

        let store = Self {
            config,
            _lock_file: lock_file,
            read_only: true,
            log,
            index: PageIndex::new(),
            cache,
            write_lock: Mutex::new(()),
            layout_lock: RwLock::new(()),
        };
        store.refresh()?;

        info!(
            path = %store.config.path.display(),
            pages = store.index.len(),
            "opened page store read-only"
        );
        Ok(store)
    }

    // --- Page Operations ---

    /// Get the page saved for `date`, or `None` if it was never saved.
    pub fn get(&self, date: &PageDate) -> Result<Option<DailyPage>> {
        if self.read_only {
            self.refresh()?;
        }

        if let Some(page) = self.cache.lock().get(date).cloned() {
            return Ok(Some(page));
        }

        let _layout = self.layout_lock.read();

        let Some(offset) = self.index.get(date) else {
            debug!(%date, "page not found");
            return Ok(None);
        };

        let page = self.log.read_at(offset)?;
        if page.date != *date {
            return Err(PageError::Corruption(format!(
                "entry at offset {offset} holds {} instead of {date}",
                page.date
            )));
        }

        // A put may have landed since the index lookup; only cache what is
        // still current.
        let mut cache = self.cache.lock();
        if self.index.get(date) == Some(offset) {
            cache.put(*date, page.clone());
        }
        Ok(Some(page))
    }

    /// Like [`Store::get`], for a date given as text.
    ///
    /// Malformed dates fail before storage is touched.
    pub fn get_str(&self, date: &str) -> Result<Option<DailyPage>> {
        let date = PageDate::parse(date)?;
        self.get(&date)
    }

    /// Insert or replace the page for `page.date`.
    ///
    /// Returns once the entry is on disk (fsync'd when `sync_writes` is on).
    pub fn put(&self, page: &DailyPage) -> Result<()> {
        self.ensure_writable("put")?;
        page.validate()?;

        let _lock = self.write_lock.lock();
        let _layout = self.layout_lock.read();

        let offset = self.log.append(page)?;
        let replaced = {
            let mut cache = self.cache.lock();
            let replaced = self.index.insert(page.date, offset);
            cache.put(page.date, page.clone());
            replaced
        };

        debug!(date = %page.date, offset, replaced = replaced.is_some(), "saved page");
        Ok(())
    }

    /// Pick up pages another process saved since the last call.
    ///
    /// Only a read-only handle can fall behind; a writer returns 0. Returns
    /// the number of log entries read. `contains`, `dates` and `len` answer
    /// from the state of the last refresh.
    pub fn refresh(&self) -> Result<usize> {
        if !self.read_only {
            return Ok(0);
        }

        let _lock = self.write_lock.lock();
        let _layout = self.layout_lock.write();

        let read = match self.log.follow()? {
            LogTail::Appended(entries) => {
                let mut cache = self.cache.lock();
                for (offset, date) in &entries {
                    self.index.insert(*date, *offset);
                    cache.pop(date);
                }
                entries.len()
            }
            LogTail::Rewritten(entries) => {
                let read = entries.len();
                self.cache.lock().clear();
                self.index.reset(entries);
                read
            }
        };

        if read > 0 {
            debug!(entries = read, pages = self.index.len(), "refreshed page store");
        }
        Ok(read)
    }

    /// Whether this handle was opened with [`Store::open_read_only`].
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether a page has been saved for `date`.
    pub fn contains(&self, date: &PageDate) -> bool {
        self.index.contains(date)
    }

    /// All saved dates, oldest first.
    pub fn dates(&self) -> Vec<PageDate> {
        self.index.dates()
    }

    /// Number of saved dates.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    // --- Maintenance ---

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            page_count: self.index.len() as u64,
            entry_count: self.index.total_entries(),
            superseded_count: self.index.superseded(),
            log_size_bytes: self.log.size(),
        }
    }

    /// Drop overwritten entries from the log.
    ///
    /// Returns the number of entries removed.
    /// Fails with `Locked` while a read-only handle has the store open.
    pub fn compact(&self) -> Result<u64> {
        self.ensure_writable("compact")?;

        let _lock = self.write_lock.lock();
        let _layout = self.layout_lock.write();

        let removed = self.index.superseded();
        if removed == 0 {
            return Ok(0);
        }

        // Readers hold the old log open; renaming over it would strand them.
        let _readers = Self::exclude_readers(&self.config.path)?;

        let before = self.log.size();
        let pages = self
            .index
            .live_entries()
            .into_iter()
            .map(|(_, offset)| self.log.read_at(offset))
            .collect::<Result<Vec<_>>>()?;

        let offsets = self.log.rewrite(&pages)?;
        self.index.reset(offsets);

        info!(
            removed,
            pages = pages.len(),
            bytes_before = before,
            bytes_after = self.log.size(),
            "compacted page log"
        );
        Ok(removed)
    }

    /// Force all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.log.sync()
    }

    /// Directory holding the store files.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- Internal ---

    fn ensure_writable(&self, op: &str) -> Result<()> {
        if self.read_only {
            return Err(PageError::InvalidOperation(format!(
                "cannot {op}: store at {} is open read-only",
                self.config.path.display()
            )));
        }
        Ok(())
    }

    fn new_cache(size: usize) -> Mutex<LruCache<PageDate, DailyPage>> {
        let size = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN);
        Mutex::new(LruCache::new(size))
    }

    fn manifest_path(path: &Path) -> PathBuf {
        path.join("MANIFEST")
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(Self::manifest_path(path))?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(Self::manifest_path(path))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| PageError::InvalidFormat("Truncated store manifest".into()))?;
        if &magic != STORE_MAGIC {
            return Err(PageError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)
            .map_err(|_| PageError::InvalidFormat("Truncated store manifest".into()))?;
        if version[0] != STORE_VERSION {
            return Err(PageError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| PageError::Locked)?;

        Ok(lock_file)
    }

    fn readers_file(path: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join("READERS"))?;
        Ok(file)
    }

    fn acquire_reader_lock(path: &Path) -> Result<File> {
        let file = Self::readers_file(path)?;
        file.try_lock_shared().map_err(|_| PageError::Locked)?;
        Ok(file)
    }

    fn exclude_readers(path: &Path) -> Result<File> {
        let file = Self::readers_file(path)?;
        file.try_lock_exclusive().map_err(|_| PageError::Locked)?;
        Ok(file)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
