//! Bounded, compressed, change-aware file cache
//!
//! The cache maps a [`PathFingerprint`] to a [`DataBlock`] together with the
//! bookkeeping needed to decide when the block is stale and which block to
//! evict under memory pressure.
//!
//! # Consistency
//!
//! A stored entry is trusted for `staleness_window` after it was stored or
//! last validated. Past that window the file is stat'ed and the entry is only
//! reused if the modification time still matches.
//!
//! # Locking
//!
//! One [`RwLock`] guards the entry map and the byte total. Lookups take the
//! shared side and bump access counters through atomics. Disk reads and
//! compression always happen with no lock held; a second critical section
//! stores the result. Two tasks filling the same path both succeed, and the
//! later store wins.
//!
//! # Eviction
//!
//! While a store does not fit, the entry with the smallest
//! `(access_count, last_access, insertion order)` is removed.

mod block;
mod fingerprint;
mod mode;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use parking_lot::RwLock;

pub use block::{compress_fast, decompress, DataBlock};
pub use fingerprint::{normalize_lexically, PathFingerprint};
pub use mode::{CacheMode, SMALL_FILE_LIMIT};

/// Total cache budget when nothing else is configured (1 MiB).
pub const DEFAULT_CACHE_SIZE: u64 = 1024 * 1024;
/// Per-entry budget when nothing else is configured (64 KiB).
pub const DEFAULT_MAX_ENTRY_SIZE: u64 = 64 * 1024;
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(1);
/// Entries up to this size are stored uncompressed (4 KiB).
pub const DEFAULT_COMPRESS_MIN_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("{size} bytes does not fit in the cache (limit {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("compression failed: {0}")]
    Compression(std::io::Error),
}

impl CacheError {
    fn from_io(path: &Path, err: std::io::Error) -> Self {
        if err.kind() == ErrorKind::NotFound {
            CacheError::NotFound(path.to_path_buf())
        } else {
            CacheError::Io(err)
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileCacheConfig {
    /// Upper bound on the sum of stored block sizes.
    pub max_bytes: u64,
    /// Upper bound on a single stored block, 0 for no limit.
    pub max_entry_size: u64,
    /// Gzip incoming data before storing it.
    pub compress: bool,
    /// Data of at most this many bytes is stored uncompressed even when
    /// `compress` is set.
    pub compress_min_size: usize,
    pub staleness_window: Duration,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_CACHE_SIZE,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            compress: true,
            compress_min_size: DEFAULT_COMPRESS_MIN_SIZE,
            staleness_window: DEFAULT_STALENESS_WINDOW,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    block: DataBlock,
    source_mtime: Option<SystemTime>,
    /// Insertion order, used as the final eviction tie breaker.
    seq: u64,
    // nanoseconds since the cache epoch
    stored_at: AtomicU64,
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl CacheEntry {
    fn touch(&self, now: u64) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access.store(now, Ordering::Relaxed);
    }

    fn eviction_key(&self) -> (u64, u64, u64) {
        (
            self.access_count.load(Ordering::Relaxed),
            self.last_access.load(Ordering::Relaxed),
            self.seq,
        )
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<PathFingerprint, CacheEntry>,
    total_bytes: u64,
    next_seq: u64,
}

impl CacheInner {
    fn remove(&mut self, fingerprint: &PathFingerprint) -> bool {
        match self.entries.remove(fingerprint) {
            Some(entry) => {
                self.total_bytes -= entry.block.stored_len() as u64;
                true
            }
            None => false,
        }
    }

    fn least_popular(&self) -> Option<PathFingerprint> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.eviction_key())
            .map(|(fingerprint, _)| fingerprint.clone())
    }
}

/// Result of the shared-lock lookup in [`FileCache::read`].
enum Lookup {
    Fresh(DataBlock),
    NeedsValidation(Option<SystemTime>),
    Missing,
}

#[derive(Debug)]
pub struct FileCache {
    config: FileCacheConfig,
    inner: RwLock<CacheInner>,
    epoch: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    full_warning_given: AtomicBool,
}

impl FileCache {
    pub fn new(config: FileCacheConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(CacheInner::default()),
            epoch: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            full_warning_given: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FileCacheConfig {
        &self.config
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn window_nanos(&self) -> u64 {
        self.config.staleness_window.as_nanos() as u64
    }

    /// Read a file, going through the cache when `allow_from_cache` is set.
    ///
    /// With `allow_from_cache == false` the file is always read from disk and
    /// the fresh block replaces whatever was cached for it.
    pub async fn read(
        &self,
        path: impl AsRef<Path>,
        allow_from_cache: bool,
    ) -> Result<DataBlock, CacheError> {
        let path = path.as_ref();
        let fingerprint = PathFingerprint::new(path);

        if !allow_from_cache {
            return self.fill(&fingerprint).await;
        }

        match self.lookup(&fingerprint) {
            Lookup::Fresh(block) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(block);
            }
            Lookup::NeedsValidation(cached_mtime) => {
                let metadata = match tokio::fs::metadata(fingerprint.as_path()).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        self.inner.write().remove(&fingerprint);
                        return Err(CacheError::from_io(path, e));
                    }
                };
                let disk_mtime = metadata.modified().ok();
                if disk_mtime.is_some() && disk_mtime == cached_mtime {
                    if let Some(block) = self.revalidate(&fingerprint, cached_mtime) {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(block);
                    }
                } else {
                    tracing::debug!(path = %fingerprint, "cached file changed on disk, reloading");
                }
            }
            Lookup::Missing => {}
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.fill(&fingerprint).await
    }

    /// Read a file from disk without looking at or touching the cache.
    pub async fn read_uncached(path: impl AsRef<Path>) -> Result<DataBlock, CacheError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| CacheError::from_io(path, e))?;
        if data.is_empty() {
            return Ok(DataBlock::empty());
        }
        Ok(DataBlock::new(data))
    }

    fn lookup(&self, fingerprint: &PathFingerprint) -> Lookup {
        let now = self.now();
        let inner = self.inner.read();
        let Some(entry) = inner.entries.get(fingerprint) else {
            return Lookup::Missing;
        };
        entry.touch(now);
        let stored_at = entry.stored_at.load(Ordering::Relaxed);
        if now.saturating_sub(stored_at) < self.window_nanos() {
            Lookup::Fresh(entry.block.clone())
        } else {
            Lookup::NeedsValidation(entry.source_mtime)
        }
    }

    /// Mark an entry as validated against disk. Returns `None` if it was
    /// replaced or evicted since the lookup.
    fn revalidate(
        &self,
        fingerprint: &PathFingerprint,
        expected_mtime: Option<SystemTime>,
    ) -> Option<DataBlock> {
        let now = self.now();
        let inner = self.inner.read();
        let entry = inner.entries.get(fingerprint)?;
        if entry.source_mtime != expected_mtime {
            return None;
        }
        entry.stored_at.store(now, Ordering::Relaxed);
        Some(entry.block.clone())
    }

    /// Read from disk, compress, and store. A stale entry never survives a
    /// failed fill.
    async fn fill(&self, fingerprint: &PathFingerprint) -> Result<DataBlock, CacheError> {
        let path = fingerprint.as_path();
        let loaded = async {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|e| CacheError::from_io(path, e))?;
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| CacheError::from_io(path, e))?;
            Ok::<_, CacheError>((data, metadata.modified().ok()))
        }
        .await;

        let result = match loaded {
            Ok((data, mtime)) => {
                tracing::debug!(path = %fingerprint, bytes = data.len(), "reading file into cache");
                self.store_block(fingerprint, Bytes::from(data), mtime)
            }
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.inner.write().remove(fingerprint);
        }
        result
    }

    /// Store `data` for `path`, replacing any previous entry.
    pub fn store(&self, path: impl AsRef<Path>, data: impl Into<Bytes>) -> Result<DataBlock, CacheError> {
        let fingerprint = PathFingerprint::new(path.as_ref());
        let mtime = std::fs::metadata(fingerprint.as_path())
            .and_then(|m| m.modified())
            .ok();
        self.store_block(&fingerprint, data.into(), mtime)
    }

    fn store_block(
        &self,
        fingerprint: &PathFingerprint,
        data: Bytes,
        source_mtime: Option<SystemTime>,
    ) -> Result<DataBlock, CacheError> {
        let compress = self.config.compress && data.len() > self.config.compress_min_size;
        let block = DataBlock::prepare(data, compress)?;
        let size = block.stored_len() as u64;

        if self.config.max_entry_size > 0 && size > self.config.max_entry_size {
            return Err(CacheError::TooLarge {
                size,
                limit: self.config.max_entry_size,
            });
        }
        if size > self.config.max_bytes {
            return Err(CacheError::TooLarge {
                size,
                limit: self.config.max_bytes,
            });
        }

        let now = self.now();
        let mut inner = self.inner.write();
        inner.remove(fingerprint);

        if inner.total_bytes + size > self.config.max_bytes
            && !self.full_warning_given.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                max_bytes = self.config.max_bytes,
                "file cache is full, evicting least used entries"
            );
        }
        while inner.total_bytes + size > self.config.max_bytes {
            let Some(victim) = inner.least_popular() else {
                break;
            };
            tracing::debug!(path = %victim, "evicting from cache");
            inner.remove(&victim);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.total_bytes += size;
        inner.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                block: block.clone(),
                source_mtime,
                seq,
                stored_at: AtomicU64::new(now),
                last_access: AtomicU64::new(now),
                access_count: AtomicU64::new(0),
            },
        );

        Ok(block)
    }

    /// Drop every entry and re-arm the cache-full warning.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.total_bytes = 0;
        self.full_warning_given.store(false, Ordering::Relaxed);
    }

    pub fn has_file(&self, path: impl AsRef<Path>) -> bool {
        let fingerprint = PathFingerprint::new(path);
        self.inner.read().entries.contains_key(&fingerprint)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Sum of stored block sizes.
    pub fn total_bytes(&self) -> u64 {
        self.inner.read().total_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Human-readable summary of the cache contents.
    pub fn stats(&self) -> String {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = String::from("Cache information:\n");
        let compression = if self.config.compress {
            "enabled"
        } else {
            "disabled"
        };
        let _ = writeln!(out, "\tCompression:\t{}", compression);
        let _ = writeln!(out, "\tTotal cache:\t{} bytes", self.config.max_bytes);
        let _ = writeln!(out, "\tUsed cache:\t{} bytes", inner.total_bytes);
        let _ = writeln!(
            out,
            "\tFree cache:\t{} bytes",
            self.config.max_bytes - inner.total_bytes
        );
        let _ = writeln!(out, "\tEntries:\t{}", entries.len());
        if !entries.is_empty() {
            out.push_str("\tData in cache:\n");
            for (fingerprint, entry) in entries {
                let _ = writeln!(
                    out,
                    "\t\tpath={}\tsize={}\tstored={}\taccesses={}",
                    fingerprint,
                    entry.block.len(),
                    entry.block.stored_len(),
                    entry.access_count.load(Ordering::Relaxed)
                );
            }
        }
        let _ = writeln!(out, "\tCache hits:\t{}", self.hits());
        let _ = writeln!(out, "\tCache misses:\t{}", self.misses());
        out
    }
}
