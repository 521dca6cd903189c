use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{mpsc, oneshot};

use crate::config::DiskCacheConfig;

use super::CacheKey;

/// A unit of work executed on the store's worker.
type Job = Box<dyn FnOnce(&DiskState) + Send + 'static>;

/// Counters about the operations of a [`DiskStore`].
#[derive(Debug, Default)]
pub struct DiskStats {
    pub(super) reads: AtomicU64,
    pub(super) hits: AtomicU64,
    pub(super) writes: AtomicU64,
    pub(super) expired: AtomicU64,
    pub(super) evicted: AtomicU64,
}

impl DiskStats {
    /// Number of lookups that touched the file system.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of lookups that returned cached bytes.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of successfully persisted entries.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of files removed because they exceeded the maximum age.
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Number of files removed to bring the store back under its size budget.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub(super) fn record(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// A content-addressed image cache on the file system.
///
/// Every entry is a single file named after its [`CacheKey`], the file's `mtime` records when
/// it was stored. Entries older than [`DiskCacheConfig::max_age`] are treated as absent, and the
/// total size of the directory is kept below [`DiskCacheConfig::max_size`] by deleting the oldest
/// files first.
///
/// All operations of one store are executed one after the other by a background worker task,
/// each on the blocking thread pool. This totally orders writes, reads and the size sweeps.
/// Operations that were enqueued run to completion even if the future awaiting them is dropped.
/// The store has to be created within a `tokio` runtime.
#[derive(Debug, Clone)]
pub struct DiskStore {
    name: &'static str,
    cache_dir: PathBuf,
    jobs: mpsc::UnboundedSender<Job>,
    stats: Arc<DiskStats>,
}

impl DiskStore {
    /// Opens (and creates) the store in `<base_dir>/<name>`.
    ///
    /// Temporary files live in `<base_dir>/tmp/<name>`, which is emptied here as it can only
    /// contain leftovers of writes interrupted by a crash. A sweep of expired entries is
    /// scheduled as the very first operation of the store.
    pub fn open(name: &'static str, base_dir: &Path, config: DiskCacheConfig) -> io::Result<Self> {
        let store = Self::new(name, base_dir, config);

        fs::create_dir_all(&store.cache_dir)?;
        let tmp_dir = tmp_dir(name, base_dir);
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        store.enqueue(|state| {
            if let Err(e) = state.clean_old_files(false) {
                state.log_error(&e, "Failed to remove expired cache files");
            }
        });

        Ok(store)
    }

    /// Opens an existing store for maintenance, without touching the file system.
    ///
    /// Unlike [`DiskStore::open`], neither the temporary directory is reset nor expired entries
    /// are swept, which leaves [`DiskStore::cleanup`] in full control of what gets removed.
    pub fn open_for_cleanup(name: &'static str, base_dir: &Path, config: DiskCacheConfig) -> Self {
        Self::new(name, base_dir, config)
    }

    fn new(name: &'static str, base_dir: &Path, config: DiskCacheConfig) -> Self {
        let cache_dir = base_dir.join(name);
        let stats = Arc::new(DiskStats::default());
        let state = Arc::new(DiskState {
            name,
            cache_dir: cache_dir.clone(),
            tmp_dir: tmp_dir(name, base_dir),
            config,
            stats: Arc::clone(&stats),
        });

        let (jobs, queue) = mpsc::unbounded_channel();
        tokio::spawn(Self::worker(queue, state).bind_hub(Hub::new_from_top(Hub::current())));

        Self {
            name,
            cache_dir,
            jobs,
            stats,
        }
    }

    /// Long running task executing the queued jobs strictly in order.
    async fn worker(mut queue: mpsc::UnboundedReceiver<Job>, state: Arc<DiskState>) {
        while let Some(job) = queue.recv().await {
            let state = Arc::clone(&state);
            let name = state.name;
            if let Err(e) = tokio::task::spawn_blocking(move || job(&state)).await {
                tracing::error!(
                    cache = name,
                    error = &e as &dyn std::error::Error,
                    "Disk cache operation failed"
                );
            }
        }
        tracing::trace!(cache = state.name, "Disk cache worker shut down");
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn stats(&self) -> &DiskStats {
        &self.stats
    }

    /// Returns the path of the file backing `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.file_name())
    }

    /// Schedules `f` on the worker without waiting for it.
    fn enqueue<F>(&self, f: F)
    where
        F: FnOnce(&DiskState) + Send + 'static,
    {
        if self.jobs.send(Box::new(f)).is_err() {
            tracing::error!(cache = self.name, "Disk cache worker is gone");
        }
    }

    /// Runs `f` on the worker after all previously scheduled operations.
    ///
    /// Returns `None` if the worker is unavailable.
    async fn run<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&DiskState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(move |state| {
            // The caller might have lost interest in the result.
            let _ = tx.send(f(state));
        });
        rx.await.ok()
    }

    /// Loads the bytes stored for `key`.
    ///
    /// An entry older than the maximum age is deleted and reported as a miss. Any I/O error is
    /// logged and reported as a miss as well.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let key = key.clone();
        self.run(move |state| match state.read(&key) {
            Ok(bytes) => bytes,
            Err(e) => {
                state.log_error(&e, "Failed to read cache file");
                None
            }
        })
        .await
        .flatten()
    }

    /// Atomically stores `data` for `key`, replacing any previous entry.
    ///
    /// A size sweep is scheduled right after the write, this only waits for the write itself.
    /// Failures are logged, the entry is then simply not cached.
    pub async fn put(&self, key: &CacheKey, data: Bytes) {
        let _ = self.schedule_write(key, data).await;
    }

    /// Schedules a write of `data` for `key` without waiting for it to finish.
    ///
    /// The write is still performed if the caller goes away.
    pub fn store(&self, key: &CacheKey, data: Bytes) {
        drop(self.schedule_write(key, data));
    }

    fn schedule_write(&self, key: &CacheKey, data: Bytes) -> oneshot::Receiver<()> {
        let key = key.clone();
        let (tx, rx) = oneshot::channel();
        self.enqueue(move |state| {
            if let Err(e) = state.write(&key, &data) {
                state.log_error(&e, "Failed to persist cache file");
            }
            let _ = tx.send(());
        });
        self.enqueue(|state| {
            if let Err(e) = state.check_cache_size(false) {
                state.log_error(&e, "Failed to enforce cache size");
            }
        });
        rx
    }

    /// Removes the entry for `key`, if any.
    pub async fn remove(&self, key: &CacheKey) {
        let key = key.clone();
        self.run(move |state| {
            if let Err(e) = state.remove(&key) {
                state.log_error(&e, "Failed to remove cache file");
            }
        })
        .await;
    }

    /// Removes all entries.
    pub async fn clear(&self) {
        self.run(|state| {
            if let Err(e) = state.clear() {
                state.log_error(&e, "Failed to clear cache directory");
            }
        })
        .await;
    }

    /// Waits until all previously scheduled operations have finished.
    pub async fn sync(&self) {
        self.run(|_| ()).await;
    }

    /// Runs both the age and the size sweep, returning what was (or would be) removed.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub async fn cleanup(&self, dry_run: bool) -> io::Result<CleanupStats> {
        self.run(move |state| state.cleanup(dry_run))
            .await
            .unwrap_or_else(|| Err(io::Error::other("disk cache worker is gone")))
    }
}

/// Summary of a cleanup run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// A file in the cache directory, with the metadata gathered while listing it.
#[derive(Debug)]
pub(super) struct CacheFile {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: SystemTime,
}

/// The state shared by the jobs of a [`DiskStore`].
#[derive(Debug)]
pub(super) struct DiskState {
    pub name: &'static str,
    pub cache_dir: PathBuf,
    tmp_dir: PathBuf,
    pub config: DiskCacheConfig,
    pub stats: Arc<DiskStats>,
}

impl DiskState {
    pub fn log_error(&self, error: &io::Error, message: &str) {
        sentry::with_scope(
            |scope| scope.set_extra("cache_dir", self.cache_dir.display().to_string().into()),
            || {
                tracing::error!(
                    cache = self.name,
                    error = error as &dyn std::error::Error,
                    "{message}"
                )
            },
        );
    }

    /// Whether an entry last written at `mtime` is past the maximum age.
    pub fn is_expired(&self, mtime: SystemTime) -> bool {
        let max_age = self.config.max_age.unwrap_or(Duration::MAX);
        // mtimes in the future count as fresh
        mtime.elapsed().unwrap_or_default() > max_age
    }

    fn read(&self, key: &CacheKey) -> io::Result<Option<Bytes>> {
        let path = self.cache_dir.join(key.file_name());
        DiskStats::record(&self.stats.reads, 1);

        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            tracing::trace!(cache = self.name, key = %key, "Cache file miss");
            return Ok(None);
        };

        if self.is_expired(metadata.modified()?) {
            tracing::debug!(cache = self.name, key = %key, "Removing expired cache file");
            catch_not_found(|| fs::remove_file(&path))?;
            DiskStats::record(&self.stats.expired, 1);
            metric!(counter("caches.file.expired") += 1, "cache" => self.name);
            return Ok(None);
        }

        let Some(data) = catch_not_found(|| fs::read(&path))? else {
            return Ok(None);
        };
        DiskStats::record(&self.stats.hits, 1);
        metric!(time_raw("caches.file.size") = data.len() as u64, "hit" => "true", "cache" => self.name);

        Ok(Some(Bytes::from(data)))
    }

    fn write(&self, key: &CacheKey, data: &[u8]) -> io::Result<()> {
        let path = self.cache_dir.join(key.file_name());

        // A concurrent `cleanup` process could have removed the directories we are operating in.
        fs::create_dir_all(&self.tmp_dir)?;
        fs::create_dir_all(&self.cache_dir)?;

        let mut temp_file = tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.tmp_dir)?;
        temp_file.write_all(data)?;
        temp_file.flush()?;
        temp_file.persist(&path).map_err(|e| e.error)?;

        tracing::trace!(cache = self.name, key = %key, path = %path.display(), "Created cache file");
        DiskStats::record(&self.stats.writes, 1);
        metric!(counter("caches.file.write") += 1, "cache" => self.name);
        metric!(time_raw("caches.file.size") = data.len() as u64, "hit" => "false", "cache" => self.name);

        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> io::Result<()> {
        let path = self.cache_dir.join(key.file_name());
        catch_not_found(|| fs::remove_file(path))?;
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        for file in self.list_files()? {
            catch_not_found(|| fs::remove_file(&file.path))?;
        }
        tracing::debug!(cache = self.name, "Cleared disk cache");
        Ok(())
    }

    /// Lists all files in the cache directory together with their size and `mtime`.
    ///
    /// Files that vanish while listing are skipped.
    pub fn list_files(&self) -> io::Result<Vec<CacheFile>> {
        let Some(entries) = catch_not_found(|| fs::read_dir(&self.cache_dir))? else {
            tracing::warn!("Directory not found: `{}`", self.cache_dir.display());
            return Ok(Vec::new());
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(metadata) = catch_not_found(|| entry.metadata())? else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(CacheFile {
                path: entry.path(),
                size: metadata.len(),
                mtime: metadata.modified()?,
            });
        }
        Ok(files)
    }
}

fn tmp_dir(name: &str, base_dir: &Path) -> PathBuf {
    base_dir.join("tmp").join(name)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
