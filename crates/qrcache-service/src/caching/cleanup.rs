use std::fs::remove_file;
use std::io;

use anyhow::{Result, anyhow};

use crate::config::Config;

use super::disk::{CacheFile, DiskState, DiskStats, catch_not_found};
use super::{CleanupStats, DiskStore, IMAGES_CACHE};

/// Entry function for the cleanup command.
///
/// This opens the image cache configured in `config` and removes expired entries, followed by
/// the oldest entries until the cache fits its size budget.
/// If `dry_run` is `true`, no files will actually be deleted.
pub async fn cleanup(config: &Config, dry_run: bool) -> Result<CleanupStats> {
    let cache_dir = config.cache_dir.as_ref().ok_or_else(|| {
        anyhow!("no caching configured! Did you provide a path to your config file?")
    })?;

    let store = DiskStore::open_for_cleanup(IMAGES_CACHE, cache_dir, config.caches.disk);
    let stats = store.cleanup(dry_run).await?;
    Ok(stats)
}

impl DiskState {
    /// Runs the age sweep followed by the size sweep.
    pub(super) fn cleanup(&self, dry_run: bool) -> io::Result<CleanupStats> {
        tracing::info!("Cleaning up `{}` cache", self.name);

        let files = self.list_files()?;
        let (expired, retained) = self.sweep_expired(files, dry_run);
        let evicted = self.evict_oldest(retained, dry_run);

        let stats = CleanupStats {
            removed_files: expired.removed_files + evicted.removed_files,
            removed_bytes: expired.removed_bytes + evicted.removed_bytes,
            retained_files: evicted.retained_files,
            retained_bytes: evicted.retained_bytes,
        };

        tracing::info!("Cleaning up `{}` complete", self.name);
        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => self.name);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => self.name);

        Ok(stats)
    }

    /// Removes every file older than the configured maximum age, regardless of size pressure.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub(super) fn clean_old_files(&self, dry_run: bool) -> io::Result<CleanupStats> {
        let files = self.list_files()?;
        Ok(self.sweep_expired(files, dry_run).0)
    }

    /// Deletes the oldest files until the total size of the cache is within its budget.
    ///
    /// All files are treated alike, including the one that was written last.
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub(super) fn check_cache_size(&self, dry_run: bool) -> io::Result<CleanupStats> {
        let files = self.list_files()?;
        Ok(self.evict_oldest(files, dry_run))
    }

    /// Removes the expired ones among `files`, returning the files that were kept.
    fn sweep_expired(
        &self,
        files: Vec<CacheFile>,
        dry_run: bool,
    ) -> (CleanupStats, Vec<CacheFile>) {
        let mut stats = CleanupStats::default();
        let mut retained = Vec::with_capacity(files.len());

        for file in files {
            if !self.is_expired(file.mtime) {
                stats.retained_files += 1;
                stats.retained_bytes += file.size;
                retained.push(file);
            } else if self.remove_file(&file, dry_run) {
                stats.removed_files += 1;
                stats.removed_bytes += file.size;
            }
        }

        if stats.removed_files > 0 {
            tracing::info!(
                cache = self.name,
                "Removed {} expired files, totaling {} bytes",
                stats.removed_files,
                stats.removed_bytes
            );
            if !dry_run {
                DiskStats::record(&self.stats.expired, stats.removed_files as u64);
                metric!(counter("caches.file.expired") += stats.removed_files as i64, "cache" => self.name);
            }
        }

        (stats, retained)
    }

    /// Removes the oldest among `files` until their total size is within the budget.
    fn evict_oldest(&self, mut files: Vec<CacheFile>, dry_run: bool) -> CleanupStats {
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        let mut stats = CleanupStats::default();

        if total > self.config.max_size {
            tracing::debug!(
                cache = self.name,
                total,
                max_size = self.config.max_size,
                "Cache exceeds its size budget"
            );
            files.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.path.cmp(&b.path)));

            let mut remaining = Vec::with_capacity(files.len());
            let mut files = files.into_iter();
            for file in files.by_ref() {
                if total <= self.config.max_size {
                    remaining.push(file);
                    break;
                }
                if self.remove_file(&file, dry_run) {
                    total -= file.size;
                    stats.removed_files += 1;
                    stats.removed_bytes += file.size;
                } else {
                    remaining.push(file);
                }
            }
            remaining.extend(files);
            files_into_stats(&remaining, &mut stats);

            if !dry_run {
                DiskStats::record(&self.stats.evicted, stats.removed_files as u64);
                metric!(counter("caches.file.evicted") += stats.removed_files as i64, "cache" => self.name);
            }
        } else {
            files_into_stats(&files, &mut stats);
        }

        stats
    }

    /// Removes a single cache file, returning `true` if it is gone afterwards.
    fn remove_file(&self, file: &CacheFile, dry_run: bool) -> bool {
        tracing::debug!("Removing file `{}`", file.path.display());
        if dry_run {
            return true;
        }
        match catch_not_found(|| remove_file(&file.path)) {
            Ok(_) => true,
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", file.path.display().to_string().into()),
                    || tracing::error!("Failed to clean cache file: {:?}", e),
                );
                false
            }
        }
    }
}

fn files_into_stats(files: &[CacheFile], stats: &mut CleanupStats) {
    stats.retained_files = files.len();
    stats.retained_bytes = files.iter().map(|f| f.size).sum();
}
