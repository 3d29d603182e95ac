use anyhow::{Result, bail};
use bitmill_service::caching::{DiskCache, DiskLruCacheWrapper};
use bitmill_service::config::Config;

/// Reports the disk cache size and clears it, unless `dry_run` is set.
///
/// Returns the number of bytes that were stored.
pub fn run(config: &Config, dry_run: bool) -> Result<u64> {
    let Some(ref directory) = config.cache_dir else {
        bail!("no cache_dir configured");
    };

    let disk = config.caches.disk;
    let cache = DiskLruCacheWrapper::new(directory, disk.app_version, disk.max_size);
    let size = cache.size();
    tracing::info!(
        directory = %directory.display(),
        size,
        max_size = disk.max_size,
        "disk cache"
    );

    if dry_run {
        tracing::info!("dry run, keeping all entries");
    } else {
        cache.clear();
        tracing::info!("cleared disk cache");
    }
    Ok(size)
}
