//! The disk cache layer.
//!
//! [`DiskLruCache`] is the storage engine. The rest of the crate goes through the [`DiskCache`]
//! trait, which is implemented by [`DiskLruCacheWrapper`], or by the no-op [`DiskCacheAdapter`]
//! when no cache directory is configured.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use bytes::Bytes;

use super::CacheKey;
use crate::config::Config;

mod journal;
mod write_locker;

pub use journal::{DiskLruCache, Editor};
use write_locker::DiskCacheWriteLocker;

/// An open cache file.
///
/// The handle stays valid even if the entry is evicted or replaced in the meantime.
#[derive(Clone)]
pub struct CacheFile {
    path: PathBuf,
    handle: Arc<Mutex<File>>,
    len: u64,
}

impl CacheFile {
    /// Opens a file outside of any cache.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            handle: Arc::new(Mutex::new(file)),
            len,
        })
    }

    /// The path the file was opened from. It might not exist anymore.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the whole file.
    pub fn read_bytes(&self) -> io::Result<Bytes> {
        let mut file = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(self.len as usize);
        (&mut *file).take(self.len).read_to_end(&mut buf)?;
        if (buf.len() as u64) < self.len {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(buf.into())
    }
}

impl fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

/// A readable entry of a [`DiskLruCache`].
#[derive(Clone, Debug)]
pub struct Snapshot {
    key: String,
    file: CacheFile,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> u64 {
        self.file.len
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_empty()
    }

    pub fn read_bytes(&self) -> io::Result<Bytes> {
        self.file.read_bytes()
    }

    pub fn file(&self) -> &CacheFile {
        &self.file
    }

    pub fn into_file(self) -> CacheFile {
        self.file
    }
}

/// Writes the value of a new disk cache entry.
pub trait Writer {
    fn write(&self, file: &mut dyn Write) -> anyhow::Result<()>;
}

impl<F> Writer for F
where
    F: Fn(&mut dyn Write) -> anyhow::Result<()>,
{
    fn write(&self, file: &mut dyn Write) -> anyhow::Result<()> {
        self(file)
    }
}

/// The interface of the disk cache used by the decode pipeline.
///
/// Failures are logged and otherwise behave like misses.
pub trait DiskCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Snapshot>;

    /// Writes a new entry, unless one exists already.
    fn put(&self, key: &CacheKey, writer: &dyn Writer);

    fn delete(&self, key: &CacheKey);

    fn clear(&self);
}

/// A disk cache that never stores anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskCacheAdapter;

impl DiskCache for DiskCacheAdapter {
    fn get(&self, _key: &CacheKey) -> Option<Snapshot> {
        None
    }

    fn put(&self, _key: &CacheKey, _writer: &dyn Writer) {}

    fn delete(&self, _key: &CacheKey) {}

    fn clear(&self) {}
}

/// A [`DiskCache`] backed by a lazily opened [`DiskLruCache`].
pub struct DiskLruCacheWrapper {
    directory: PathBuf,
    app_version: u32,
    max_size: u64,
    cache: Mutex<Option<Arc<DiskLruCache>>>,
    write_locker: DiskCacheWriteLocker,
}

impl DiskLruCacheWrapper {
    pub fn new(directory: impl Into<PathBuf>, app_version: u32, max_size: u64) -> Self {
        Self {
            directory: directory.into(),
            app_version,
            max_size,
            cache: Mutex::new(None),
            write_locker: DiskCacheWriteLocker::default(),
        }
    }

    fn disk_cache(&self) -> io::Result<Arc<DiskLruCache>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cache) = &*cache {
            return Ok(Arc::clone(cache));
        }
        let opened = Arc::new(DiskLruCache::open(
            &self.directory,
            self.app_version,
            self.max_size,
        )?);
        *cache = Some(Arc::clone(&opened));
        Ok(opened)
    }

    fn reset(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn log_open_error(&self, error: &io::Error) {
        tracing::warn!(
            directory = %self.directory.display(),
            error = error as &dyn std::error::Error,
            "unable to open disk cache"
        );
    }

    /// The number of bytes stored, `0` if the cache cannot be opened.
    pub fn size(&self) -> u64 {
        self.disk_cache().map_or(0, |cache| cache.size())
    }

    fn put_inner(&self, cache: &DiskLruCache, safe_key: &str, writer: &dyn Writer) -> io::Result<bool> {
        // Someone else wrote the same data in the meantime.
        if cache.get(safe_key)?.is_some() {
            return Ok(false);
        }

        let Some(mut editor) = cache.edit(safe_key)? else {
            return Err(io::Error::other("had two simultaneous puts"));
        };
        match writer.write(editor.file()?) {
            Ok(()) => {
                editor.commit()?;
                Ok(true)
            }
            Err(error) => {
                tracing::debug!(
                    key = safe_key,
                    error = &*error as &dyn std::error::Error,
                    "disk cache writer failed"
                );
                editor.abort()?;
                Ok(false)
            }
        }
    }
}

impl DiskCache for DiskLruCacheWrapper {
    fn get(&self, key: &CacheKey) -> Option<Snapshot> {
        let cache = match self.disk_cache() {
            Ok(cache) => cache,
            Err(error) => {
                self.log_open_error(&error);
                return None;
            }
        };

        match cache.get(&key.safe_key()) {
            Ok(snapshot) => {
                let hit = if snapshot.is_some() { "true" } else { "false" };
                metric!(counter("disk_cache.access") += 1, "hit" => hit);
                tracing::trace!(%key, hit, "disk cache lookup");
                snapshot
            }
            Err(error) => {
                tracing::warn!(
                    %key,
                    error = &error as &dyn std::error::Error,
                    "unable to get from disk cache"
                );
                None
            }
        }
    }

    fn put(&self, key: &CacheKey, writer: &dyn Writer) {
        let safe_key = key.safe_key();
        let _guard = self.write_locker.acquire(&safe_key);

        let cache = match self.disk_cache() {
            Ok(cache) => cache,
            Err(error) => {
                self.log_open_error(&error);
                return;
            }
        };

        let status = match self.put_inner(&cache, &safe_key, writer) {
            Ok(true) => "written",
            Ok(false) => "skipped",
            Err(error) => {
                tracing::warn!(
                    %key,
                    error = &error as &dyn std::error::Error,
                    "unable to put to disk cache"
                );
                "failed"
            }
        };
        metric!(counter("disk_cache.write") += 1, "status" => status);
        metric!(gauge("disk_cache.size") = cache.size());
    }

    fn delete(&self, key: &CacheKey) {
        let Ok(cache) = self.disk_cache() else {
            return;
        };
        if let Err(error) = cache.remove(&key.safe_key()) {
            tracing::warn!(
                %key,
                error = &error as &dyn std::error::Error,
                "unable to delete from disk cache"
            );
        }
    }

    fn clear(&self) {
        match self.disk_cache() {
            Ok(cache) => {
                if let Err(error) = cache.delete() {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "unable to clear disk cache"
                    );
                }
            }
            Err(error) => self.log_open_error(&error),
        }
        self.reset();
    }
}

type DiskCacheFactory = Box<dyn Fn() -> Arc<dyn DiskCache> + Send + Sync>;

/// Creates the configured [`DiskCache`] on first use.
pub struct DiskCacheProvider {
    factory: DiskCacheFactory,
    cache: OnceLock<Arc<dyn DiskCache>>,
}

impl DiskCacheProvider {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn DiskCache> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            cache: OnceLock::new(),
        }
    }

    /// A [`DiskLruCacheWrapper`] in the configured `cache_dir`, or a [`DiskCacheAdapter`].
    pub fn from_config(config: &Config) -> Self {
        let disk = config.caches.disk;
        match config.cache_dir.clone() {
            Some(directory) => Self::new(move || {
                Arc::new(DiskLruCacheWrapper::new(
                    directory.clone(),
                    disk.app_version,
                    disk.max_size,
                ))
            }),
            None => Self::new(|| Arc::new(DiskCacheAdapter)),
        }
    }

    pub fn disk_cache(&self) -> Arc<dyn DiskCache> {
        Arc::clone(self.cache.get_or_init(|| (self.factory)()))
    }

    /// Clears the disk cache, without creating it first.
    pub fn clear_disk_cache_if_created(&self) {
        if let Some(cache) = self.cache.get() {
            cache.clear();
        }
    }
}

impl fmt::Debug for DiskCacheProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCacheProvider")
            .field("created", &self.cache.get().is_some())
            .finish()
    }
}
