//! # Caching infrastructure
//!
//! Decoding images is expensive, so bitmill aggressively caches both the fetched source data and
//! the decoded, transformed results.
//!
//! ## Cache Layers
//!
//! A request for a resource goes through the following layers, in order:
//!
//! - [`ActiveResources`]: resources that are currently acquired by at least one consumer.
//!   Entries only hold weak references, so this layer never keeps anything alive by itself.
//! - The memory cache ([`LruResourceCache`]): resources nobody uses right now, bounded by their
//!   byte size. A hit *moves* the resource back into the active layer.
//! - The disk cache ([`DiskLruCache`]): a journaled LRU of files. It holds two kinds of
//!   entries, unmodified source data keyed by [`CacheKey::data`], and transformed results keyed
//!   by [`CacheKey::resource`]. Which of those are read and written is controlled per request by
//!   the [`DiskCacheStrategy`](crate::types::DiskCacheStrategy).
//! - On miss, the data is fetched from its source and decoded.
//!
//! Concurrent requests for the same [`EngineKey`] are coalesced into a single
//! [`EngineJob`](crate::engine::EngineJob) before any of the disk layers are consulted.
//!
//! ## Resource lifetime
//!
//! Whenever the acquire count of an [`EngineResource`](crate::resource::EngineResource) drops to
//! zero, the engine removes it from the active layer and either puts it into the memory cache or,
//! for non-cacheable resources, recycles it right away. Evictions from the memory cache are
//! recycled as well, which returns bitmaps to the
//! [`BitmapPool`](crate::resource::BitmapPool).
//!
//! ### Metrics
//!
//! - `engine.active.hit`, `engine.memory.hit`: Loads served by the in-memory layers.
//! - `disk_cache.access`: Disk cache lookups, tagged with whether they were a `hit`.
//! - `disk_cache.write`: Disk cache writes, tagged with the `status`.
//! - `disk_cache.size`: A gauge of the bytes stored in the disk cache.
//!
//! ### Configuration
//!
//! The disk cache is gated by the [`Config::cache_dir`](crate::config::Config::cache_dir) option.
//! Without it, a no-op [`DiskCacheAdapter`] is used and requests go straight to the source after
//! the in-memory layers. [`Config::caches`](crate::config::Config::caches) sizes all the layers.
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] identifies disk cache entries, and the [`EngineKey`] in-memory ones. Both
//! contain human-readable metadata which is SHA256-hashed. The metadata must be stable, or cache
//! entries would never be reused.

use std::io;

mod active;
mod cache_key;
pub mod disk;
mod memory;
#[cfg(test)]
mod tests;

pub use active::ActiveResources;
pub use cache_key::{CacheKey, CacheKeyBuilder, EngineKey};
pub use disk::{
    CacheFile, DiskCache, DiskCacheAdapter, DiskCacheProvider, DiskLruCache,
    DiskLruCacheWrapper, Snapshot, Writer,
};
pub use memory::{LruResourceCache, MemoryCache, ResourceRemovedListener, TrimLevel};

/// Turns a `NotFound` error into `None`.
pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
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
