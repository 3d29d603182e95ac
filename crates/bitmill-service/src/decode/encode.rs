use std::cell::RefCell;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use crate::caching::{CacheKey, DiskCache, Snapshot};
use crate::registry::{Data, DataRewinder, Encoder, ResourceEncoder};
use crate::resource::LockedResource;
use crate::types::Options;
use crate::utils::futures::CallOnDrop;

/// A decoded resource waiting to be written to the disk cache.
///
/// The resource stays locked until it was written, or until this is dropped.
pub(crate) struct DeferredEncode {
    key: CacheKey,
    encoder: Arc<dyn ResourceEncoder>,
    resource: Arc<LockedResource>,
    _unlock: CallOnDrop,
}

impl DeferredEncode {
    pub fn new(
        key: CacheKey,
        encoder: Arc<dyn ResourceEncoder>,
        resource: Arc<LockedResource>,
    ) -> Self {
        let unlock = {
            let resource = Arc::clone(&resource);
            CallOnDrop::new(move || resource.unlock())
        };
        Self {
            key,
            encoder,
            resource,
            _unlock: unlock,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Writes the resource and unlocks it, whether the write succeeded or not.
    pub fn encode(self, disk_cache: &dyn DiskCache, options: &Options) {
        let start = Instant::now();
        let writer = |file: &mut dyn Write| -> anyhow::Result<()> {
            self.encoder.encode(self.resource.inner(), file, options)
        };
        disk_cache.put(&self.key, &writer);
        tracing::trace!(key = %self.key, elapsed = ?start.elapsed(), "encoded resource");
        metric!(timer("decode.encode.duration") = start.elapsed());
    }
}

/// Writes fetched source data to the disk cache, and opens the written entry.
///
/// Returns `None` if the data could not be written.
pub(crate) fn cache_source_data(
    disk_cache: &dyn DiskCache,
    key: &CacheKey,
    encoder: &dyn Encoder,
    rewinder: &dyn DataRewinder,
    data: &mut Data,
    options: &Options,
) -> Option<Snapshot> {
    let start = Instant::now();
    let data = RefCell::new(data);
    let writer = |file: &mut dyn Write| -> anyhow::Result<()> {
        let mut data = data.borrow_mut();
        rewinder.rewind(&mut **data)?;
        encoder.encode(&mut **data, file, options)
    };
    disk_cache.put(key, &writer);
    tracing::trace!(%key, elapsed = ?start.elapsed(), "wrote source data");

    let snapshot = disk_cache.get(key);
    if snapshot.is_none() {
        tracing::warn!(%key, "failed to write source data to the disk cache");
    }
    snapshot
}
