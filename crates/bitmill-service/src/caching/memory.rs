use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use lru::LruCache;

use super::EngineKey;
use crate::resource::EngineResource;

/// How much memory the caches should give up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrimLevel {
    /// The process is running, but memory is critically low.
    RunningCritical,
    /// The UI of the process is no longer visible.
    UiHidden,
    /// The process went to the background.
    Background,
    /// The process is about to be killed.
    Complete,
}

/// Receives resources evicted from a [`MemoryCache`].
pub trait ResourceRemovedListener: Send + Sync {
    fn on_resource_removed(&self, resource: EngineResource);
}

/// An in-memory cache of resources that are not currently in use.
pub trait MemoryCache: Send + Sync {
    /// The summed size of all cached resources.
    fn current_size(&self) -> u64;

    /// The current budget.
    fn max_size(&self) -> u64;

    /// Rescales the budget relative to the initial maximum size, evicting if needed.
    fn set_size_multiplier(&self, multiplier: f32);

    /// Removes and returns the resource for `key`.
    ///
    /// There is intentionally no `get`: a hit hands the resource over to the caller.
    fn remove(&self, key: &EngineKey) -> Option<EngineResource>;

    /// Inserts `resource`, evicting least recently used entries to stay within the budget.
    fn put(&self, key: EngineKey, resource: EngineResource);

    fn set_resource_removed_listener(&self, listener: Weak<dyn ResourceRemovedListener>);

    fn clear_memory(&self);

    fn trim_memory(&self, level: TrimLevel);
}

struct State {
    entries: LruCache<EngineKey, EngineResource>,
    current_size: u64,
    max_size: u64,
}

impl State {
    fn trim_to_size(&mut self, size: u64, evicted: &mut Vec<EngineResource>) {
        while self.current_size > size {
            let Some((_, resource)) = self.entries.pop_lru() else {
                break;
            };
            self.current_size -= resource.size();
            evicted.push(resource);
        }
    }
}

/// A byte bounded LRU cache of [`EngineResource`]s.
pub struct LruResourceCache {
    initial_max_size: u64,
    state: Mutex<State>,
    listener: Mutex<Option<Weak<dyn ResourceRemovedListener>>>,
}

impl LruResourceCache {
    pub fn new(max_size: u64) -> Self {
        Self {
            initial_max_size: max_size,
            state: Mutex::new(State {
                entries: LruCache::unbounded(),
                current_size: 0,
                max_size,
            }),
            listener: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &EngineKey) -> bool {
        self.lock().entries.contains(key)
    }

    /// Hands evicted resources to the listener, outside of the cache lock.
    fn notify_removed(&self, evicted: Vec<EngineResource>) {
        if evicted.is_empty() {
            return;
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        for resource in evicted {
            tracing::trace!(key = %resource.key(), size = resource.size(), "evicted from memory cache");
            if let Some(listener) = &listener {
                listener.on_resource_removed(resource);
            }
        }
    }

    fn trim_to_size(&self, size: u64) {
        let mut evicted = Vec::new();
        self.lock().trim_to_size(size, &mut evicted);
        self.notify_removed(evicted);
    }
}

impl MemoryCache for LruResourceCache {
    fn current_size(&self) -> u64 {
        self.lock().current_size
    }

    fn max_size(&self) -> u64 {
        self.lock().max_size
    }

    fn set_size_multiplier(&self, multiplier: f32) {
        let mut evicted = Vec::new();
        {
            let mut state = self.lock();
            state.max_size = (self.initial_max_size as f64 * multiplier.max(0.0) as f64) as u64;
            let max_size = state.max_size;
            state.trim_to_size(max_size, &mut evicted);
        }
        self.notify_removed(evicted);
    }

    fn remove(&self, key: &EngineKey) -> Option<EngineResource> {
        let mut state = self.lock();
        let resource = state.entries.pop(key)?;
        state.current_size -= resource.size();
        Some(resource)
    }

    fn put(&self, key: EngineKey, resource: EngineResource) {
        let mut evicted = Vec::new();
        {
            let mut state = self.lock();
            let size = resource.size();
            if size > state.max_size {
                evicted.push(resource);
            } else {
                state.current_size += size;
                if let Some(old) = state.entries.put(key, resource.clone()) {
                    state.current_size -= old.size();
                    if !old.ptr_eq(&resource) {
                        evicted.push(old);
                    }
                }
                let max_size = state.max_size;
                state.trim_to_size(max_size, &mut evicted);
            }
        }
        self.notify_removed(evicted);
    }

    fn set_resource_removed_listener(&self, listener: Weak<dyn ResourceRemovedListener>) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn clear_memory(&self) {
        self.trim_to_size(0);
    }

    fn trim_memory(&self, level: TrimLevel) {
        match level {
            TrimLevel::Background | TrimLevel::Complete => self.clear_memory(),
            TrimLevel::UiHidden | TrimLevel::RunningCritical => {
                let half = self.max_size() / 2;
                self.trim_to_size(half);
            }
        }
    }
}
