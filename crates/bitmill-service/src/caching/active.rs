use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::EngineKey;
use crate::resource::{EngineResource, Resource, ResourceListener, WeakEngineResource};

struct ResourceWeakRef {
    weak: WeakEngineResource,
    /// Keeps the underlying resource of a cacheable entry alive, so it can be salvaged if all
    /// handles are dropped without being released.
    resource: Option<Arc<dyn Resource>>,
}

/// The resources that are currently in use by at least one consumer.
pub struct ActiveResources {
    entries: Mutex<HashMap<EngineKey, ResourceWeakRef>>,
    listener: Mutex<Option<Weak<dyn ResourceListener>>>,
}

impl ActiveResources {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EngineKey, ResourceWeakRef>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the listener that salvaged resources are released to.
    pub fn set_listener(&self, listener: Weak<dyn ResourceListener>) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn activate(&self, key: EngineKey, resource: &EngineResource) {
        let entry = ResourceWeakRef {
            weak: resource.downgrade(),
            resource: resource
                .is_memory_cacheable()
                .then(|| Arc::clone(resource.resource())),
        };
        self.lock().insert(key, entry);
    }

    pub fn deactivate(&self, key: &EngineKey) {
        self.lock().remove(key);
    }

    /// Returns the active resource for `key`, salvaging it if it was leaked.
    pub fn get(&self, key: &EngineKey) -> Option<EngineResource> {
        let dead = {
            let mut entries = self.lock();
            let entry = entries.get(key)?;
            if let Some(resource) = entry.weak.upgrade() {
                return Some(resource);
            }
            entries.remove(key)
        };

        if let Some(dead) = dead {
            self.salvage(key.clone(), dead);
        }
        None
    }

    /// Salvages all leaked entries.
    pub fn cleanup_released(&self) {
        let dead: Vec<_> = {
            let mut entries = self.lock();
            let keys: Vec<_> = entries
                .iter()
                .filter(|(_, entry)| entry.weak.upgrade().is_none())
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        for (key, entry) in dead {
            self.salvage(key, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn salvage(&self, key: EngineKey, entry: ResourceWeakRef) {
        let Some(resource) = entry.resource else {
            return;
        };
        let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };

        tracing::debug!(%key, "salvaging leaked resource");
        // The leaked handles may still be recycled by whoever holds the original resource, so
        // the salvaged one must never recycle it again.
        let resource = EngineResource::new(resource, key.clone(), true, false, listener.clone());
        if let Some(listener) = listener.upgrade() {
            listener.on_resource_released(&key, &resource);
        }
    }
}

impl Default for ActiveResources {
    fn default() -> Self {
        Self::new()
    }
}
