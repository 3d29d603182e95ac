//! Decoded resources and their reference counted lifetime.
//!
//! Every resource handed out by the [`Engine`](crate::engine::Engine) is wrapped in an
//! [`EngineResource`]. Consumers [`acquire`](EngineResource::acquire) and
//! [`release`](EngineResource::release) it, and once the count drops back to zero the engine
//! moves it to the memory cache or recycles it.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;

use crate::caching::EngineKey;
use crate::error::ResourceError;
use crate::types::TypeTag;

mod bitmap;
mod recycler;

pub use bitmap::{Bitmap, BitmapConfig, BitmapPool, BitmapResource};
pub use recycler::ResourceRecycler;

/// A decoded value with a known size that can be recycled once nobody uses it anymore.
pub trait Resource: Send + Sync + 'static {
    /// The decoded value, e.g. a [`Bitmap`].
    fn value(&self) -> &dyn Any;

    /// The runtime type of [`value`](Self::value).
    fn tag(&self) -> TypeTag;

    /// Size in bytes, used for cache accounting.
    fn size(&self) -> u64;

    /// Returns reusable parts of the resource to their pools.
    ///
    /// Called at most once, and the resource must not be used afterwards.
    fn recycle(&self) {}
}

impl dyn Resource {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value().downcast_ref()
    }
}

impl<R: Resource + ?Sized> Resource for Arc<R> {
    fn value(&self) -> &dyn Any {
        (**self).value()
    }

    fn tag(&self) -> TypeTag {
        (**self).tag()
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn recycle(&self) {
        (**self).recycle()
    }
}

/// A resource without any recyclable parts.
pub struct SimpleResource<T> {
    value: T,
    size: u64,
}

impl<T: Any + Send + Sync> SimpleResource<T> {
    pub fn new(value: T, size: u64) -> Self {
        Self { value, size }
    }
}

impl<T: Any + Send + Sync> Resource for SimpleResource<T> {
    fn value(&self) -> &dyn Any {
        &self.value
    }

    fn tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Encoded bytes, e.g. the output of a transcoder.
pub struct BytesResource(Bytes);

impl BytesResource {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl Resource for BytesResource {
    fn value(&self) -> &dyn Any {
        &self.0
    }

    fn tag(&self) -> TypeTag {
        TypeTag::of::<Bytes>()
    }

    fn size(&self) -> u64 {
        self.0.len() as u64
    }
}

/// Notified whenever the acquire count of an [`EngineResource`] drops to zero.
pub trait ResourceListener: Send + Sync {
    fn on_resource_released(&self, key: &EngineKey, resource: &EngineResource);
}

const RECYCLED: usize = usize::MAX;

struct Inner {
    resource: Arc<dyn Resource>,
    key: EngineKey,
    is_memory_cacheable: bool,
    is_recyclable: bool,
    acquired: AtomicUsize,
    listener: Weak<dyn ResourceListener>,
}

/// A shared, reference counted handle to a resource owned by the engine.
///
/// Cloning the handle does not change the acquire count.
#[derive(Clone)]
pub struct EngineResource {
    inner: Arc<Inner>,
}

impl EngineResource {
    pub fn new(
        resource: Arc<dyn Resource>,
        key: EngineKey,
        is_memory_cacheable: bool,
        is_recyclable: bool,
        listener: Weak<dyn ResourceListener>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resource,
                key,
                is_memory_cacheable,
                is_recyclable,
                acquired: AtomicUsize::new(0),
                listener,
            }),
        }
    }

    pub fn key(&self) -> &EngineKey {
        &self.inner.key
    }

    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.inner.resource
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.resource.value().downcast_ref()
    }

    pub fn tag(&self) -> TypeTag {
        self.inner.resource.tag()
    }

    pub fn size(&self) -> u64 {
        self.inner.resource.size()
    }

    pub fn is_memory_cacheable(&self) -> bool {
        self.inner.is_memory_cacheable
    }

    /// The current acquire count, `0` for recycled resources.
    pub fn acquired(&self) -> usize {
        match self.inner.acquired.load(Ordering::Acquire) {
            RECYCLED => 0,
            n => n,
        }
    }

    pub fn is_recycled(&self) -> bool {
        self.inner.acquired.load(Ordering::Acquire) == RECYCLED
    }

    /// Increments the acquire count.
    pub fn acquire(&self) -> Result<(), ResourceError> {
        self.inner
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                RECYCLED => None,
                n => Some(n + 1),
            })
            .map(drop)
            .map_err(|_| ResourceError::Recycled)
    }

    /// Decrements the acquire count, notifying the listener when it drops to zero.
    pub fn release(&self) -> Result<(), ResourceError> {
        let previous = self
            .inner
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                0 | RECYCLED => None,
                n => Some(n - 1),
            })
            .map_err(|n| match n {
                RECYCLED => ResourceError::Recycled,
                _ => ResourceError::OverReleased,
            })?;

        if previous == 1 {
            if let Some(listener) = self.inner.listener.upgrade() {
                listener.on_resource_released(&self.inner.key, self);
            }
        }
        Ok(())
    }

    /// Recycles the underlying resource.
    ///
    /// Only valid while nobody holds an acquire. Recycling an already recycled resource is a
    /// no-op, so the underlying resource is recycled exactly once.
    pub fn recycle(&self) -> Result<(), ResourceError> {
        match self.inner.acquired.compare_exchange(
            0,
            RECYCLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if self.inner.is_recyclable {
                    self.inner.resource.recycle();
                }
                Ok(())
            }
            Err(RECYCLED) => Ok(()),
            Err(_) => Err(ResourceError::StillAcquired),
        }
    }

    pub fn downgrade(&self) -> WeakEngineResource {
        WeakEngineResource(Arc::downgrade(&self.inner))
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for EngineResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineResource")
            .field("key", &self.inner.key)
            .field("tag", &self.tag())
            .field("acquired", &self.acquired())
            .field("is_memory_cacheable", &self.inner.is_memory_cacheable)
            .field("is_recyclable", &self.inner.is_recyclable)
            .finish()
    }
}

/// A handle that does not keep the [`EngineResource`] alive.
#[derive(Clone)]
pub struct WeakEngineResource(Weak<Inner>);

impl WeakEngineResource {
    pub fn upgrade(&self) -> Option<EngineResource> {
        self.0.upgrade().map(|inner| EngineResource { inner })
    }
}

#[derive(Default)]
struct LockState {
    locked: bool,
    recycle_pending: bool,
    recycled: bool,
}

/// Defers recycling of a resource while it is being written to the disk cache.
pub struct LockedResource {
    inner: Arc<dyn Resource>,
    state: Mutex<LockState>,
}

impl LockedResource {
    /// Wraps `inner` in the locked state.
    pub fn lock(inner: Arc<dyn Resource>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            state: Mutex::new(LockState {
                locked: true,
                ..Default::default()
            }),
        })
    }

    pub fn inner(&self) -> &dyn Resource {
        &*self.inner
    }

    /// Unlocks the resource, performing a recycle requested while it was locked.
    pub fn unlock(&self) {
        let recycle = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.locked = false;
            let recycle = state.recycle_pending && !state.recycled;
            state.recycled |= recycle;
            recycle
        };
        if recycle {
            self.inner.recycle();
        }
    }
}

impl Resource for LockedResource {
    fn value(&self) -> &dyn Any {
        self.inner.value()
    }

    fn tag(&self) -> TypeTag {
        self.inner.tag()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn recycle(&self) {
        let recycle = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.locked {
                state.recycle_pending = true;
                false
            } else {
                let recycle = !state.recycled;
                state.recycled = true;
                recycle
            }
        };
        if recycle {
            self.inner.recycle();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::caching::CacheKey;

    /// A resource counting how often it was recycled.
    pub struct CountingResource {
        pub size: u64,
        pub recycled: Arc<AtomicUsize>,
    }

    impl Resource for CountingResource {
        fn value(&self) -> &dyn Any {
            &self.size
        }

        fn tag(&self) -> TypeTag {
            TypeTag::of::<u64>()
        }

        fn size(&self) -> u64 {
            self.size
        }

        fn recycle(&self) {
            self.recycled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub struct RecordingListener {
        pub released: Mutex<Vec<EngineKey>>,
    }

    impl ResourceListener for RecordingListener {
        fn on_resource_released(&self, key: &EngineKey, _resource: &EngineResource) {
            self.released.lock().unwrap().push(key.clone());
        }
    }

    pub fn engine_key(name: &str) -> EngineKey {
        let tag = TypeTag::of::<u64>();
        EngineKey::new(
            &CacheKey::for_testing(name),
            &Default::default(),
            1,
            1,
            &[],
            tag,
            tag,
            &Default::default(),
        )
    }

    pub fn counting_resource(
        name: &str,
        size: u64,
        listener: Weak<dyn ResourceListener>,
    ) -> (EngineResource, Arc<AtomicUsize>) {
        let recycled = Arc::new(AtomicUsize::new(0));
        let resource = CountingResource {
            size,
            recycled: recycled.clone(),
        };
        let resource = EngineResource::new(
            Arc::new(resource),
            engine_key(name),
            true,
            true,
            listener,
        );
        (resource, recycled)
    }

    #[test]
    fn test_acquire_release_notifies_at_zero() {
        let listener = Arc::new(RecordingListener::default());
        let weak: Weak<dyn ResourceListener> = Arc::downgrade(&listener) as _;
        let (resource, _) = counting_resource("a", 1, weak);

        resource.acquire().unwrap();
        resource.acquire().unwrap();
        resource.release().unwrap();
        assert!(listener.released.lock().unwrap().is_empty());

        resource.release().unwrap();
        assert_eq!(*listener.released.lock().unwrap(), [engine_key("a")]);
    }

    #[test]
    fn test_over_release() {
        let (resource, _) = counting_resource("a", 1, Weak::<RecordingListener>::new());
        assert_eq!(resource.release(), Err(ResourceError::OverReleased));
    }

    #[test]
    fn test_recycle_exactly_once() {
        let (resource, recycled) = counting_resource("a", 1, Weak::<RecordingListener>::new());

        resource.acquire().unwrap();
        assert_eq!(resource.recycle(), Err(ResourceError::StillAcquired));
        resource.release().unwrap();

        resource.recycle().unwrap();
        resource.recycle().unwrap();
        assert_eq!(recycled.load(Ordering::SeqCst), 1);
        assert_eq!(resource.acquire(), Err(ResourceError::Recycled));
    }

    #[test]
    fn test_locked_resource_defers_recycle() {
        let recycled = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(CountingResource {
            size: 4,
            recycled: recycled.clone(),
        });
        let locked = LockedResource::lock(inner);

        Resource::recycle(&*locked);
        assert_eq!(recycled.load(Ordering::SeqCst), 0);

        locked.unlock();
        assert_eq!(recycled.load(Ordering::SeqCst), 1);

        Resource::recycle(&*locked);
        assert_eq!(recycled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unlock_without_recycle() {
        let recycled = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(CountingResource {
            size: 4,
            recycled: recycled.clone(),
        });
        let locked = LockedResource::lock(inner);
        locked.unlock();
        assert_eq!(recycled.load(Ordering::SeqCst), 0);

        Resource::recycle(&*locked);
        assert_eq!(recycled.load(Ordering::SeqCst), 1);
    }
}
