use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bitmill_service::caching::{
    EngineKey, LruResourceCache, MemoryCache, ResourceRemovedListener, TrimLevel,
};
use bitmill_service::config::Config;
use bitmill_service::decode::LoadRequest;
use bitmill_service::engine::{ChannelCallback, LoadStatus};
use bitmill_service::error::LoadErrorKind;
use bitmill_service::executor::{DirectExecutor, RejectionPolicy};
use bitmill_service::resource::{Bitmap, EngineResource};
use bitmill_service::types::{DataSource, DiskCacheStrategy, Priority};
use bytes::Bytes;

use crate::utils::{
    Behavior, Gate, Remote, RemoteLoader, png, remote, setup_engine, setup_engine_with,
};

fn request() -> LoadRequest {
    LoadRequest::new(remote("a")).size(8, 8)
}

#[tokio::test]
async fn test_released_resource_is_served_from_memory() {
    let (loader, stats) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let engine = setup_engine(None, |registry| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });

    let loaded = engine.load_async(request()).await.unwrap();
    assert_eq!(loaded.data_source, DataSource::Remote);
    assert!(loaded.resource.downcast_ref::<Bitmap>().is_some());
    assert_eq!(loaded.resource.acquired(), 1);
    assert_eq!(engine.active_resources().len(), 1);
    assert_eq!(engine.jobs(), 0);

    // a second consumer shares the active resource
    let shared = engine.load_async(request()).await.unwrap();
    assert_eq!(shared.data_source, DataSource::MemoryCache);
    assert!(shared.resource.ptr_eq(&loaded.resource));
    assert_eq!(loaded.resource.acquired(), 2);
    engine.release(&shared.resource).unwrap();

    let size = loaded.resource.size();
    engine.release(&loaded.resource).unwrap();
    assert!(engine.active_resources().is_empty());
    assert_eq!(engine.memory_cache().current_size(), size);
    assert!(!loaded.resource.is_recycled());

    let again = engine.load_async(request()).await.unwrap();
    assert_eq!(again.data_source, DataSource::MemoryCache);
    assert!(again.resource.ptr_eq(&loaded.resource));
    assert_eq!(engine.memory_cache().current_size(), 0);
    assert_eq!(engine.active_resources().len(), 1);
    assert_eq!(stats.fetches(), 1);

    engine.shutdown();
}

#[tokio::test]
async fn test_concurrent_loads_share_one_job() {
    let gate = Arc::new(Gate::default());
    let (loader, stats) = RemoteLoader::new(Behavior::Gated(gate.clone(), png(8, 8)));
    let engine = setup_engine(None, |registry| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });

    let (first, first_rx) = ChannelCallback::new();
    let (second, second_rx) = ChannelCallback::new();
    let first_status = engine.load(request(), Arc::new(first), Arc::new(DirectExecutor));
    let second_status = engine.load(request(), Arc::new(second), Arc::new(DirectExecutor));
    assert!(matches!(first_status, LoadStatus::Pending(_)));
    assert!(matches!(second_status, LoadStatus::Pending(_)));
    assert_eq!(engine.jobs(), 1);

    gate.open();
    let first = first_rx.await.unwrap().unwrap();
    let second = second_rx.await.unwrap().unwrap();

    assert!(first.resource.ptr_eq(&second.resource));
    assert_eq!(first.data_source, second.data_source);
    assert_eq!(first.resource.acquired(), 2);
    assert_eq!(stats.fetches(), 1);
    assert_eq!(engine.jobs(), 0);

    engine.shutdown();
}

#[tokio::test]
async fn test_cancelled_load_never_calls_back() {
    let gate = Arc::new(Gate::default());
    let (loader, stats) = RemoteLoader::new(Behavior::Gated(gate.clone(), png(8, 8)));
    let engine = setup_engine(None, |registry| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });

    let (callback, receiver) = ChannelCallback::new();
    let LoadStatus::Pending(handle) =
        engine.load(request(), Arc::new(callback), Arc::new(DirectExecutor))
    else {
        panic!("nothing was loaded yet");
    };
    gate.wait_entered();

    handle.cancel();
    assert_eq!(engine.jobs(), 0);
    // the callback is dropped without being called
    assert!(receiver.await.is_err());

    gate.open();
    engine.shutdown();
    assert!(stats.cancelled());
    assert!(engine.active_resources().is_empty());
    assert_eq!(engine.memory_cache().current_size(), 0);
}

#[tokio::test]
async fn test_load_after_cancel_starts_new_job() {
    let gate = Arc::new(Gate::default());
    let (loader, stats) = RemoteLoader::new(Behavior::Gated(gate.clone(), png(8, 8)));
    let engine = setup_engine(None, |registry| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });

    let (callback, _receiver) = ChannelCallback::new();
    if let LoadStatus::Pending(handle) =
        engine.load(request(), Arc::new(callback), Arc::new(DirectExecutor))
    {
        handle.cancel();
    }

    gate.open();
    let loaded = engine.load_async(request()).await.unwrap();
    assert_eq!(loaded.resource.acquired(), 1);
    assert!(stats.fetches() >= 1);

    engine.shutdown();
}

#[tokio::test]
async fn test_failure_is_delivered() {
    let (loader, _) = RemoteLoader::new(Behavior::Fail("not found"));
    let engine = setup_engine(None, |registry| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });

    let error = engine.load_async(request()).await.unwrap_err();
    assert_eq!(error.kind(), LoadErrorKind::Failed);
    let roots: Vec<_> = error
        .root_causes()
        .into_iter()
        .map(|error| error.to_string())
        .collect();
    assert_eq!(roots, ["not found"]);
    assert_eq!(engine.jobs(), 0);

    engine.shutdown();
}

#[tokio::test]
async fn test_only_retrieve_from_cache_fails_on_miss() {
    let (loader, stats) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let engine = setup_engine(None, |registry| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });

    let result = engine
        .load_async(request().only_retrieve_from_cache(true))
        .await;
    assert!(result.is_err());
    assert_eq!(stats.fetches(), 0);

    engine.shutdown();
}

#[tokio::test]
async fn test_skip_memory_cache_recycles_on_release() {
    let (loader, stats) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let engine = setup_engine(None, |registry| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });

    let loaded = engine
        .load_async(request().skip_memory_cache(true))
        .await
        .unwrap();
    assert!(engine.active_resources().is_empty());

    engine.release(&loaded.resource).unwrap();
    assert!(loaded.resource.is_recycled());
    assert_eq!(engine.memory_cache().current_size(), 0);

    let again = engine
        .load_async(request().skip_memory_cache(true))
        .await
        .unwrap();
    assert!(!again.resource.ptr_eq(&loaded.resource));
    assert_eq!(stats.fetches(), 2);

    engine.shutdown();
}

#[tokio::test]
async fn test_trim_memory_recycles_cached_resources() {
    let (loader, _) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let engine = setup_engine(None, |registry| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });

    let loaded = engine.load_async(request()).await.unwrap();
    engine.release(&loaded.resource).unwrap();
    assert!(engine.memory_cache().current_size() > 0);

    engine.trim_memory(TrimLevel::Complete);
    assert_eq!(engine.memory_cache().current_size(), 0);
    assert!(loaded.resource.is_recycled());
    assert_eq!(engine.bitmap_pool().current_size(), 0);

    engine.shutdown();
}

#[tokio::test]
async fn test_disk_cache_survives_restart() {
    let cache_dir = bitmill_test::tempdir();
    let request = || request().disk_cache_strategy(DiskCacheStrategy::All);

    let (loader, stats) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let engine = setup_engine(Some(cache_dir.path()), |registry| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });
    let loaded = engine.load_async(request()).await.unwrap();
    assert_eq!(loaded.data_source, DataSource::Remote);
    engine.release(&loaded.resource).unwrap();
    // waits for the disk cache writes
    engine.shutdown();
    drop(engine);
    assert_eq!(stats.fetches(), 1);

    let (loader, stats) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let engine = setup_engine(Some(cache_dir.path()), |registry| {
        registry.append_model_loader::<Remote, Bytes>(loader);
    });
    let cached = engine.load_async(request()).await.unwrap();
    assert_eq!(cached.data_source, DataSource::ResourceDiskCache);
    assert_eq!(stats.fetches(), 0);

    let original = loaded.resource.downcast_ref::<Bitmap>().map(Bitmap::pixels);
    let restored = cached.resource.downcast_ref::<Bitmap>().map(Bitmap::pixels);
    assert!(restored.is_some());
    assert_eq!(restored.map(<[u8]>::len), original.map(<[u8]>::len));

    engine.shutdown();
}

#[tokio::test]
async fn test_discarded_load_fails() {
    let mut config = Config::default();
    config.executors.source.threads = 1;
    config.executors.source.queue_capacity = 1;
    config.executors.source.rejection = RejectionPolicy::DiscardLowest;

    let gate = Arc::new(Gate::default());
    let (loader, stats) = RemoteLoader::new(Behavior::Gated(gate.clone(), png(8, 8)));
    let engine = setup_engine_with(&config, |parts| {
        parts
            .registry
            .append_model_loader::<Remote, Bytes>(loader);
    });

    let request = |name: &str, priority: Priority| {
        LoadRequest::new(remote(name))
            .size(8, 8)
            .disk_cache_strategy(DiskCacheStrategy::None)
            .priority(priority)
    };
    let load = |request: LoadRequest| {
        let (callback, receiver) = ChannelCallback::new();
        engine.load(request, Arc::new(callback), Arc::new(DirectExecutor));
        receiver
    };

    // occupies the only worker
    let running = load(request("a", Priority::High));
    gate.wait_entered();
    // fills the queue, and makes room for the next one
    let discarded = load(request("b", Priority::Low));
    let queued = load(request("c", Priority::High));

    let error = discarded.await.unwrap().unwrap_err();
    assert_eq!(error.kind(), LoadErrorKind::Rejected);
    assert_eq!(engine.jobs(), 2);

    gate.open();
    assert!(running.await.unwrap().is_ok());
    assert!(queued.await.unwrap().is_ok());
    assert_eq!(engine.jobs(), 0);
    assert_eq!(stats.fetches(), 2);

    // the discarded key is not stuck on a dead job
    let retried = engine
        .load_async(request("b", Priority::Normal))
        .await
        .unwrap();
    assert_eq!(retried.data_source, DataSource::Remote);

    engine.shutdown();
}

/// Acquires the first resource put into it, like a load that picked the resource up from
/// the active layer just before it was released.
struct ContendedCache {
    inner: LruResourceCache,
    contended: AtomicBool,
}

impl MemoryCache for ContendedCache {
    fn current_size(&self) -> u64 {
        self.inner.current_size()
    }

    fn max_size(&self) -> u64 {
        self.inner.max_size()
    }

    fn set_size_multiplier(&self, multiplier: f32) {
        self.inner.set_size_multiplier(multiplier)
    }

    fn remove(&self, key: &EngineKey) -> Option<EngineResource> {
        self.inner.remove(key)
    }

    fn put(&self, key: EngineKey, resource: EngineResource) {
        self.inner.put(key, resource.clone());
        if !self.contended.swap(true, Ordering::SeqCst) {
            resource.acquire().unwrap();
        }
    }

    fn set_resource_removed_listener(&self, listener: Weak<dyn ResourceRemovedListener>) {
        self.inner.set_resource_removed_listener(listener)
    }

    fn clear_memory(&self) {
        self.inner.clear_memory()
    }

    fn trim_memory(&self, level: TrimLevel) {
        self.inner.trim_memory(level)
    }
}

#[tokio::test]
async fn test_resource_acquired_during_release_stays_active() {
    let (loader, stats) = RemoteLoader::new(Behavior::Serve(png(8, 8)));
    let engine = setup_engine_with(&Config::default(), |parts| {
        parts
            .registry
            .append_model_loader::<Remote, Bytes>(loader);
        parts.memory_cache = Arc::new(ContendedCache {
            inner: LruResourceCache::new(1024 * 1024),
            contended: AtomicBool::new(false),
        });
    });

    let loaded = engine.load_async(request()).await.unwrap();
    engine.release(&loaded.resource).unwrap();

    // still in use, so it must not sit in the memory cache
    assert_eq!(loaded.resource.acquired(), 1);
    assert!(!loaded.resource.is_recycled());
    assert_eq!(engine.memory_cache().current_size(), 0);
    assert_eq!(engine.active_resources().len(), 1);

    let again = engine.load_async(request()).await.unwrap();
    assert!(again.resource.ptr_eq(&loaded.resource));
    assert_eq!(loaded.resource.acquired(), 2);
    assert_eq!(stats.fetches(), 1);

    engine.release(&again.resource).unwrap();
    engine.release(&loaded.resource).unwrap();
    assert!(engine.active_resources().is_empty());
    assert_eq!(engine.memory_cache().current_size(), loaded.resource.size());

    engine.shutdown();
}
