use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use super::*;
use crate::resource::tests::{counting_resource, engine_key};
use crate::resource::{EngineResource, ResourceListener, ResourceRecycler};
use crate::types::{Options, Signature, TypeTag};

/// Wires the in-memory layers together the way the engine does.
struct Layers {
    active: ActiveResources,
    memory: LruResourceCache,
    recycler: ResourceRecycler,
}

impl ResourceListener for Layers {
    fn on_resource_released(&self, key: &EngineKey, resource: &EngineResource) {
        self.active.deactivate(key);
        self.memory.put(key.clone(), resource.clone());
    }
}

impl ResourceRemovedListener for Layers {
    fn on_resource_removed(&self, resource: EngineResource) {
        self.recycler.recycle(resource);
    }
}

fn layers(max_size: u64) -> Arc<Layers> {
    let layers = Arc::new(Layers {
        active: ActiveResources::new(),
        memory: LruResourceCache::new(max_size),
        recycler: ResourceRecycler::new(),
    });
    layers.active.set_listener(Arc::downgrade(&layers) as Weak<dyn ResourceListener>);
    layers
        .memory
        .set_resource_removed_listener(Arc::downgrade(&layers) as Weak<dyn ResourceRemovedListener>);
    layers
}

#[test]
fn test_released_resource_moves_to_memory_and_is_recycled_on_eviction() {
    let layers = layers(10);
    let listener = Arc::downgrade(&layers) as Weak<dyn ResourceListener>;

    let (a, a_recycled) = counting_resource("a", 6, listener.clone());
    a.acquire().unwrap();
    layers.active.activate(engine_key("a"), &a);
    assert!(layers.active.get(&engine_key("a")).is_some());

    a.release().unwrap();
    assert!(layers.active.get(&engine_key("a")).is_none());
    assert!(layers.memory.contains(&engine_key("a")));
    assert_eq!(a_recycled.load(Ordering::SeqCst), 0);

    // does not fit next to `a`
    let (b, _) = counting_resource("b", 6, listener);
    b.acquire().unwrap();
    b.release().unwrap();

    assert!(!layers.memory.contains(&engine_key("a")));
    assert!(layers.memory.contains(&engine_key("b")));
    assert_eq!(a_recycled.load(Ordering::SeqCst), 1);
    assert!(a.is_recycled());
}

#[test]
fn test_memory_hit_moves_back_to_active() {
    let layers = layers(10);
    let listener = Arc::downgrade(&layers) as Weak<dyn ResourceListener>;

    let (a, _) = counting_resource("a", 4, listener);
    a.acquire().unwrap();
    a.release().unwrap();

    let hit = layers.memory.remove(&engine_key("a")).unwrap();
    hit.acquire().unwrap();
    layers.active.activate(engine_key("a"), &hit);

    assert!(hit.ptr_eq(&a));
    assert_eq!(layers.memory.current_size(), 0);
    assert!(layers.active.get(&engine_key("a")).is_some());
}

#[test]
fn test_leaked_resource_is_salvaged_into_memory() {
    let layers = layers(10);
    let listener = Arc::downgrade(&layers) as Weak<dyn ResourceListener>;

    let (a, recycled) = counting_resource("a", 4, listener);
    a.acquire().unwrap();
    layers.active.activate(engine_key("a"), &a);
    drop(a);

    layers.active.cleanup_released();
    assert!(layers.active.is_empty());
    assert!(layers.memory.contains(&engine_key("a")));

    // salvaged resources never recycle the underlying resource again
    layers.memory.clear_memory();
    assert_eq!(recycled.load(Ordering::SeqCst), 0);
}

fn write_bytes(value: &'static [u8]) -> impl Fn(&mut dyn Write) -> anyhow::Result<()> {
    move |file: &mut dyn Write| Ok(file.write_all(value)?)
}

#[test]
fn test_data_and_resource_entries_are_separate() {
    let dir = bitmill_test::tempdir();
    let cache = DiskLruCacheWrapper::new(dir.path(), 1, 1024);

    let source = CacheKey::for_model(TypeTag::of::<String>(), "image.png");
    let signature = Signature::empty();
    let data = CacheKey::data(&source, &signature);
    let resource = CacheKey::resource(
        &source,
        &signature,
        10,
        10,
        Some("center_crop"),
        TypeTag::of::<u64>(),
        &Options::new(),
    );
    assert_ne!(data, resource);

    cache.put(&data, &write_bytes(b"data"));
    cache.put(&resource, &write_bytes(b"resource"));

    assert_eq!(&cache.get(&data).unwrap().read_bytes().unwrap()[..], b"data");
    assert_eq!(
        &cache.get(&resource).unwrap().read_bytes().unwrap()[..],
        b"resource"
    );
}

#[test]
fn test_disk_entries_survive_reopen() {
    let dir = bitmill_test::tempdir();
    let key = CacheKey::for_model(TypeTag::of::<String>(), "image.png");

    {
        let cache = DiskLruCacheWrapper::new(dir.path(), 1, 1024);
        cache.put(&key, &write_bytes(b"persisted"));
    }

    let cache = DiskLruCacheWrapper::new(dir.path(), 1, 1024);
    let snapshot = cache.get(&key).unwrap();
    assert_eq!(&snapshot.read_bytes().unwrap()[..], b"persisted");

    // a different app version invalidates everything
    let cache = DiskLruCacheWrapper::new(dir.path(), 2, 1024);
    assert!(cache.get(&key).is_none());
}
