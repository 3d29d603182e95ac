use std::borrow::Cow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bitmill_service::caching::{DiskCache, DiskCacheAdapter, DiskLruCacheWrapper};
use bitmill_service::config::Config;
use bitmill_service::decode::{DecodeCallback, DecodeContext, DecodeJob};
use bitmill_service::engine::{Engine, EngineParts};
use bitmill_service::error::LoadError;
use bitmill_service::registry::{
    Data, DataCallback, DataFetcher, LoadData, Model, ModelKey, ModelLoader, Registry,
};
use bitmill_service::resource::{BitmapPool, Resource};
use bitmill_service::types::{DataSource, Options, Priority, TypeTag};
use bytes::Bytes;

/// A model for images that live somewhere else.
#[derive(Clone, Debug)]
pub struct Remote(pub String);

impl ModelKey for Remote {
    fn key(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.0)
    }
}

pub fn remote(name: &str) -> Model {
    Model::new(Remote(name.to_owned()))
}

/// Blocks fetches until it is opened.
#[derive(Default)]
pub struct Gate {
    /// `(entered, open)`
    state: Mutex<(bool, bool)>,
    cond: Condvar,
}

impl Gate {
    pub fn open(&self) {
        self.state.lock().unwrap().1 = true;
        self.cond.notify_all();
    }

    /// Waits until a fetch is blocked on the gate.
    pub fn wait_entered(&self) {
        let state = self.state.lock().unwrap();
        let _state = self.cond.wait_while(state, |(entered, _)| !*entered).unwrap();
    }

    fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 = true;
        self.cond.notify_all();
        let _state = self.cond.wait_while(state, |(_, open)| !*open).unwrap();
    }
}

/// What a [`RemoteLoader`] does when asked for data.
#[derive(Clone)]
pub enum Behavior {
    Serve(Bytes),
    Fail(&'static str),
    Gated(Arc<Gate>, Bytes),
    /// Cancels the token before handing out anything.
    Cancel(tokio_util::sync::CancellationToken),
}

/// Counts fetches and cancellations of [`RemoteLoader`]s.
#[derive(Default)]
pub struct Stats {
    pub fetches: AtomicUsize,
    pub cancelled: AtomicBool,
}

impl Stats {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Loads [`Remote`] models as [`Bytes`] from [`DataSource::Remote`].
pub struct RemoteLoader {
    pub behavior: Behavior,
    pub stats: Arc<Stats>,
}

impl RemoteLoader {
    pub fn new(behavior: Behavior) -> (Self, Arc<Stats>) {
        let stats = Arc::new(Stats::default());
        let loader = Self {
            behavior,
            stats: Arc::clone(&stats),
        };
        (loader, stats)
    }
}

impl ModelLoader for RemoteLoader {
    fn build_load_data(&self, model: &Model, _: u32, _: u32, _: &Options) -> Option<LoadData> {
        model.downcast_ref::<Remote>()?;
        Some(LoadData::new(
            model.cache_key(),
            RemoteFetcher {
                behavior: self.behavior.clone(),
                stats: Arc::clone(&self.stats),
            },
        ))
    }
}

struct RemoteFetcher {
    behavior: Behavior,
    stats: Arc<Stats>,
}

impl DataFetcher for RemoteFetcher {
    fn load_data(&self, _priority: Priority, callback: DataCallback) {
        self.stats.fetches.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Serve(bytes) => callback.on_data_ready(Data::new(bytes.clone())),
            Behavior::Fail(message) => callback.on_load_failed(anyhow::anyhow!(*message)),
            Behavior::Gated(gate, bytes) => {
                gate.wait();
                callback.on_data_ready(Data::new(bytes.clone()));
            }
            Behavior::Cancel(token) => {
                token.cancel();
                callback.on_data_ready(Data::new(Bytes::new()));
            }
        }
    }

    fn cancel(&self) {
        self.stats.cancelled.store(true, Ordering::SeqCst);
    }

    fn data_tag(&self) -> TypeTag {
        TypeTag::of::<Bytes>()
    }

    fn data_source(&self) -> DataSource {
        DataSource::Remote
    }
}

pub fn png(width: u32, height: u32) -> Bytes {
    Bytes::from(bitmill_test::png_bytes(width, height))
}

/// An engine with the default registry, extended by `configure`.
pub fn setup_engine(cache_dir: Option<&Path>, configure: impl FnOnce(&mut Registry)) -> Engine {
    let config = Config {
        cache_dir: cache_dir.map(Path::to_owned),
        ..Default::default()
    };
    setup_engine_with(&config, |parts| configure(&mut parts.registry))
}

/// An engine built from `config`, with its parts adjusted by `configure`.
pub fn setup_engine_with(config: &Config, configure: impl FnOnce(&mut EngineParts)) -> Engine {
    bitmill_test::setup();
    let mut parts = EngineParts::from_config(config);
    configure(&mut parts);
    Engine::from_parts(parts)
}

/// Everything a [`DecodeJob`] needs, with the default registry extended by `configure`.
pub fn decode_context(
    cache_dir: Option<&Path>,
    configure: impl FnOnce(&mut Registry, &Arc<BitmapPool>),
) -> DecodeContext {
    let pool = Arc::new(BitmapPool::new(1024 * 1024));
    let mut registry = Registry::with_defaults(Arc::clone(&pool));
    configure(&mut registry, &pool);
    context_from(cache_dir, registry, pool)
}

pub fn context_from(
    cache_dir: Option<&Path>,
    registry: Registry,
    pool: Arc<BitmapPool>,
) -> DecodeContext {
    bitmill_test::setup();
    let disk_cache: Arc<dyn DiskCache> = match cache_dir {
        Some(dir) => Arc::new(DiskLruCacheWrapper::new(dir, 1, 10 * 1024 * 1024)),
        None => Arc::new(DiskCacheAdapter),
    };

    DecodeContext {
        registry: Arc::new(registry),
        disk_cache,
        pool,
    }
}

/// What a [`DecodeJob`] reported.
pub enum Event {
    Ready {
        resource: Box<dyn Resource>,
        data_source: DataSource,
        is_alternate_cache_key: bool,
    },
    Failed(LoadError),
}

/// Records all calls made by a [`DecodeJob`].
#[derive(Default)]
pub struct RecordingCallback {
    pub events: Mutex<Vec<Event>>,
    pub rescheduled: Mutex<Vec<DecodeJob>>,
}

impl RecordingCallback {
    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn take_rescheduled(&self) -> Option<DecodeJob> {
        self.rescheduled.lock().unwrap().pop()
    }
}

impl DecodeCallback for RecordingCallback {
    fn on_resource_ready(
        &self,
        resource: Box<dyn Resource>,
        data_source: DataSource,
        is_alternate_cache_key: bool,
    ) {
        self.events.lock().unwrap().push(Event::Ready {
            resource,
            data_source,
            is_alternate_cache_key,
        });
    }

    fn on_load_failed(&self, error: LoadError) {
        self.events.lock().unwrap().push(Event::Failed(error));
    }

    fn reschedule(&self, job: DecodeJob) {
        self.rescheduled.lock().unwrap().push(job);
    }
}
