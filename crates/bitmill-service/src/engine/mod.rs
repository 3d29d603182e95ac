//! Entry point for loading resources.
//!
//! The [`Engine`] looks a request up in the in-memory layers first, and otherwise attaches the
//! caller to the in-flight [`EngineJob`] for the same [`EngineKey`], starting one if needed.
//!
//! # Metrics
//!
//! - `engine.load`: Every call to [`Engine::load`].
//! - `engine.active.hit`, `engine.memory.hit`: Loads served without a job.
//! - `engine.job.started`, `engine.job.joined`: Loads that started or joined an in-flight job.
//! - `engine.job.cancelled`: Jobs cancelled because nobody waits for them anymore.
//! - `engine.job.rejected`: Jobs failed because their executor did not run them.
//! - `engine.jobs`: A gauge of the in-flight jobs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::caching::{
    ActiveResources, DiskCacheProvider, EngineKey, LruResourceCache, MemoryCache,
    ResourceRemovedListener, TrimLevel,
};
use crate::config::Config;
use crate::decode::{DecodeContext, LoadRequest};
use crate::error::{LoadError, ResourceError};
use crate::executor::{CallbackExecutor, DirectExecutor, Executors};
use crate::registry::Registry;
use crate::resource::{BitmapPool, EngineResource, ResourceListener, ResourceRecycler};
use crate::types::DataSource;
use crate::utils::futures::CallOnDrop;

mod callback;
mod job;

pub use callback::{ChannelCallback, LoadResult, Loaded, ResourceCallback};
pub use job::EngineJob;

use job::EngineJobListener;

/// Jobs restricted to the caches must not be joined by unrestricted loads, and vice versa.
type JobKey = (EngineKey, bool);

/// The components an [`Engine`] is assembled from.
pub struct EngineParts {
    pub memory_cache: Arc<dyn MemoryCache>,
    pub disk_cache: DiskCacheProvider,
    pub registry: Registry,
    pub pool: Arc<BitmapPool>,
    pub executors: Executors,
}

impl EngineParts {
    /// The default components, sized according to `config`.
    pub fn from_config(config: &Config) -> Self {
        let caches = &config.caches;
        let pool = Arc::new(BitmapPool::new(caches.bitmap_pool.max_size));
        let memory_cache = LruResourceCache::new(caches.memory.max_size);
        memory_cache.set_size_multiplier(caches.memory.size_multiplier);

        Self {
            memory_cache: Arc::new(memory_cache),
            disk_cache: DiskCacheProvider::from_config(config),
            registry: Registry::with_defaults(Arc::clone(&pool)),
            pool,
            executors: Executors::new(&config.executors),
        }
    }
}

/// The outcome of [`Engine::load`].
#[derive(Debug)]
pub enum LoadStatus {
    /// The callback was already called with a resource from memory.
    Complete,
    /// The callback will be called once the job finishes.
    Pending(LoadHandle),
}

/// Allows to stop waiting for a pending load.
#[derive(Debug)]
pub struct LoadHandle {
    job: Arc<EngineJob>,
    id: u64,
}

impl LoadHandle {
    /// Unregisters the callback.
    ///
    /// The job itself is cancelled once no callback is left. A callback that is not called yet
    /// will not be called anymore.
    pub fn cancel(self) {
        self.job.remove_callback(self.id);
    }
}

struct EngineInner {
    jobs: Mutex<HashMap<JobKey, Arc<EngineJob>>>,
    active: ActiveResources,
    memory_cache: Arc<dyn MemoryCache>,
    disk_cache: DiskCacheProvider,
    registry: Arc<Registry>,
    pool: Arc<BitmapPool>,
    executors: Arc<Executors>,
    recycler: ResourceRecycler,
    this: Weak<EngineInner>,
}

impl EngineInner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobKey, Arc<EngineJob>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decode_context(&self) -> DecodeContext {
        DecodeContext {
            registry: Arc::clone(&self.registry),
            disk_cache: self.disk_cache.disk_cache(),
            pool: Arc::clone(&self.pool),
        }
    }

    fn load_from_active(&self, key: &EngineKey) -> Option<EngineResource> {
        let resource = self.active.get(key)?;
        resource.acquire().ok()?;
        if !self.is_active(key, &resource) {
            // released concurrently, and possibly moved to the memory cache already
            self.reclaim(key, &resource);
        }
        metric!(counter("engine.active.hit") += 1);
        Some(resource)
    }

    fn is_active(&self, key: &EngineKey, resource: &EngineResource) -> bool {
        self.active
            .get(key)
            .is_some_and(|active| active.ptr_eq(resource))
    }

    /// Moves a resource that was acquired while being released back to the active layer.
    fn reclaim(&self, key: &EngineKey, resource: &EngineResource) {
        if let Some(cached) = self.memory_cache.remove(key) {
            if !cached.ptr_eq(resource) {
                self.memory_cache.put(key.clone(), cached);
            }
        }
        self.active.activate(key.clone(), resource);
    }

    fn load_from_cache(&self, key: &EngineKey) -> Option<EngineResource> {
        let resource = self.memory_cache.remove(key)?;
        if let Err(error) = resource.acquire() {
            tracing::warn!(
                %key,
                error = &error as &dyn std::error::Error,
                "memory cache returned an unusable resource"
            );
            return None;
        }
        self.active.activate(key.clone(), &resource);
        metric!(counter("engine.memory.hit") += 1);
        Some(resource)
    }

    fn remove_job(&self, job: &EngineJob) {
        let job_key = (
            job.key().clone(),
            job.request().is_only_retrieve_from_cache(),
        );
        let mut jobs = self.jobs();
        if jobs
            .get(&job_key)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), job))
        {
            jobs.remove(&job_key);
        }
        metric!(gauge("engine.jobs") = jobs.len() as u64);
    }
}

impl ResourceListener for EngineInner {
    fn on_resource_released(&self, key: &EngineKey, resource: &EngineResource) {
        self.active.deactivate(key);
        if resource.acquired() > 0 {
            // picked up from the active layer while being released
            self.active.activate(key.clone(), resource);
            return;
        }

        if resource.is_memory_cacheable() {
            self.memory_cache.put(key.clone(), resource.clone());
            if resource.acquired() > 0 {
                tracing::trace!(%key, "resource acquired while moving to the memory cache");
                self.reclaim(key, resource);
            }
        } else {
            self.recycler.recycle(resource.clone());
        }
    }
}

impl ResourceRemovedListener for EngineInner {
    fn on_resource_removed(&self, resource: EngineResource) {
        self.recycler.recycle(resource);
    }
}

impl EngineJobListener for EngineInner {
    fn on_engine_job_complete(&self, job: &EngineJob, resource: Option<&EngineResource>) {
        if let Some(resource) = resource {
            if resource.is_memory_cacheable() {
                self.active.activate(job.key().clone(), resource);
            }
        }
        self.remove_job(job);
    }

    fn on_engine_job_cancelled(&self, job: &EngineJob) {
        self.remove_job(job);
    }
}

/// Loads resources, coordinating the caches and the in-flight jobs.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine with the default components.
    pub fn new(config: &Config) -> Self {
        Self::from_parts(EngineParts::from_config(config))
    }

    pub fn from_parts(parts: EngineParts) -> Self {
        let EngineParts {
            memory_cache,
            disk_cache,
            registry,
            pool,
            executors,
        } = parts;

        let inner = Arc::new_cyclic(|this: &Weak<EngineInner>| {
            let resource_listener: Weak<dyn ResourceListener> = this.clone();
            let removed_listener: Weak<dyn ResourceRemovedListener> = this.clone();

            let active = ActiveResources::new();
            active.set_listener(resource_listener);
            memory_cache.set_resource_removed_listener(removed_listener);

            EngineInner {
                jobs: Mutex::new(HashMap::new()),
                active,
                memory_cache,
                disk_cache,
                registry: Arc::new(registry),
                pool,
                executors: Arc::new(executors),
                recycler: ResourceRecycler::new(),
                this: this.clone(),
            }
        });

        Self { inner }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn memory_cache(&self) -> &Arc<dyn MemoryCache> {
        &self.inner.memory_cache
    }

    pub fn active_resources(&self) -> &ActiveResources {
        &self.inner.active
    }

    pub fn bitmap_pool(&self) -> &Arc<BitmapPool> {
        &self.inner.pool
    }

    /// The number of in-flight jobs.
    pub fn jobs(&self) -> usize {
        self.inner.jobs().len()
    }

    /// Starts a load, or serves it from memory right away.
    ///
    /// Resources from memory are handed to `callback` on the calling thread, everything else is
    /// delivered through `executor`. The resource handed to the callback is acquired once, and
    /// must be [released](Self::release) when it is no longer used.
    pub fn load(
        &self,
        request: LoadRequest,
        callback: Arc<dyn ResourceCallback>,
        executor: Arc<dyn CallbackExecutor>,
    ) -> LoadStatus {
        let inner = &*self.inner;
        let key = request.engine_key();
        let job_key = (key.clone(), request.is_only_retrieve_from_cache());
        let request = Arc::new(request);
        metric!(counter("engine.load") += 1);

        loop {
            if request.is_memory_cacheable() {
                let resource = inner
                    .load_from_active(&key)
                    .or_else(|| inner.load_from_cache(&key));
                if let Some(resource) = resource {
                    tracing::trace!(%key, "loaded resource from memory");
                    callback.on_resource_ready(resource, DataSource::MemoryCache, false);
                    return LoadStatus::Complete;
                }
            }

            let (job, is_new) = {
                let mut jobs = inner.jobs();
                match jobs.get(&job_key) {
                    Some(job) if !job.is_cancelled() => (Arc::clone(job), false),
                    _ => {
                        let resource_listener: Weak<dyn ResourceListener> = inner.this.clone();
                        let job_listener: Weak<dyn EngineJobListener> = inner.this.clone();
                        let job = EngineJob::new(
                            key.clone(),
                            Arc::clone(&request),
                            Arc::clone(&inner.executors),
                            job_listener,
                            resource_listener,
                        );
                        jobs.insert(job_key.clone(), Arc::clone(&job));
                        metric!(gauge("engine.jobs") = jobs.len() as u64);
                        (job, true)
                    }
                }
            };

            // The job may finish between the lookup and adding the callback. In that case its
            // resource is in one of the memory layers by now, or it was cancelled.
            let Some(id) = job.add_callback(Arc::clone(&callback), Arc::clone(&executor)) else {
                tracing::trace!(%key, "job finished concurrently, retrying");
                continue;
            };

            if is_new {
                tracing::debug!(%key, "started engine job");
                metric!(counter("engine.job.started") += 1);
                job.start(inner.decode_context());
            } else {
                tracing::debug!(%key, "joined engine job");
                metric!(counter("engine.job.joined") += 1);
            }
            return LoadStatus::Pending(LoadHandle { job, id });
        }
    }

    /// Loads a resource, resolving once it is ready.
    ///
    /// Dropping the future cancels the load.
    pub async fn load_async(&self, request: LoadRequest) -> LoadResult {
        let (callback, receiver) = ChannelCallback::new();
        let status = self.load(request, Arc::new(callback), Arc::new(DirectExecutor));
        let guard = match status {
            LoadStatus::Complete => None,
            LoadStatus::Pending(handle) => Some(CallOnDrop::new(move || handle.cancel())),
        };

        let result = receiver.await;
        if let Some(guard) = guard {
            guard.cancel();
        }
        result.unwrap_or_else(|_| Err(Arc::new(LoadError::new("Load was abandoned"))))
    }

    /// Releases a resource handed out by [`load`](Self::load).
    pub fn release(&self, resource: &EngineResource) -> Result<(), ResourceError> {
        resource.release()
    }

    /// Moves resources whose handles were dropped without being released to the memory cache.
    pub fn cleanup_released(&self) {
        self.inner.active.cleanup_released();
    }

    pub fn set_memory_size_multiplier(&self, multiplier: f32) {
        self.inner.memory_cache.set_size_multiplier(multiplier);
    }

    pub fn clear_memory(&self) {
        self.cleanup_released();
        self.inner.memory_cache.clear_memory();
        self.inner.pool.clear_memory();
    }

    pub fn trim_memory(&self, level: TrimLevel) {
        tracing::debug!(?level, "trimming memory");
        self.cleanup_released();
        self.inner.memory_cache.trim_memory(level);
        self.inner.pool.trim_memory(level);
    }

    /// Clears the disk cache, if it was used at all.
    pub fn clear_disk_cache(&self) {
        self.inner.disk_cache.clear_disk_cache_if_created();
    }

    /// Stops all executors, waiting for running jobs to finish.
    pub fn shutdown(&self) {
        self.inner.executors.shutdown();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("jobs", &self.jobs())
            .field("active", &self.inner.active.len())
            .field("memory_size", &self.inner.memory_cache.current_size())
            .field("pool", &self.inner.pool)
            .field("executors", &self.inner.executors)
            .finish()
    }
}
