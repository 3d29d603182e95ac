use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::executor::block_on;
use tokio_util::sync::CancellationToken;

use super::callback::ResourceCallback;
use crate::caching::EngineKey;
use crate::decode::{DecodeCallback, DecodeContext, DecodeJob, LoadRequest};
use crate::error::{ExecutorError, LoadError, LoadErrorKind};
use crate::executor::{CallbackExecutor, Executors, PriorityExecutor};
use crate::resource::{EngineResource, Resource, ResourceListener};
use crate::types::DataSource;

/// Notified when an [`EngineJob`] no longer accepts new callbacks.
pub(crate) trait EngineJobListener: Send + Sync {
    /// `resource` is `None` if the job failed.
    fn on_engine_job_complete(&self, job: &EngineJob, resource: Option<&EngineResource>);

    fn on_engine_job_cancelled(&self, job: &EngineJob);
}

enum JobState {
    Running,
    Succeeded {
        resource: EngineResource,
        data_source: DataSource,
        is_alternate_cache_key: bool,
    },
    Failed(Arc<LoadError>),
    Cancelled,
}

impl JobState {
    fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }

    fn name(&self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Succeeded { .. } => "succeeded",
            JobState::Failed(_) => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

struct CallbackEntry {
    id: u64,
    callback: Arc<dyn ResourceCallback>,
    executor: Arc<dyn CallbackExecutor>,
}

struct State {
    state: JobState,
    callbacks: Vec<CallbackEntry>,
    next_id: u64,
    /// Callbacks dispatched but not yet called.
    ///
    /// Until it drops to zero, a succeeded job holds one acquire on its resource so it cannot
    /// be recycled before every callback got the chance to acquire it.
    pending: usize,
}

/// Fans out the outcome of one [`DecodeJob`] to every caller that asked for the same
/// [`EngineKey`].
pub struct EngineJob {
    key: EngineKey,
    request: Arc<LoadRequest>,
    token: CancellationToken,
    executors: Arc<Executors>,
    listener: Weak<dyn EngineJobListener>,
    resource_listener: Weak<dyn ResourceListener>,
    this: Weak<EngineJob>,
    state: Mutex<State>,
}

impl EngineJob {
    pub(crate) fn new(
        key: EngineKey,
        request: Arc<LoadRequest>,
        executors: Arc<Executors>,
        listener: Weak<dyn EngineJobListener>,
        resource_listener: Weak<dyn ResourceListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            key,
            request,
            token: CancellationToken::new(),
            executors,
            listener,
            resource_listener,
            this: this.clone(),
            state: Mutex::new(State {
                state: JobState::Running,
                callbacks: Vec::new(),
                next_id: 0,
                pending: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &EngineKey {
        &self.key
    }

    pub fn request(&self) -> &LoadRequest {
        &self.request
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.lock().state, JobState::Cancelled)
    }

    /// Schedules the decode job on the executor matching its first stage.
    pub(crate) fn start(&self, context: DecodeContext) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let callback: Arc<dyn DecodeCallback> = this;
        let job = DecodeJob::new(
            Arc::clone(&self.request),
            context,
            callback,
            self.token.clone(),
        );
        let executor = if job.will_decode_from_cache() {
            &self.executors.disk_cache
        } else {
            self.source_executor()
        };
        self.submit(executor, job);
    }

    fn source_executor(&self) -> &PriorityExecutor {
        if self.request.is_use_animation_pool() {
            &self.executors.animation
        } else {
            &self.executors.source
        }
    }

    /// Schedules `job`, failing this engine job if the executor never runs it.
    fn submit(&self, executor: &PriorityExecutor, job: DecodeJob) {
        let key = self.key.clone();
        let this = self.this.clone();
        executor.execute_or_reject(
            self.request.priority_level(),
            move || {
                let outcome = block_on(job.run());
                tracing::trace!(%key, ?outcome, "decode job returned");
            },
            move |error| {
                if let Some(this) = this.upgrade() {
                    this.reject(error);
                }
            },
        );
    }

    fn reject(&self, error: ExecutorError) {
        tracing::warn!(
            key = %self.key,
            error = &error as &dyn std::error::Error,
            "failed to schedule decode job"
        );
        metric!(counter("engine.job.rejected") += 1);
        let error = LoadError::with_kind(LoadErrorKind::Rejected, "Failed to schedule load")
            .with_cause(anyhow::Error::new(error));
        DecodeCallback::on_load_failed(self, error);
    }

    /// Registers a callback, returning an id to remove it again.
    ///
    /// Returns `None` if the job can no longer deliver to new callbacks, because it was
    /// cancelled or because its resource was already handed back to the engine.
    pub(crate) fn add_callback(
        &self,
        callback: Arc<dyn ResourceCallback>,
        executor: Arc<dyn CallbackExecutor>,
    ) -> Option<u64> {
        let mut state = self.lock();
        let id = state.next_id;
        match &state.state {
            JobState::Cancelled => return None,
            JobState::Succeeded { .. } if state.pending == 0 => return None,
            JobState::Running => {}
            JobState::Succeeded { .. } | JobState::Failed(_) => state.pending += 1,
        }
        state.next_id += 1;
        state.callbacks.push(CallbackEntry {
            id,
            callback,
            executor: Arc::clone(&executor),
        });
        let dispatch = state.state.is_terminal();
        drop(state);

        if dispatch {
            self.dispatch(id, &*executor);
        }
        Some(id)
    }

    /// Removes a callback, cancelling the job once nobody is waiting for it anymore.
    pub(crate) fn remove_callback(&self, id: u64) {
        let cancelled = {
            let mut state = self.lock();
            state.callbacks.retain(|entry| entry.id != id);
            if state.callbacks.is_empty() && !state.state.is_terminal() {
                state.state = JobState::Cancelled;
                true
            } else {
                false
            }
        };

        if cancelled {
            tracing::debug!(key = %self.key, "cancelling engine job");
            metric!(counter("engine.job.cancelled") += 1);
            self.token.cancel();
            if let Some(listener) = self.listener.upgrade() {
                listener.on_engine_job_cancelled(self);
            }
        }
    }

    /// Moves into a terminal state and dispatches every registered callback.
    ///
    /// Returns `false` if the job already was in a terminal state.
    fn complete(&self, terminal: JobState) -> bool {
        let (entries, resource) = {
            let mut state = self.lock();
            match state.state {
                JobState::Running => {}
                JobState::Cancelled => {
                    tracing::debug!(
                        key = %self.key,
                        "ignoring completion of cancelled engine job"
                    );
                    return false;
                }
                _ => {
                    tracing::warn!(
                        key = %self.key,
                        state = state.state.name(),
                        "ignoring completion of finished engine job"
                    );
                    return false;
                }
            }
            let resource = match &terminal {
                JobState::Succeeded { resource, .. } => Some(resource.clone()),
                _ => None,
            };
            if let Some(resource) = &resource {
                // the hold, released once every callback acquired the resource itself
                if let Err(error) = resource.acquire() {
                    tracing::error!(
                        key = %self.key,
                        error = &error as &dyn std::error::Error,
                        "failed to hold resource"
                    );
                }
            }
            state.state = terminal;
            state.pending = state.callbacks.len();
            let entries = state
                .callbacks
                .iter()
                .map(|entry| (entry.id, Arc::clone(&entry.executor)))
                .collect::<Vec<_>>();
            (entries, resource)
        };

        if let Some(listener) = self.listener.upgrade() {
            listener.on_engine_job_complete(self, resource.as_ref());
        }

        if entries.is_empty() {
            if let Some(resource) = &resource {
                self.release_hold(resource);
            }
        }
        for (id, executor) in entries {
            self.dispatch(id, &*executor);
        }
        true
    }

    fn dispatch(&self, id: u64, executor: &dyn CallbackExecutor) {
        match self.this.upgrade() {
            Some(this) => executor.dispatch(Box::new(move || this.call_callback(id))),
            None => self.decrement_pending(),
        }
    }

    /// Calls the callback `id` unless it was removed in the meantime.
    ///
    /// The resource is acquired on behalf of the callback before the job gives up its hold, and
    /// before the callback runs.
    fn call_callback(&self, id: u64) {
        enum Call {
            Ready(EngineResource, DataSource, bool),
            Failed(Arc<LoadError>),
        }

        let call = {
            let mut state = self.lock();
            let index = state.callbacks.iter().position(|entry| entry.id == id);
            let entry = index.map(|index| state.callbacks.remove(index));
            let call = match &state.state {
                JobState::Succeeded {
                    resource,
                    data_source,
                    is_alternate_cache_key,
                } => Some(Call::Ready(
                    resource.clone(),
                    *data_source,
                    *is_alternate_cache_key,
                )),
                JobState::Failed(error) => Some(Call::Failed(Arc::clone(error))),
                JobState::Running | JobState::Cancelled => None,
            };
            entry.zip(call)
        };

        match call {
            Some((entry, Call::Ready(resource, data_source, is_alternate_cache_key))) => {
                let acquired = resource.acquire();
                self.decrement_pending();
                match acquired {
                    Ok(()) => entry.callback.on_resource_ready(
                        resource,
                        data_source,
                        is_alternate_cache_key,
                    ),
                    Err(error) => tracing::error!(
                        key = %self.key,
                        error = &error as &dyn std::error::Error,
                        "failed to acquire resource for callback"
                    ),
                }
            }
            Some((entry, Call::Failed(error))) => {
                self.decrement_pending();
                entry.callback.on_load_failed(error);
            }
            None => self.decrement_pending(),
        }
    }

    fn decrement_pending(&self) {
        let release = {
            let mut state = self.lock();
            state.pending = state.pending.saturating_sub(1);
            match &state.state {
                JobState::Succeeded { resource, .. } if state.pending == 0 => {
                    Some(resource.clone())
                }
                _ => None,
            }
        };

        if let Some(resource) = release {
            self.release_hold(&resource);
        }
    }

    fn release_hold(&self, resource: &EngineResource) {
        if let Err(error) = resource.release() {
            tracing::error!(
                key = %self.key,
                error = &error as &dyn std::error::Error,
                "failed to release resource hold"
            );
        }
    }
}

impl DecodeCallback for EngineJob {
    fn on_resource_ready(
        &self,
        resource: Box<dyn Resource>,
        data_source: DataSource,
        is_alternate_cache_key: bool,
    ) {
        let resource = EngineResource::new(
            Arc::from(resource),
            self.key.clone(),
            self.request.is_memory_cacheable(),
            true,
            self.resource_listener.clone(),
        );
        let completed = self.complete(JobState::Succeeded {
            resource: resource.clone(),
            data_source,
            is_alternate_cache_key,
        });
        if !completed {
            if let Err(error) = resource.recycle() {
                tracing::error!(
                    key = %self.key,
                    error = &error as &dyn std::error::Error,
                    "failed to recycle resource"
                );
            }
        }
    }

    fn on_load_failed(&self, error: LoadError) {
        self.complete(JobState::Failed(Arc::new(error)));
    }

    fn reschedule(&self, job: DecodeJob) {
        self.submit(self.source_executor(), job);
    }
}

impl fmt::Debug for EngineJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EngineJob")
            .field("key", &self.key)
            .field("state", &state.state.name())
            .field("callbacks", &state.callbacks.len())
            .field("pending", &state.pending)
            .finish()
    }
}

