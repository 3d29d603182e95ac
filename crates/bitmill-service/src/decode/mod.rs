//! The decode pipeline of a single load.
//!
//! A [`DecodeJob`] tries, strictly in this order and stopping at the first success:
//!
//! 1. the transformed resource from the disk cache,
//! 2. the unmodified source data from the disk cache,
//! 3. every [`LoadData`](crate::registry::LoadData) candidate of the model, fetched from its
//!    source.
//!
//! Errors of individual attempts are collected, and reported together once nothing is left to
//! try. Cancellation is checked at every suspension point and is never reported as an error.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::caching::{CacheKey, DiskCache};
use crate::error::{Cause, LoadError, LoadErrorKind};
use crate::registry::{Data, DataCallback, DataFetcher, LoadData, Registry};
use crate::resource::{BitmapPool, LockedResource, Resource};
use crate::types::{DataSource, EncodeStrategy, Options};
use crate::utils::futures::cancellable;

mod encode;
mod helper;
mod path;

use encode::DeferredEncode;
use helper::DecodeHelper;

pub use helper::LoadRequest;
pub use path::{DecodePath, DecodedCallback, LoadPath};

/// The shared components every [`DecodeJob`] works with.
#[derive(Clone)]
pub struct DecodeContext {
    pub registry: Arc<Registry>,
    pub disk_cache: Arc<dyn DiskCache>,
    pub pool: Arc<BitmapPool>,
}

impl fmt::Debug for DecodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeContext")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Receives the outcome of a [`DecodeJob`].
///
/// A job calls at most one of [`on_resource_ready`](Self::on_resource_ready) and
/// [`on_load_failed`](Self::on_load_failed), exactly once, and neither of them if it was
/// cancelled.
pub trait DecodeCallback: Send + Sync {
    fn on_resource_ready(
        &self,
        resource: Box<dyn Resource>,
        data_source: DataSource,
        is_alternate_cache_key: bool,
    );

    fn on_load_failed(&self, error: LoadError);

    /// Asks for `job` to be continued on the source executor.
    fn reschedule(&self, job: DecodeJob);
}

/// How a call to [`DecodeJob::run`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    Complete(DataSource),
    Failed,
    Cancelled,
    /// The job was handed to [`DecodeCallback::reschedule`].
    Rescheduled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Initialize,
    ResourceCache,
    DataCache,
    Source,
    Finished,
}

struct Decoded {
    resource: Box<dyn Resource>,
    data_source: DataSource,
    is_alternate_cache_key: bool,
    encode: Option<DeferredEncode>,
}

enum Attempt {
    Decoded(Decoded),
    /// Nothing (more) to try in the current stage.
    Exhausted,
    Cancelled,
    /// Ends the job right away.
    Fatal(LoadError),
}

/// One attempt to load a [`LoadRequest`].
pub struct DecodeJob {
    helper: DecodeHelper,
    callback: Arc<dyn DecodeCallback>,
    token: CancellationToken,
    stage: Stage,
    errors: Vec<Cause>,
    started: Instant,
}

impl DecodeJob {
    pub fn new(
        request: Arc<LoadRequest>,
        context: DecodeContext,
        callback: Arc<dyn DecodeCallback>,
        token: CancellationToken,
    ) -> Self {
        Self {
            helper: DecodeHelper::new(request, context),
            callback,
            token,
            stage: Stage::Initialize,
            errors: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn request(&self) -> &LoadRequest {
        &self.helper.request
    }

    /// Whether the job starts by looking at the disk cache, and should thus be started on the
    /// disk cache executor.
    pub fn will_decode_from_cache(&self) -> bool {
        matches!(
            self.next_stage(Stage::Initialize),
            Stage::ResourceCache | Stage::DataCache
        )
    }

    fn next_stage(&self, current: Stage) -> Stage {
        let request = &*self.helper.request;
        let strategy = request.strategy();
        match current {
            Stage::Initialize if strategy.decode_cached_resource() => Stage::ResourceCache,
            Stage::Initialize => self.next_stage(Stage::ResourceCache),
            Stage::ResourceCache if strategy.decode_cached_data() => Stage::DataCache,
            Stage::ResourceCache => self.next_stage(Stage::DataCache),
            Stage::DataCache if request.is_only_retrieve_from_cache() => Stage::Finished,
            Stage::DataCache => Stage::Source,
            Stage::Source | Stage::Finished => Stage::Finished,
        }
    }

    /// Runs the job until it completes, fails, is cancelled or needs to switch executors.
    pub async fn run(mut self) -> DecodeOutcome {
        loop {
            if self.token.is_cancelled() {
                tracing::debug!(model = %self.request().model().key(), "decode job cancelled");
                return DecodeOutcome::Cancelled;
            }

            let attempt = match self.stage {
                Stage::Initialize => {
                    self.stage = self.next_stage(Stage::Initialize);
                    continue;
                }
                Stage::ResourceCache => self.run_resource_cache().await,
                Stage::DataCache => self.run_data_cache().await,
                Stage::Source => self.run_source().await,
                Stage::Finished => {
                    let error = LoadError::aggregate(std::mem::take(&mut self.errors));
                    return self.notify_failed(error);
                }
            };

            match attempt {
                Attempt::Decoded(decoded) => return self.notify_complete(decoded),
                Attempt::Cancelled => return DecodeOutcome::Cancelled,
                Attempt::Fatal(error) => {
                    let error = error.with_causes(std::mem::take(&mut self.errors));
                    return self.notify_failed(error);
                }
                Attempt::Exhausted => {
                    let next = self.next_stage(self.stage);
                    let from_cache = self.stage != Stage::Source;
                    self.stage = next;
                    if next == Stage::Source && from_cache {
                        tracing::trace!(
                            model = %self.request().model().key(),
                            "switching to the source executor"
                        );
                        let callback = Arc::clone(&self.callback);
                        callback.reschedule(self);
                        return DecodeOutcome::Rescheduled;
                    }
                }
            }
        }
    }

    fn notify_complete(self, decoded: Decoded) -> DecodeOutcome {
        let Decoded {
            resource,
            data_source,
            is_alternate_cache_key,
            encode,
        } = decoded;

        if self.token.is_cancelled() {
            // dropping the deferred encode unlocks the resource first
            drop(encode);
            resource.recycle();
            return DecodeOutcome::Cancelled;
        }

        tracing::debug!(
            model = %self.request().model().key(),
            %data_source,
            elapsed = ?self.started.elapsed(),
            "decoded resource"
        );
        metric!(timer("decode.duration") = self.started.elapsed(), "data_source" => data_source.as_str());
        metric!(histogram("decode.resource.size") = resource.size(), "data_source" => data_source.as_str());

        self.callback
            .on_resource_ready(resource, data_source, is_alternate_cache_key);
        if let Some(encode) = encode {
            tracing::trace!(key = %encode.key(), "writing resource to the disk cache");
            encode.encode(&*self.helper.disk_cache, self.helper.options());
        }
        DecodeOutcome::Complete(data_source)
    }

    fn notify_failed(self, error: LoadError) -> DecodeOutcome {
        if self.token.is_cancelled() {
            return DecodeOutcome::Cancelled;
        }
        tracing::debug!(
            model = %self.request().model().key(),
            error = &error as &dyn std::error::Error,
            "failed to load resource"
        );
        metric!(counter("decode.failed") += 1);
        self.callback.on_load_failed(error);
        DecodeOutcome::Failed
    }

    async fn run_resource_cache(&mut self) -> Attempt {
        let source_keys = self.helper.cache_keys();
        if source_keys.is_empty() {
            return Attempt::Exhausted;
        }

        let resource_tags = self.helper.registered_resource_tags();
        if resource_tags.is_empty() {
            let request = self.request();
            return Attempt::Fatal(LoadError::new(format!(
                "Failed to find any load path from {} to {}",
                request.model().tag(),
                request.transcode_tag()
            )));
        }

        for source_key in source_keys.iter() {
            for &resource_tag in &resource_tags {
                let transformation = match self.helper.transformation(resource_tag) {
                    Ok(transformation) => transformation,
                    Err(error) => return Attempt::Fatal(error),
                };
                let request = &*self.helper.request;
                let key = CacheKey::resource(
                    source_key,
                    self.helper.signature(),
                    request.width(),
                    request.height(),
                    Some(transformation.id().as_ref()),
                    resource_tag,
                    self.helper.options(),
                );
                let Some(snapshot) = self.helper.disk_cache.get(&key) else {
                    continue;
                };

                let candidates = self.helper.cache_file_load_data(snapshot.into_file());
                let attempt = self
                    .load_candidates(candidates, &key, source_key, DataSource::ResourceDiskCache)
                    .await;
                if !matches!(attempt, Attempt::Exhausted) {
                    return attempt;
                }
            }
        }
        Attempt::Exhausted
    }

    async fn run_data_cache(&mut self) -> Attempt {
        let source_keys = self.helper.cache_keys();
        for source_key in source_keys.iter() {
            let key = CacheKey::data(source_key, self.helper.signature());
            let Some(snapshot) = self.helper.disk_cache.get(&key) else {
                continue;
            };

            let candidates = self.helper.cache_file_load_data(snapshot.into_file());
            let attempt = self
                .load_candidates(candidates, &key, source_key, DataSource::DataDiskCache)
                .await;
            if !matches!(attempt, Attempt::Exhausted) {
                return attempt;
            }
        }
        Attempt::Exhausted
    }

    async fn run_source(&mut self) -> Attempt {
        let strategy = self.request().strategy();
        let candidates = self.helper.load_data();
        for load_data in candidates.iter() {
            let fetcher = &*load_data.fetcher;
            let is_data_cacheable = strategy.is_data_cacheable(fetcher.data_source());
            if !is_data_cacheable && !self.helper.has_load_path(fetcher.data_tag()) {
                continue;
            }

            let data = match self.fetch(fetcher, &load_data.source_key).await {
                Ok(data) => data,
                Err(attempt) => return attempt,
            };
            let attempt = match data {
                Some(data) if is_data_cacheable => self.cache_and_decode(data, load_data).await,
                Some(mut data) => self.decode(
                    &mut data,
                    fetcher.data_source(),
                    &load_data.source_key,
                    &load_data.source_key,
                ),
                None => Attempt::Exhausted,
            };
            fetcher.cleanup();
            if !matches!(attempt, Attempt::Exhausted) {
                return attempt;
            }
        }
        Attempt::Exhausted
    }

    /// Writes freshly fetched data to the disk cache and decodes it from there.
    ///
    /// Falls back to decoding the in-memory data if it could not be written.
    async fn cache_and_decode(&mut self, mut data: Data, load_data: &LoadData) -> Attempt {
        let source_key = &load_data.source_key;
        let data_source = load_data.fetcher.data_source();
        let encoder = match self.helper.source_encoder(data.tag()) {
            Ok(encoder) => encoder,
            Err(error) => return Attempt::Fatal(error),
        };

        let key = CacheKey::data(source_key, self.helper.signature());
        let rewinder = self.helper.rewinder(data.tag());
        let snapshot = encode::cache_source_data(
            &*self.helper.disk_cache,
            &key,
            &*encoder,
            &*rewinder,
            &mut data,
            self.helper.options(),
        );

        if let Some(snapshot) = snapshot {
            let candidates = self.helper.cache_file_load_data(snapshot.into_file());
            if !candidates.is_empty() {
                return self
                    .load_candidates(candidates, &key, source_key, data_source)
                    .await;
            }
        }
        self.decode(&mut data, data_source, source_key, &key)
    }

    /// Fetches and decodes disk cache entries, reporting them as coming from `data_source`.
    async fn load_candidates(
        &mut self,
        candidates: Vec<LoadData>,
        key: &CacheKey,
        source_key: &CacheKey,
        data_source: DataSource,
    ) -> Attempt {
        for load_data in candidates {
            let fetcher = &*load_data.fetcher;
            if !self.helper.has_load_path(fetcher.data_tag()) {
                continue;
            }

            let attempt = match self.fetch(fetcher, key).await {
                Ok(Some(mut data)) => self.decode(&mut data, data_source, source_key, key),
                Ok(None) => Attempt::Exhausted,
                Err(attempt) => return attempt,
            };
            fetcher.cleanup();
            if !matches!(attempt, Attempt::Exhausted) {
                return attempt;
            }
        }
        Attempt::Exhausted
    }

    /// Waits for `fetcher` to load its data.
    ///
    /// Fetch errors are recorded and result in `Ok(None)`. Cancellation cancels the fetcher.
    async fn fetch(
        &mut self,
        fetcher: &dyn DataFetcher,
        key: &CacheKey,
    ) -> Result<Option<Data>, Attempt> {
        let (callback, receiver) = DataCallback::channel();
        fetcher.load_data(self.request().priority_level(), callback);

        let result = match cancellable(&self.token, receiver).await {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(anyhow::anyhow!("the data fetcher dropped its callback")),
            None => {
                fetcher.cancel();
                fetcher.cleanup();
                return Err(Attempt::Cancelled);
            }
        };

        match result {
            Ok(data) => Ok(Some(data)),
            Err(error) => {
                tracing::trace!(%key, error = %format!("{error:#}"), "fetching data failed");
                metric!(counter("decode.fetch_failed") += 1, "data_source" => fetcher.data_source().as_str());
                let mut error = LoadError::fetch_failed(error);
                error.set_logging_details(
                    key.clone(),
                    fetcher.data_source(),
                    Some(fetcher.data_tag()),
                );
                self.errors.push(error.into());
                Ok(None)
            }
        }
    }

    /// Decodes `data` through the load path of its runtime type.
    fn decode(
        &mut self,
        data: &mut Data,
        data_source: DataSource,
        source_key: &CacheKey,
        key: &CacheKey,
    ) -> Attempt {
        match self.decode_from_data(data, data_source, source_key) {
            Ok(decoded) => Attempt::Decoded(decoded),
            Err(error) if error.is_fatal() => Attempt::Fatal(error),
            Err(mut error) => {
                error.set_logging_details(key.clone(), data_source, Some(data.tag()));
                self.errors.push(error.into());
                Attempt::Exhausted
            }
        }
    }

    fn decode_from_data(
        &self,
        data: &mut Data,
        data_source: DataSource,
        source_key: &CacheKey,
    ) -> Result<Decoded, LoadError> {
        let data_tag = data.tag();
        let load_path = self
            .helper
            .load_path(data_tag)
            .ok_or_else(|| LoadError::new(format!("Failed to find a load path for {data_tag}")))?;
        let options = self.options_with_hardware_config(data_source);
        let rewinder = self.helper.rewinder(data_tag);
        let request = &*self.helper.request;

        let mut encode = None;
        let resource = load_path.load(
            &*rewinder,
            data,
            request.width(),
            request.height(),
            &options,
            &mut |decoded| self.on_resource_decoded(data_source, source_key, decoded, &mut encode),
        )?;

        let is_alternate_cache_key = self
            .helper
            .cache_keys()
            .first()
            .is_some_and(|first| first != source_key);
        Ok(Decoded {
            resource,
            data_source,
            is_alternate_cache_key,
            encode,
        })
    }

    /// Transforms a decoded resource, and prepares writing it to the disk cache.
    fn on_resource_decoded(
        &self,
        data_source: DataSource,
        source_key: &CacheKey,
        decoded: Box<dyn Resource>,
        encode: &mut Option<DeferredEncode>,
    ) -> Result<Box<dyn Resource>, LoadError> {
        let request = &*self.helper.request;
        let resource_tag = decoded.tag();

        let (transformed, transformation_id) = if data_source == DataSource::ResourceDiskCache {
            (decoded, None)
        } else {
            let transformation = match self.helper.transformation(resource_tag) {
                Ok(transformation) => transformation,
                Err(error) => {
                    decoded.recycle();
                    return Err(error);
                }
            };
            let transformed = transformation
                .transform(&self.helper.pool, decoded, request.width(), request.height())
                .map_err(|error| {
                    LoadError::new(format!("Failed to apply {} transformation", transformation.id()))
                        .with_cause(error)
                })?;
            (transformed, Some(transformation.id()))
        };

        let encoder = self.helper.result_encoder(transformed.tag());
        let encode_strategy = encoder
            .as_ref()
            .map_or(EncodeStrategy::None, |encoder| {
                encoder.encode_strategy(self.helper.options())
            });

        let is_from_alternate_cache_key = !self.helper.is_source_key(source_key);
        if !request.strategy().is_resource_cacheable(
            is_from_alternate_cache_key,
            data_source,
            encode_strategy,
        ) {
            return Ok(transformed);
        }

        let Some(encoder) = encoder else {
            return Err(LoadError::with_kind(
                LoadErrorKind::NoResultEncoderAvailable,
                format!(
                    "Failed to find result encoder for resource class: {}",
                    transformed.tag()
                ),
            ));
        };

        let key = match encode_strategy {
            EncodeStrategy::Source => CacheKey::data(source_key, self.helper.signature()),
            EncodeStrategy::Transformed => CacheKey::resource(
                source_key,
                self.helper.signature(),
                request.width(),
                request.height(),
                transformation_id.as_deref(),
                resource_tag,
                self.helper.options(),
            ),
            EncodeStrategy::None => return Ok(transformed),
        };

        let locked = LockedResource::lock(Arc::from(transformed));
        *encode = Some(DeferredEncode::new(key, encoder, Arc::clone(&locked)));
        Ok(Box::new(locked))
    }

    /// Allows hardware bitmaps only if the result is never transformed by anything but
    /// scaling, or comes from the resource cache.
    ///
    /// An explicit `false` is kept. Otherwise the option is set to whether hardware bitmaps
    /// are safe for this decode.
    fn options_with_hardware_config(&self, data_source: DataSource) -> Cow<'_, Options> {
        let options = self.helper.options();
        let is_hardware_safe = data_source == DataSource::ResourceDiskCache
            || self.helper.is_scale_only_or_no_transform();

        match options.get_bool(Options::ALLOW_HARDWARE_CONFIG) {
            Some(is_allowed) if !is_allowed || is_hardware_safe => Cow::Borrowed(options),
            _ => Cow::Owned(
                options
                    .clone()
                    .with(Options::ALLOW_HARDWARE_CONFIG, is_hardware_safe),
            ),
        }
    }
}

impl fmt::Debug for DecodeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeJob")
            .field("model", self.request().model())
            .field("stage", &self.stage)
            .field("errors", &self.errors.len())
            .finish()
    }
}
