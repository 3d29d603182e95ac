use std::any::Any;
use std::sync::{Arc, OnceLock};

use crate::caching::{CacheFile, CacheKey, DiskCache, EngineKey};
use crate::error::{LoadError, LoadErrorKind};
use crate::registry::{
    DataRewinder, Encoder, LoadData, Model, Registry, ResourceEncoder, Transformation,
    Transformations, UnitTransformation,
};
use crate::resource::{Bitmap, BitmapPool};
use crate::types::{DiskCacheStrategy, Options, Priority, SIZE_ORIGINAL, Signature, TypeTag};

use super::DecodeContext;
use super::path::LoadPath;

/// Everything describing what to load and how.
///
/// Two requests with equal [`engine_key`](Self::engine_key)s share their result.
#[derive(Clone, Debug)]
pub struct LoadRequest {
    model: Model,
    signature: Signature,
    width: u32,
    height: u32,
    resource_tag: TypeTag,
    transcode_tag: TypeTag,
    options: Options,
    transformations: Transformations,
    disk_cache_strategy: DiskCacheStrategy,
    priority: Priority,
    only_retrieve_from_cache: bool,
    is_memory_cacheable: bool,
    use_animation_pool: bool,
}

impl LoadRequest {
    /// Loads `model` at its original size as a [`Bitmap`].
    pub fn new(model: Model) -> Self {
        Self {
            model,
            signature: Signature::empty(),
            width: SIZE_ORIGINAL,
            height: SIZE_ORIGINAL,
            resource_tag: TypeTag::of::<Bitmap>(),
            transcode_tag: TypeTag::of::<Bitmap>(),
            options: Options::new(),
            transformations: Transformations::new(),
            disk_cache_strategy: DiskCacheStrategy::default(),
            priority: Priority::default(),
            only_retrieve_from_cache: false,
            is_memory_cacheable: true,
            use_animation_pool: false,
        }
    }

    /// The target size, [`SIZE_ORIGINAL`] keeps the intrinsic size of the image.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    /// Decodes to resources of type `R`, or any registered subtype of it.
    pub fn resource<R: Any + ?Sized>(mut self) -> Self {
        self.resource_tag = TypeTag::of::<R>();
        self
    }

    /// Transcodes the decoded resource to `T`.
    pub fn transcode<T: Any + ?Sized>(mut self) -> Self {
        self.transcode_tag = TypeTag::of::<T>();
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn transformations(mut self, transformations: Transformations) -> Self {
        self.transformations = transformations;
        self
    }

    pub fn disk_cache_strategy(mut self, strategy: DiskCacheStrategy) -> Self {
        self.disk_cache_strategy = strategy;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Fails instead of fetching from the source if nothing is cached.
    pub fn only_retrieve_from_cache(mut self, only_retrieve_from_cache: bool) -> Self {
        self.only_retrieve_from_cache = only_retrieve_from_cache;
        self
    }

    /// Bypasses the in-memory caches, both for lookups and for storing the result.
    pub fn skip_memory_cache(mut self, skip: bool) -> Self {
        self.is_memory_cacheable = !skip;
        self
    }

    /// Runs source loads on the animation executor.
    pub fn use_animation_pool(mut self, use_animation_pool: bool) -> Self {
        self.use_animation_pool = use_animation_pool;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn resource_tag(&self) -> TypeTag {
        self.resource_tag
    }

    pub fn transcode_tag(&self) -> TypeTag {
        self.transcode_tag
    }

    pub fn priority_level(&self) -> Priority {
        self.priority
    }

    pub fn is_memory_cacheable(&self) -> bool {
        self.is_memory_cacheable
    }

    pub fn is_only_retrieve_from_cache(&self) -> bool {
        self.only_retrieve_from_cache
    }

    pub fn is_use_animation_pool(&self) -> bool {
        self.use_animation_pool
    }

    pub fn strategy(&self) -> DiskCacheStrategy {
        self.disk_cache_strategy
    }

    /// The in-memory identity of the result of this request.
    pub fn engine_key(&self) -> EngineKey {
        EngineKey::new(
            &self.model.cache_key(),
            &self.signature,
            self.width,
            self.height,
            &self.transformations.key_parts(),
            self.resource_tag,
            self.transcode_tag,
            &self.options,
        )
    }
}

/// Resolves the components a [`DecodeJob`](super::DecodeJob) needs for its request.
pub(crate) struct DecodeHelper {
    pub request: Arc<LoadRequest>,
    pub registry: Arc<Registry>,
    pub disk_cache: Arc<dyn DiskCache>,
    pub pool: Arc<BitmapPool>,
    load_data: OnceLock<Arc<Vec<LoadData>>>,
    cache_keys: OnceLock<Arc<Vec<CacheKey>>>,
}

impl DecodeHelper {
    pub fn new(request: Arc<LoadRequest>, context: DecodeContext) -> Self {
        let DecodeContext {
            registry,
            disk_cache,
            pool,
        } = context;
        Self {
            request,
            registry,
            disk_cache,
            pool,
            load_data: OnceLock::new(),
            cache_keys: OnceLock::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.request.options
    }

    pub fn signature(&self) -> &Signature {
        &self.request.signature
    }

    fn build_load_data(&self, model: &Model) -> Vec<LoadData> {
        let request = &self.request;
        self.registry
            .model_loaders(model)
            .iter()
            .filter_map(|loader| {
                loader.build_load_data(model, request.width, request.height, &request.options)
            })
            .collect()
    }

    /// The candidate ways of fetching the model, built once.
    pub fn load_data(&self) -> Arc<Vec<LoadData>> {
        let load_data = self
            .load_data
            .get_or_init(|| Arc::new(self.build_load_data(&self.request.model)));
        Arc::clone(load_data)
    }

    /// Ways of reading a disk cache entry.
    pub fn cache_file_load_data(&self, file: CacheFile) -> Vec<LoadData> {
        self.build_load_data(&Model::new(file))
    }

    /// The source and alternate keys of all candidates, without duplicates.
    pub fn cache_keys(&self) -> Arc<Vec<CacheKey>> {
        let keys = self.cache_keys.get_or_init(|| {
            let mut keys: Vec<CacheKey> = Vec::new();
            for load_data in self.load_data().iter() {
                let candidates =
                    std::iter::once(&load_data.source_key).chain(&load_data.alternate_keys);
                for key in candidates {
                    if !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
            }
            Arc::new(keys)
        });
        Arc::clone(keys)
    }

    pub fn is_source_key(&self, key: &CacheKey) -> bool {
        self.load_data()
            .iter()
            .any(|load_data| load_data.source_key == *key)
    }

    pub fn registered_resource_tags(&self) -> Vec<TypeTag> {
        self.registry.registered_resource_tags(
            self.request.model.tag(),
            self.request.resource_tag,
            self.request.transcode_tag,
        )
    }

    pub fn load_path(&self, data_tag: TypeTag) -> Option<Arc<LoadPath>> {
        self.registry.load_path(
            data_tag,
            self.request.resource_tag,
            self.request.transcode_tag,
        )
    }

    pub fn has_load_path(&self, data_tag: TypeTag) -> bool {
        self.load_path(data_tag).is_some()
    }

    /// The transformation for resources of type `tag`.
    ///
    /// Falls back to the [`UnitTransformation`], unless transformations are required and
    /// none were given at all.
    pub fn transformation(&self, tag: TypeTag) -> Result<Arc<dyn Transformation>, LoadError> {
        let transformations = &self.request.transformations;
        if let Some(transformation) = transformations.get(tag, &self.registry) {
            return Ok(transformation);
        }
        if transformations.is_empty() && transformations.is_required() {
            return Err(LoadError::with_kind(
                LoadErrorKind::MissingTransformation,
                format!("Missing transformation for {tag}"),
            ));
        }
        Ok(Arc::new(UnitTransformation))
    }

    pub fn is_scale_only_or_no_transform(&self) -> bool {
        self.request.transformations.is_scale_only_or_none()
    }

    pub fn source_encoder(&self, data_tag: TypeTag) -> Result<Arc<dyn Encoder>, LoadError> {
        self.registry.source_encoder(data_tag).ok_or_else(|| {
            LoadError::with_kind(
                LoadErrorKind::NoSourceEncoderAvailable,
                format!("Failed to find source encoder for data class: {data_tag}"),
            )
        })
    }

    pub fn result_encoder(&self, resource_tag: TypeTag) -> Option<Arc<dyn ResourceEncoder>> {
        self.registry.result_encoder(resource_tag)
    }

    pub fn rewinder(&self, data_tag: TypeTag) -> Arc<dyn DataRewinder> {
        self.registry.rewinder(data_tag)
    }
}
