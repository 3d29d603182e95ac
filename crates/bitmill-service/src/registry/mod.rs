//! Type based lookup of the components that load, decode, transcode and encode resources.
//!
//! Every stage of a load is resolved by the runtime [`TypeTag`] of its input and output:
//! a [`Model`] is turned into [`Data`] by a [`ModelLoader`], the data is decoded into a
//! resource by a [`ResourceDecoder`], and the resource is converted into the requested type
//! by a [`ResourceTranscoder`]. Supertype relations registered with
//! [`Registry::register_supertype`] make components registered for a supertype apply to its
//! subtypes as well.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::caching::CacheFile;
use crate::decode::{DecodePath, LoadPath};
use crate::resource::{Bitmap, BitmapPool};
use crate::types::TypeTag;

mod codec;
mod data;
mod model;
mod transformation;

pub use codec::{
    BitmapBytesTranscoder, BitmapDecoder, BitmapEncoder, Encoder, ResourceDecoder,
    ResourceEncoder, ResourceTranscoder, StreamBitmapDecoder, StreamEncoder, UnitTranscoder,
};
pub use data::{
    ByteStream, ByteStreamRewinder, Data, DataCallback, DataFetcher, DataRewinder, FetchResult,
    NoopRewinder,
};
pub use model::{
    BytesLoader, CacheFileLoader, FileLoader, LoadData, Model, ModelKey, ModelLoader,
};
pub use transformation::{
    CenterCrop, FitCenter, Resize, Transformation, Transformations, UnitTransformation,
};

struct ModelLoaderEntry {
    model: TypeTag,
    data: TypeTag,
    loader: Arc<dyn ModelLoader>,
}

struct DecoderEntry {
    data: TypeTag,
    resource: TypeTag,
    decoder: Arc<dyn ResourceDecoder>,
}

struct TranscoderEntry {
    from: TypeTag,
    to: TypeTag,
    transcoder: Arc<dyn ResourceTranscoder>,
}

type LoadPathKey = (TypeTag, TypeTag, TypeTag);

/// The components available to the engine.
///
/// Built once before the [`Engine`](crate::engine::Engine) is created. Lookups are resolved
/// in registration order, prepended components win over appended ones.
#[derive(Default)]
pub struct Registry {
    model_loaders: Vec<ModelLoaderEntry>,
    decoders: Vec<DecoderEntry>,
    transcoders: Vec<TranscoderEntry>,
    encoders: Vec<(TypeTag, Arc<dyn Encoder>)>,
    resource_encoders: Vec<(TypeTag, Arc<dyn ResourceEncoder>)>,
    rewinders: HashMap<TypeTag, Arc<dyn DataRewinder>>,
    supertypes: HashMap<TypeTag, Vec<TypeTag>>,
    load_paths: Mutex<HashMap<LoadPathKey, Option<Arc<LoadPath>>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in components for local files and in-memory bytes,
    /// decoding to [`Bitmap`]s and encoding them as PNG.
    pub fn with_defaults(pool: Arc<BitmapPool>) -> Self {
        let mut registry = Self::new();
        registry
            .append_model_loader::<PathBuf, Bytes>(FileLoader)
            .append_model_loader::<Bytes, Bytes>(BytesLoader)
            .append_model_loader::<CacheFile, Bytes>(CacheFileLoader)
            .append_decoder::<Bytes, Bitmap>(BitmapDecoder::new(Arc::clone(&pool)))
            .append_decoder::<ByteStream, Bitmap>(StreamBitmapDecoder::new(pool))
            .register_transcoder::<Bitmap, Bytes>(BitmapBytesTranscoder)
            .append_encoder::<Bytes>(StreamEncoder)
            .append_encoder::<ByteStream>(StreamEncoder)
            .append_resource_encoder::<Bitmap>(BitmapEncoder)
            .register_rewinder::<ByteStream>(ByteStreamRewinder);
        registry
    }

    fn invalidate(&mut self) {
        self.load_paths
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn append_model_loader<M: Any, D: Any>(
        &mut self,
        loader: impl ModelLoader + 'static,
    ) -> &mut Self {
        self.model_loaders.push(ModelLoaderEntry {
            model: TypeTag::of::<M>(),
            data: TypeTag::of::<D>(),
            loader: Arc::new(loader),
        });
        self
    }

    pub fn prepend_model_loader<M: Any, D: Any>(
        &mut self,
        loader: impl ModelLoader + 'static,
    ) -> &mut Self {
        self.model_loaders.insert(
            0,
            ModelLoaderEntry {
                model: TypeTag::of::<M>(),
                data: TypeTag::of::<D>(),
                loader: Arc::new(loader),
            },
        );
        self
    }

    pub fn append_decoder<D: Any, R: Any>(
        &mut self,
        decoder: impl ResourceDecoder + 'static,
    ) -> &mut Self {
        self.decoders.push(DecoderEntry {
            data: TypeTag::of::<D>(),
            resource: TypeTag::of::<R>(),
            decoder: Arc::new(decoder),
        });
        self.invalidate();
        self
    }

    pub fn prepend_decoder<D: Any, R: Any>(
        &mut self,
        decoder: impl ResourceDecoder + 'static,
    ) -> &mut Self {
        self.decoders.insert(
            0,
            DecoderEntry {
                data: TypeTag::of::<D>(),
                resource: TypeTag::of::<R>(),
                decoder: Arc::new(decoder),
            },
        );
        self.invalidate();
        self
    }

    pub fn register_transcoder<R: Any, T: Any>(
        &mut self,
        transcoder: impl ResourceTranscoder + 'static,
    ) -> &mut Self {
        self.transcoders.push(TranscoderEntry {
            from: TypeTag::of::<R>(),
            to: TypeTag::of::<T>(),
            transcoder: Arc::new(transcoder),
        });
        self.invalidate();
        self
    }

    pub fn append_encoder<D: Any>(&mut self, encoder: impl Encoder + 'static) -> &mut Self {
        self.encoders.push((TypeTag::of::<D>(), Arc::new(encoder)));
        self
    }

    pub fn append_resource_encoder<R: Any>(
        &mut self,
        encoder: impl ResourceEncoder + 'static,
    ) -> &mut Self {
        self.resource_encoders
            .push((TypeTag::of::<R>(), Arc::new(encoder)));
        self
    }

    pub fn register_rewinder<D: Any>(&mut self, rewinder: impl DataRewinder + 'static) -> &mut Self {
        self.rewinders.insert(TypeTag::of::<D>(), Arc::new(rewinder));
        self
    }

    /// Declares that values of type `Sub` may be used wherever `Super` is expected.
    pub fn register_supertype<Sub: Any + ?Sized, Super: Any + ?Sized>(&mut self) -> &mut Self {
        self.supertypes
            .entry(TypeTag::of::<Sub>())
            .or_default()
            .push(TypeTag::of::<Super>());
        self.invalidate();
        self
    }

    /// Whether a value of type `sub` may be used as `sup`, following supertype relations.
    pub fn is_assignable(&self, sub: TypeTag, sup: TypeTag) -> bool {
        let mut pending = vec![sub];
        let mut seen = Vec::new();
        while let Some(tag) = pending.pop() {
            if tag == sup {
                return true;
            }
            if seen.contains(&tag) {
                continue;
            }
            seen.push(tag);
            if let Some(supertypes) = self.supertypes.get(&tag) {
                pending.extend(supertypes.iter().copied());
            }
        }
        false
    }

    /// The model loaders able to load `model`, in priority order.
    pub fn model_loaders(&self, model: &Model) -> Vec<Arc<dyn ModelLoader>> {
        self.model_loaders
            .iter()
            .filter(|entry| self.is_assignable(model.tag(), entry.model))
            .filter(|entry| entry.loader.handles(model))
            .map(|entry| Arc::clone(&entry.loader))
            .collect()
    }

    /// The resource types that loads of `model_tag` may decode to, given the requested
    /// resource and transcode types.
    ///
    /// The requested resource type comes first if it is decodable itself.
    pub fn registered_resource_tags(
        &self,
        model_tag: TypeTag,
        resource_tag: TypeTag,
        transcode_tag: TypeTag,
    ) -> Vec<TypeTag> {
        let mut tags = Vec::new();
        let data_tags = self
            .model_loaders
            .iter()
            .filter(|entry| self.is_assignable(model_tag, entry.model))
            .map(|entry| entry.data);
        for data_tag in data_tags {
            for decoder in &self.decoders {
                if !self.is_assignable(data_tag, decoder.data)
                    || !self.is_assignable(decoder.resource, resource_tag)
                    || tags.contains(&decoder.resource)
                    || self.transcoder(decoder.resource, transcode_tag).is_none()
                {
                    continue;
                }
                tags.push(decoder.resource);
            }
        }
        if let Some(position) = tags.iter().position(|tag| *tag == resource_tag) {
            tags[..=position].rotate_right(1);
        }
        tags
    }

    /// The transcoder converting `from` into `to`, a no-op one if `from` already is a `to`.
    pub fn transcoder(&self, from: TypeTag, to: TypeTag) -> Option<Arc<dyn ResourceTranscoder>> {
        if self.is_assignable(from, to) {
            return Some(Arc::new(UnitTranscoder));
        }
        self.transcoders
            .iter()
            .find(|entry| self.is_assignable(from, entry.from) && entry.to == to)
            .map(|entry| Arc::clone(&entry.transcoder))
    }

    /// All the ways of decoding `data_tag` into `resource_tag` and transcoding the result into
    /// `transcode_tag`.
    ///
    /// Returns `None` if there is no way at all.
    pub fn load_path(
        &self,
        data_tag: TypeTag,
        resource_tag: TypeTag,
        transcode_tag: TypeTag,
    ) -> Option<Arc<LoadPath>> {
        let key = (data_tag, resource_tag, transcode_tag);
        let mut load_paths = self
            .load_paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        load_paths
            .entry(key)
            .or_insert_with(|| self.build_load_path(data_tag, resource_tag, transcode_tag))
            .clone()
    }

    fn build_load_path(
        &self,
        data_tag: TypeTag,
        resource_tag: TypeTag,
        transcode_tag: TypeTag,
    ) -> Option<Arc<LoadPath>> {
        let mut registered: Vec<TypeTag> = Vec::new();
        for decoder in &self.decoders {
            if self.is_assignable(data_tag, decoder.data)
                && self.is_assignable(decoder.resource, resource_tag)
                && !registered.contains(&decoder.resource)
            {
                registered.push(decoder.resource);
            }
        }

        let decode_paths: Vec<_> = registered
            .into_iter()
            .filter_map(|registered_resource| {
                let transcoder = self.transcoder(registered_resource, transcode_tag)?;
                let decoders = self
                    .decoders
                    .iter()
                    .filter(|entry| {
                        self.is_assignable(data_tag, entry.data)
                            && entry.resource == registered_resource
                    })
                    .map(|entry| Arc::clone(&entry.decoder))
                    .collect();
                Some(DecodePath::new(
                    data_tag,
                    registered_resource,
                    transcode_tag,
                    decoders,
                    transcoder,
                ))
            })
            .collect();

        if decode_paths.is_empty() {
            return None;
        }
        Some(Arc::new(LoadPath::new(
            data_tag,
            resource_tag,
            transcode_tag,
            decode_paths,
        )))
    }

    /// The encoder writing data of type `data_tag` to the disk cache.
    pub fn source_encoder(&self, data_tag: TypeTag) -> Option<Arc<dyn Encoder>> {
        self.encoders
            .iter()
            .find(|(tag, _)| self.is_assignable(data_tag, *tag))
            .map(|(_, encoder)| Arc::clone(encoder))
    }

    /// The encoder writing resources of type `resource_tag` to the disk cache.
    pub fn result_encoder(&self, resource_tag: TypeTag) -> Option<Arc<dyn ResourceEncoder>> {
        self.resource_encoders
            .iter()
            .find(|(tag, _)| self.is_assignable(resource_tag, *tag))
            .map(|(_, encoder)| Arc::clone(encoder))
    }

    pub fn is_resource_encoder_available(&self, resource_tag: TypeTag) -> bool {
        self.result_encoder(resource_tag).is_some()
    }

    /// The rewinder for data of type `data_tag`, a no-op one if none is registered.
    pub fn rewinder(&self, data_tag: TypeTag) -> Arc<dyn DataRewinder> {
        if let Some(rewinder) = self.rewinders.get(&data_tag) {
            return Arc::clone(rewinder);
        }
        self.rewinders
            .iter()
            .find(|(tag, _)| self.is_assignable(data_tag, **tag))
            .map(|(_, rewinder)| Arc::clone(rewinder))
            .unwrap_or_else(|| Arc::new(NoopRewinder))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("model_loaders", &self.model_loaders.len())
            .field("decoders", &self.decoders.len())
            .field("transcoders", &self.transcoders.len())
            .field("encoders", &self.encoders.len())
            .field("resource_encoders", &self.resource_encoders.len())
            .finish()
    }
}
