use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use url::Url;

use super::data::{Data, DataCallback, DataFetcher};
use crate::caching::{CacheFile, CacheKey};
use crate::types::{DataSource, Options, Priority, TypeTag};

/// Types that can be loaded, identified by a stable key.
pub trait ModelKey: Any + Send + Sync {
    /// A stable textual identity, equal for models that point to the same data.
    fn key(&self) -> Cow<'_, str>;
}

impl ModelKey for PathBuf {
    fn key(&self) -> Cow<'_, str> {
        self.to_string_lossy()
    }
}

impl ModelKey for Url {
    fn key(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.as_str())
    }
}

impl ModelKey for String {
    fn key(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl ModelKey for Bytes {
    fn key(&self) -> Cow<'_, str> {
        Cow::Owned(format!("sha256:{}", hex::encode(Sha256::digest(self))))
    }
}

impl ModelKey for CacheFile {
    fn key(&self) -> Cow<'_, str> {
        self.path().to_string_lossy()
    }
}

/// The subject of a load request, such as a path, a URL or some bytes.
#[derive(Clone)]
pub struct Model {
    value: Arc<dyn Any + Send + Sync>,
    tag: TypeTag,
    key: Arc<str>,
}

impl Model {
    pub fn new<T: ModelKey>(value: T) -> Self {
        let key = value.key().into();
        Self {
            value: Arc::new(value),
            tag: TypeTag::of::<T>(),
            key,
        }
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The source key of the unmodified data this model points to.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::for_model(self.tag, &self.key)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("tag", &self.tag)
            .field("key", &self.key)
            .finish()
    }
}

/// One way of fetching the data of a model.
pub struct LoadData {
    /// Identifies the fetched data in the disk cache.
    pub source_key: CacheKey,
    /// Other keys the same data might have been cached under.
    pub alternate_keys: Vec<CacheKey>,
    pub fetcher: Box<dyn DataFetcher>,
}

impl LoadData {
    pub fn new(source_key: CacheKey, fetcher: impl DataFetcher + 'static) -> Self {
        Self {
            source_key,
            alternate_keys: Vec::new(),
            fetcher: Box::new(fetcher),
        }
    }

    pub fn with_alternate_keys(mut self, alternate_keys: Vec<CacheKey>) -> Self {
        self.alternate_keys = alternate_keys;
        self
    }
}

impl fmt::Debug for LoadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadData")
            .field("source_key", &self.source_key)
            .field("alternate_keys", &self.alternate_keys)
            .field("data_tag", &self.fetcher.data_tag())
            .finish()
    }
}

/// Translates a model into [`LoadData`].
pub trait ModelLoader: Send + Sync {
    /// Returns `false` for models of the registered type this loader cannot load.
    fn handles(&self, _model: &Model) -> bool {
        true
    }

    fn build_load_data(
        &self,
        model: &Model,
        width: u32,
        height: u32,
        options: &Options,
    ) -> Option<LoadData>;
}

/// Reads local files into [`Bytes`].
#[derive(Debug, Default)]
pub struct FileLoader;

impl ModelLoader for FileLoader {
    fn build_load_data(&self, model: &Model, _: u32, _: u32, _: &Options) -> Option<LoadData> {
        let path = model.downcast_ref::<PathBuf>()?;
        Some(LoadData::new(
            model.cache_key(),
            FileFetcher { path: path.clone() },
        ))
    }
}

struct FileFetcher {
    path: PathBuf,
}

impl DataFetcher for FileFetcher {
    fn load_data(&self, _priority: Priority, callback: DataCallback) {
        match std::fs::read(&self.path) {
            Ok(contents) => callback.on_data_ready(Data::new(Bytes::from(contents))),
            Err(error) => callback.on_load_failed(
                anyhow::Error::new(error).context(format!("reading {}", self.path.display())),
            ),
        }
    }

    fn data_tag(&self) -> TypeTag {
        TypeTag::of::<Bytes>()
    }

    fn data_source(&self) -> DataSource {
        DataSource::Local
    }
}

/// Loads in-memory [`Bytes`] models.
#[derive(Debug, Default)]
pub struct BytesLoader;

impl ModelLoader for BytesLoader {
    fn build_load_data(&self, model: &Model, _: u32, _: u32, _: &Options) -> Option<LoadData> {
        let bytes = model.downcast_ref::<Bytes>()?;
        Some(LoadData::new(
            model.cache_key(),
            BytesFetcher {
                bytes: bytes.clone(),
            },
        ))
    }
}

struct BytesFetcher {
    bytes: Bytes,
}

impl DataFetcher for BytesFetcher {
    fn load_data(&self, _priority: Priority, callback: DataCallback) {
        callback.on_data_ready(Data::new(self.bytes.clone()));
    }

    fn data_tag(&self) -> TypeTag {
        TypeTag::of::<Bytes>()
    }

    fn data_source(&self) -> DataSource {
        DataSource::Local
    }
}

/// Reads entries of the disk cache.
#[derive(Debug, Default)]
pub struct CacheFileLoader;

impl ModelLoader for CacheFileLoader {
    fn build_load_data(&self, model: &Model, _: u32, _: u32, _: &Options) -> Option<LoadData> {
        let file = model.downcast_ref::<CacheFile>()?;
        Some(LoadData::new(
            model.cache_key(),
            CacheFileFetcher { file: file.clone() },
        ))
    }
}

struct CacheFileFetcher {
    file: CacheFile,
}

impl DataFetcher for CacheFileFetcher {
    fn load_data(&self, _priority: Priority, callback: DataCallback) {
        match self.file.read_bytes() {
            Ok(bytes) => callback.on_data_ready(Data::new(bytes)),
            Err(error) => callback.on_load_failed(error.into()),
        }
    }

    fn data_tag(&self) -> TypeTag {
        TypeTag::of::<Bytes>()
    }

    fn data_source(&self) -> DataSource {
        DataSource::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_keys_are_content_derived() {
        let a = Model::new(Bytes::from_static(b"abc"));
        let b = Model::new(Bytes::from(b"abc".to_vec()));
        assert_eq!(a.cache_key(), b.cache_key());

        let path = Model::new(PathBuf::from("abc"));
        let string = Model::new(String::from("abc"));
        // same text, different model types
        assert_ne!(path.cache_key(), string.cache_key());
    }

    #[test]
    fn test_file_loader() {
        let dir = bitmill_test::tempdir();
        let path = dir.path().join("data");
        std::fs::write(&path, b"content").unwrap();

        let model = Model::new(path);
        let load_data = FileLoader
            .build_load_data(&model, 1, 1, &Options::new())
            .unwrap();
        assert_eq!(load_data.source_key, model.cache_key());

        let (callback, receiver) = DataCallback::channel();
        load_data.fetcher.load_data(Priority::Normal, callback);
        let data = futures::executor::block_on(receiver).unwrap().unwrap();
        assert_eq!(data.downcast_ref::<Bytes>().unwrap(), &b"content"[..]);
    }

    #[test]
    fn test_missing_file_fails() {
        let model = Model::new(PathBuf::from("/definitely/not/here.png"));
        let load_data = FileLoader
            .build_load_data(&model, 1, 1, &Options::new())
            .unwrap();
        let (callback, receiver) = DataCallback::channel();
        load_data.fetcher.load_data(Priority::Normal, callback);
        assert!(futures::executor::block_on(receiver).unwrap().is_err());
    }
}
