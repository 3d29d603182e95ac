use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::{Options, Signature, TypeTag};

/// A content derived cache key.
///
/// Two keys are equal when the metadata they were built from is equal. The metadata is
/// hashed with SHA-256, and equality as well as hashing only consider that digest. Keys are
/// thus stable across process restarts and can be used for on-disk entries.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Create a [`CacheKeyBuilder`] that can be used to build a cache key consisting of all its
    /// contributing parts.
    pub fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder {
            metadata: String::new(),
        }
    }

    /// The source key of a model, identifying the unmodified data it points to.
    pub fn for_model(tag: TypeTag, key: &str) -> Self {
        let mut builder = Self::builder();
        builder.write_model(tag, key);
        builder.build()
    }

    /// The key of unmodified source data in the disk cache.
    pub fn data(source: &CacheKey, signature: &Signature) -> Self {
        let mut builder = Self::builder();
        builder.metadata.push_str("data\n");
        builder.write_source(source, signature);
        builder.build()
    }

    /// The key of a decoded and transformed resource in the disk cache.
    #[allow(clippy::too_many_arguments)]
    pub fn resource(
        source: &CacheKey,
        signature: &Signature,
        width: u32,
        height: u32,
        transformation: Option<&str>,
        resource_tag: TypeTag,
        options: &Options,
    ) -> Self {
        let mut builder = Self::builder();
        builder.metadata.push_str("resource\n");
        builder.write_source(source, signature);
        builder.write_size(width, height);
        let _ = writeln!(
            builder,
            "transformation: {}\nresource: {resource_tag}",
            transformation.unwrap_or("<none>")
        );
        builder.write_options(options);
        builder.build()
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The lowercase hex encoded digest, safe to use as a file name.
    pub fn safe_key(&self) -> String {
        hex::encode(self.hash)
    }

    #[cfg(any(test, feature = "test"))]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKeyBuilder {
            metadata: key.into(),
        }
        .build()
    }
}

/// The key of an in-memory resource.
///
/// Covers everything that influences the bits of the final resource, including the
/// transcode target and all options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineKey(CacheKey);

impl EngineKey {
    /// Builds the key of a load request.
    ///
    /// `transformations` are pairs of the resource type name and the transformation id, and
    /// are sorted here so that their registration order does not matter.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: &CacheKey,
        signature: &Signature,
        width: u32,
        height: u32,
        transformations: &[(TypeTag, String)],
        resource_tag: TypeTag,
        transcode_tag: TypeTag,
        options: &Options,
    ) -> Self {
        let mut builder = CacheKey::builder();
        builder.metadata.push_str("engine\n");
        builder.write_source(model, signature);
        builder.write_size(width, height);

        let mut transformations: Vec<_> = transformations
            .iter()
            .map(|(tag, id)| (tag.name(), id.as_str()))
            .collect();
        transformations.sort();
        builder.metadata.push_str("transformations:\n");
        for (tag, id) in transformations {
            let _ = writeln!(builder, "  {tag}: {id}");
        }

        let _ = writeln!(builder, "resource: {resource_tag}\ntranscode: {transcode_tag}");
        builder.write_options(options);
        Self(builder.build())
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.0
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input in then being hashed to form the [`CacheKey`].
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes the type and the stable key of a model.
    pub fn write_model(&mut self, tag: TypeTag, key: &str) {
        let _ = writeln!(self.metadata, "model: {tag}\nkey: {key}");
    }

    fn write_source(&mut self, source: &CacheKey, signature: &Signature) {
        let _ = writeln!(
            self.metadata,
            "source: {}\nsignature: {signature}",
            source.safe_key()
        );
    }

    fn write_size(&mut self, width: u32, height: u32) {
        let _ = writeln!(self.metadata, "width: {width}\nheight: {height}");
    }

    fn write_options(&mut self, options: &Options) {
        let _ = write!(self.metadata, "options:\n{options}");
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.metadata);

        CacheKey {
            metadata: self.metadata.into(),
            hash: hash.into(),
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
