//! Small value types shared by the whole engine.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

mod options;
mod tag;

pub use options::{OptionValue, Options};
pub use tag::TypeTag;

/// Requests the intrinsic width or height of an image instead of a target size.
pub const SIZE_ORIGINAL: u32 = u32::MAX;

/// The relative priority of a request.
///
/// Ordered so that `Immediate > High > Normal > Low`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Immediate,
}

/// Where a piece of data or a resource was retrieved from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataSource {
    /// Data was retrieved from the device, e.g. a file or in-memory bytes.
    Local,
    /// Data was retrieved from somewhere other than the device.
    Remote,
    /// Unmodified source data was loaded from the disk cache.
    DataDiskCache,
    /// A transformed resource was loaded from the disk cache.
    ResourceDiskCache,
    /// The resource was served from the in-memory caches.
    MemoryCache,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::DataDiskCache => "data_disk_cache",
            Self::ResourceDiskCache => "resource_disk_cache",
            Self::MemoryCache => "memory_cache",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a decoded resource is persisted to the disk cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EncodeStrategy {
    /// Writes the original unmodified data to the disk cache.
    Source,
    /// Writes the decoded, transformed resource to the disk cache.
    Transformed,
    /// Nothing is written.
    None,
}

/// Policy controlling which of raw source data and transformed results may be read from and
/// written to the disk cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DiskCacheStrategy {
    /// Caches remote data with both `Data` and `Resource`, and local data with `Resource` only.
    All,
    /// Saves no data to cache.
    None,
    /// Writes retrieved data directly to the disk cache before it is decoded.
    Data,
    /// Writes resources to disk after they have been decoded.
    Resource,
    /// Tries to intelligently choose a strategy based on the data source and the encode strategy.
    #[default]
    Automatic,
}

impl DiskCacheStrategy {
    /// Returns `true` if data from the given source should be written to the data cache.
    pub fn is_data_cacheable(&self, data_source: DataSource) -> bool {
        match self {
            Self::All | Self::Automatic => data_source == DataSource::Remote,
            Self::None | Self::Resource => false,
            Self::Data => {
                data_source != DataSource::DataDiskCache && data_source != DataSource::MemoryCache
            }
        }
    }

    /// Returns `true` if a resource decoded from the given source should be written to the
    /// resource cache.
    pub fn is_resource_cacheable(
        &self,
        is_from_alternate_cache_key: bool,
        data_source: DataSource,
        encode_strategy: EncodeStrategy,
    ) -> bool {
        match self {
            Self::All | Self::Resource => {
                data_source != DataSource::ResourceDiskCache
                    && data_source != DataSource::MemoryCache
            }
            Self::None | Self::Data => false,
            Self::Automatic => {
                ((is_from_alternate_cache_key && data_source == DataSource::DataDiskCache)
                    || data_source == DataSource::Local)
                    && encode_strategy == EncodeStrategy::Transformed
            }
        }
    }

    /// Returns `true` if this request should attempt to decode cached resource data.
    pub fn decode_cached_resource(&self) -> bool {
        matches!(self, Self::All | Self::Resource | Self::Automatic)
    }

    /// Returns `true` if this request should attempt to decode cached source data.
    pub fn decode_cached_data(&self) -> bool {
        matches!(self, Self::All | Self::Data | Self::Automatic)
    }
}

impl FromStr for DiskCacheStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" => Self::All,
            "none" => Self::None,
            "data" => Self::Data,
            "resource" => Self::Resource,
            "automatic" => Self::Automatic,
            _ => return Err(format!("unknown disk cache strategy `{s}`")),
        })
    }
}

/// Additional, user-supplied key material, for example a version or a modification time.
///
/// Two requests for the same model with different signatures never share cache entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Signature(Option<Arc<str>>);

impl Signature {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(Some(value.into()))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(value) => f.write_str(value),
            None => f.write_str("<empty>"),
        }
    }
}
