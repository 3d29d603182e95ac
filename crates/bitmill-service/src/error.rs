//! Errors surfaced by the engine.
//!
//! Collaborators (fetchers, decoders, encoders, transformations) report plain
//! [`anyhow::Error`]s. The decode pipeline collects those into a [`LoadError`] tree.

use std::fmt;

use crate::caching::CacheKey;
use crate::types::{DataSource, TypeTag};

/// Categorizes a [`LoadError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// Every attempt failed, see the causes for details.
    Failed,
    /// Fetching data from a [`DataFetcher`](crate::registry::DataFetcher) failed.
    FetchFailed,
    /// A resource had to be written to the disk cache but no encoder was registered.
    NoResultEncoderAvailable,
    /// Data had to be written to the disk cache but no encoder was registered.
    NoSourceEncoderAvailable,
    /// Transformations were required, but none is registered for the decoded resource.
    MissingTransformation,
    /// The job could not be scheduled onto an executor.
    Rejected,
}

/// One entry in the cause tree of a [`LoadError`].
#[derive(Debug)]
pub enum Cause {
    Load(LoadError),
    Other(anyhow::Error),
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Load(error) => fmt::Display::fmt(error, f),
            Cause::Other(error) => write!(f, "{error:#}"),
        }
    }
}

impl From<anyhow::Error> for Cause {
    fn from(error: anyhow::Error) -> Self {
        Cause::Other(error)
    }
}

impl From<LoadError> for Cause {
    fn from(error: LoadError) -> Self {
        Cause::Load(error)
    }
}

/// A failed load, together with every failed attempt that led to it.
#[derive(Debug, thiserror::Error)]
pub struct LoadError {
    kind: LoadErrorKind,
    message: String,
    causes: Vec<Cause>,
    key: Option<CacheKey>,
    data_source: Option<DataSource>,
    data_tag: Option<TypeTag>,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(LoadErrorKind::Failed, message)
    }

    pub fn with_kind(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
            key: None,
            data_source: None,
            data_tag: None,
        }
    }

    /// The terminal error of a job whose attempts all failed.
    pub fn aggregate(causes: Vec<Cause>) -> Self {
        Self::new("Failed to load resource").with_causes(causes)
    }

    /// Wraps an error reported by a data fetcher.
    pub fn fetch_failed(error: anyhow::Error) -> Self {
        Self::with_kind(LoadErrorKind::FetchFailed, "Fetching data failed").with_cause(error)
    }

    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn with_causes(mut self, causes: Vec<Cause>) -> Self {
        self.causes.extend(causes);
        self
    }

    /// Records which key, data source and data type the failed attempt was working with.
    pub fn set_logging_details(
        &mut self,
        key: CacheKey,
        data_source: DataSource,
        data_tag: Option<TypeTag>,
    ) {
        self.key = Some(key);
        self.data_source = Some(data_source);
        self.data_tag = data_tag;
    }

    pub fn kind(&self) -> LoadErrorKind {
        self.kind
    }

    /// Fatal errors abort the whole load instead of moving on to the next attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            LoadErrorKind::NoResultEncoderAvailable | LoadErrorKind::NoSourceEncoderAvailable
        )
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn causes(&self) -> &[Cause] {
        &self.causes
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }

    pub fn data_source(&self) -> Option<DataSource> {
        self.data_source
    }

    /// Walks the cause tree and returns the leaves, in attempt order.
    pub fn root_causes(&self) -> Vec<&anyhow::Error> {
        let mut roots = Vec::new();
        self.collect_root_causes(&mut roots);
        roots
    }

    fn collect_root_causes<'a>(&'a self, roots: &mut Vec<&'a anyhow::Error>) {
        for cause in &self.causes {
            match cause {
                Cause::Load(error) => error.collect_root_causes(roots),
                Cause::Other(error) => roots.push(error),
            }
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(tag) = &self.data_tag {
            write!(f, ", {tag}")?;
        }
        if let Some(data_source) = &self.data_source {
            write!(f, ", {data_source}")?;
        }
        if let Some(key) = &self.key {
            write!(f, ", {key}")?;
        }
        match self.causes.as_slice() {
            [] => Ok(()),
            [cause] => write!(f, ": {cause}"),
            causes => {
                write!(f, " ({} causes)", causes.len())?;
                for (i, cause) in causes.iter().enumerate() {
                    write!(f, "\n  cause {}: {cause}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

/// Misuse of the reference count of an [`EngineResource`](crate::resource::EngineResource).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("cannot release a resource that is not acquired")]
    OverReleased,
    #[error("cannot acquire a recycled resource")]
    Recycled,
    #[error("cannot recycle a resource that is still acquired")]
    StillAcquired,
}

/// A task could not be scheduled.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("executor `{0}` rejected the task")]
    Rejected(String),
    #[error("executor `{0}` discarded the queued task for a more important one")]
    Discarded(String),
    #[error("executor `{0}` is shut down")]
    ShutDown(String),
}
