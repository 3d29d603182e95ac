use std::fmt;
use std::sync::Arc;

use crate::error::{Cause, LoadError};
use crate::registry::{Data, DataRewinder, ResourceDecoder, ResourceTranscoder};
use crate::resource::Resource;
use crate::types::{Options, TypeTag};

/// Called with every decoded resource before it is transcoded.
///
/// Applies transformations and decides whether the result is written to the disk cache.
pub type DecodedCallback<'a> =
    dyn FnMut(Box<dyn Resource>) -> Result<Box<dyn Resource>, LoadError> + 'a;

/// Decodes one data type into one resource type, and transcodes the result.
pub struct DecodePath {
    data_tag: TypeTag,
    resource_tag: TypeTag,
    transcode_tag: TypeTag,
    decoders: Vec<Arc<dyn ResourceDecoder>>,
    transcoder: Arc<dyn ResourceTranscoder>,
}

impl DecodePath {
    pub(crate) fn new(
        data_tag: TypeTag,
        resource_tag: TypeTag,
        transcode_tag: TypeTag,
        decoders: Vec<Arc<dyn ResourceDecoder>>,
        transcoder: Arc<dyn ResourceTranscoder>,
    ) -> Self {
        Self {
            data_tag,
            resource_tag,
            transcode_tag,
            decoders,
            transcoder,
        }
    }

    pub fn resource_tag(&self) -> TypeTag {
        self.resource_tag
    }

    #[allow(clippy::too_many_arguments)]
    pub fn decode(
        &self,
        rewinder: &dyn DataRewinder,
        data: &mut Data,
        width: u32,
        height: u32,
        options: &Options,
        callback: &mut DecodedCallback<'_>,
    ) -> Result<Box<dyn Resource>, LoadError> {
        let decoded = self.decode_resource(rewinder, data, width, height, options)?;
        let transformed = callback(decoded)?;
        self.transcoder
            .transcode(transformed, options)
            .map_err(|error| LoadError::new(format!("Failed to transcode {self}")).with_cause(error))
    }

    fn decode_resource(
        &self,
        rewinder: &dyn DataRewinder,
        data: &mut Data,
        width: u32,
        height: u32,
        options: &Options,
    ) -> Result<Box<dyn Resource>, LoadError> {
        let mut causes: Vec<Cause> = Vec::new();
        for decoder in &self.decoders {
            match try_decode(&**decoder, rewinder, data, width, height, options) {
                Ok(Some(resource)) => return Ok(resource),
                Ok(None) => {}
                Err(error) => {
                    tracing::trace!(path = %self, error = %format!("{error:#}"), "decoder failed");
                    causes.push(error.into());
                }
            }
        }
        Err(LoadError::new(format!("Failed DecodePath{{{self}}}")).with_causes(causes))
    }
}

fn try_decode(
    decoder: &dyn ResourceDecoder,
    rewinder: &dyn DataRewinder,
    data: &mut Data,
    width: u32,
    height: u32,
    options: &Options,
) -> anyhow::Result<Option<Box<dyn Resource>>> {
    rewinder.rewind(data)?;
    if !decoder.handles(data, options)? {
        return Ok(None);
    }
    rewinder.rewind(data)?;
    decoder.decode(data, width, height, options)
}

impl fmt::Display for DecodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}->{}",
            self.data_tag, self.resource_tag, self.transcode_tag
        )
    }
}

/// Every [`DecodePath`] from one data type to the requested transcode type.
pub struct LoadPath {
    data_tag: TypeTag,
    resource_tag: TypeTag,
    transcode_tag: TypeTag,
    decode_paths: Vec<DecodePath>,
}

impl LoadPath {
    pub(crate) fn new(
        data_tag: TypeTag,
        resource_tag: TypeTag,
        transcode_tag: TypeTag,
        decode_paths: Vec<DecodePath>,
    ) -> Self {
        Self {
            data_tag,
            resource_tag,
            transcode_tag,
            decode_paths,
        }
    }

    pub fn data_tag(&self) -> TypeTag {
        self.data_tag
    }

    pub fn decode_paths(&self) -> &[DecodePath] {
        &self.decode_paths
    }

    /// Tries every decode path in order until one of them succeeds.
    ///
    /// Fatal errors are returned right away.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        &self,
        rewinder: &dyn DataRewinder,
        data: &mut Data,
        width: u32,
        height: u32,
        options: &Options,
        callback: &mut DecodedCallback<'_>,
    ) -> Result<Box<dyn Resource>, LoadError> {
        let mut causes: Vec<Cause> = Vec::new();
        for path in &self.decode_paths {
            match path.decode(rewinder, data, width, height, options, callback) {
                Ok(resource) => return Ok(resource),
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => causes.push(error.into()),
            }
        }
        Err(LoadError::new(format!("Failed LoadPath{{{self}}}")).with_causes(causes))
    }
}

impl fmt::Display for LoadPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}->{}",
            self.data_tag, self.resource_tag, self.transcode_tag
        )
    }
}

impl fmt::Debug for LoadPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadPath")
            .field("data_tag", &self.data_tag)
            .field("resource_tag", &self.resource_tag)
            .field("transcode_tag", &self.transcode_tag)
            .field("decode_paths", &self.decode_paths.len())
            .finish()
    }
}
