//! Decoders, encoders and transcoders, together with the built-in implementations backed by
//! the `image` crate.

use std::io::{self, Read, Write};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::imageops::{self, FilterType as ResizeFilter};
use image::{ExtendedColorType, ImageEncoder};

use super::data::{ByteStream, Data};
use crate::resource::{Bitmap, BitmapConfig, BitmapPool, BitmapResource, BytesResource, Resource};
use crate::types::{EncodeStrategy, Options, SIZE_ORIGINAL};

/// Decodes [`Data`] into a [`Resource`].
pub trait ResourceDecoder: Send + Sync {
    /// Returns `true` if this decoder is likely able to decode the data.
    ///
    /// The data is rewound before and after this call.
    fn handles(&self, data: &mut Data, options: &Options) -> anyhow::Result<bool>;

    /// Decodes the data, returning `None` if it cannot be decoded by this decoder.
    fn decode(
        &self,
        data: &mut Data,
        width: u32,
        height: u32,
        options: &Options,
    ) -> anyhow::Result<Option<Box<dyn Resource>>>;
}

/// Converts a decoded resource into the requested output type.
pub trait ResourceTranscoder: Send + Sync {
    fn transcode(
        &self,
        resource: Box<dyn Resource>,
        options: &Options,
    ) -> anyhow::Result<Box<dyn Resource>>;
}

/// Returns resources unchanged, used when no conversion is needed.
#[derive(Debug, Default)]
pub struct UnitTranscoder;

impl ResourceTranscoder for UnitTranscoder {
    fn transcode(
        &self,
        resource: Box<dyn Resource>,
        _options: &Options,
    ) -> anyhow::Result<Box<dyn Resource>> {
        Ok(resource)
    }
}

/// Writes fetched source data to the disk cache.
pub trait Encoder: Send + Sync {
    fn encode(&self, data: &mut Data, file: &mut dyn Write, options: &Options)
    -> anyhow::Result<()>;
}

/// Writes decoded resources to the disk cache.
pub trait ResourceEncoder: Send + Sync {
    /// Whether the encoder writes the source data or the transformed resource.
    fn encode_strategy(&self, options: &Options) -> EncodeStrategy;

    fn encode(
        &self,
        resource: &dyn Resource,
        file: &mut dyn Write,
        options: &Options,
    ) -> anyhow::Result<()>;
}

fn decode_bitmap(
    pool: &BitmapPool,
    bytes: &[u8],
    width: u32,
    height: u32,
    options: &Options,
) -> anyhow::Result<Bitmap> {
    let image = image::load_from_memory(bytes).context("failed to decode image")?;
    let mut rgba = image.into_rgba8();

    // Like sampling while decoding: shrink by powers of two while staying above the target.
    if width != SIZE_ORIGINAL && height != SIZE_ORIGINAL && width > 0 && height > 0 {
        let mut sample = 1;
        while rgba.width() / (sample * 2) >= width && rgba.height() / (sample * 2) >= height {
            sample *= 2;
        }
        if sample > 1 {
            rgba = imageops::resize(
                &rgba,
                rgba.width() / sample,
                rgba.height() / sample,
                ResizeFilter::Triangle,
            );
        }
    }

    let mut config = options
        .get_str(Options::DECODE_FORMAT)
        .and_then(BitmapConfig::from_option)
        .unwrap_or_default();
    if config == BitmapConfig::Argb8888 && options.get_bool(Options::ALLOW_HARDWARE_CONFIG) == Some(true)
    {
        config = BitmapConfig::Hardware;
    }

    Ok(Bitmap::from_rgba(pool, &rgba, config))
}

/// Decodes encoded [`Bytes`] into [`Bitmap`]s.
pub struct BitmapDecoder {
    pool: Arc<BitmapPool>,
}

impl BitmapDecoder {
    pub fn new(pool: Arc<BitmapPool>) -> Self {
        Self { pool }
    }
}

impl ResourceDecoder for BitmapDecoder {
    fn handles(&self, data: &mut Data, _options: &Options) -> anyhow::Result<bool> {
        Ok(data
            .downcast_ref::<Bytes>()
            .is_some_and(|bytes| image::guess_format(bytes).is_ok()))
    }

    fn decode(
        &self,
        data: &mut Data,
        width: u32,
        height: u32,
        options: &Options,
    ) -> anyhow::Result<Option<Box<dyn Resource>>> {
        let Some(bytes) = data.downcast_ref::<Bytes>() else {
            return Ok(None);
        };
        let bitmap = decode_bitmap(&self.pool, bytes, width, height, options)?;
        Ok(Some(Box::new(BitmapResource::new(
            bitmap,
            Arc::clone(&self.pool),
        ))))
    }
}

/// Decodes a [`ByteStream`] into [`Bitmap`]s.
pub struct StreamBitmapDecoder {
    pool: Arc<BitmapPool>,
}

impl StreamBitmapDecoder {
    pub fn new(pool: Arc<BitmapPool>) -> Self {
        Self { pool }
    }
}

impl ResourceDecoder for StreamBitmapDecoder {
    fn handles(&self, data: &mut Data, _options: &Options) -> anyhow::Result<bool> {
        let Some(stream) = data.downcast_mut::<ByteStream>() else {
            return Ok(false);
        };
        let mut header = Vec::with_capacity(32);
        stream.by_ref().take(32).read_to_end(&mut header)?;
        Ok(image::guess_format(&header).is_ok())
    }

    fn decode(
        &self,
        data: &mut Data,
        width: u32,
        height: u32,
        options: &Options,
    ) -> anyhow::Result<Option<Box<dyn Resource>>> {
        let Some(stream) = data.downcast_mut::<ByteStream>() else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes)?;
        let bitmap = decode_bitmap(&self.pool, &bytes, width, height, options)?;
        Ok(Some(Box::new(BitmapResource::new(
            bitmap,
            Arc::clone(&self.pool),
        ))))
    }
}

fn compression(options: &Options) -> CompressionType {
    match options.get_str(Options::ENCODE_COMPRESSION) {
        Some("fast") => CompressionType::Fast,
        Some("best") => CompressionType::Best,
        _ => CompressionType::Default,
    }
}

fn encode_png(bitmap: &Bitmap, file: &mut dyn Write, options: &Options) -> anyhow::Result<()> {
    let rgba = bitmap.to_rgba();
    PngEncoder::new_with_quality(file, compression(options), FilterType::Adaptive)
        .write_image(
            rgba.as_raw(),
            rgba.width(),
            rgba.height(),
            ExtendedColorType::Rgba8,
        )
        .context("failed to encode png")
}

/// Writes [`Bitmap`]s as PNG.
#[derive(Debug, Default)]
pub struct BitmapEncoder;

impl ResourceEncoder for BitmapEncoder {
    fn encode_strategy(&self, _options: &Options) -> EncodeStrategy {
        EncodeStrategy::Transformed
    }

    fn encode(
        &self,
        resource: &dyn Resource,
        file: &mut dyn Write,
        options: &Options,
    ) -> anyhow::Result<()> {
        let bitmap = resource
            .downcast_ref::<Bitmap>()
            .context("expected a bitmap")?;
        encode_png(bitmap, file, options)
    }
}

/// Writes [`Bytes`] and [`ByteStream`] data unchanged.
#[derive(Debug, Default)]
pub struct StreamEncoder;

impl Encoder for StreamEncoder {
    fn encode(
        &self,
        data: &mut Data,
        file: &mut dyn Write,
        _options: &Options,
    ) -> anyhow::Result<()> {
        if let Some(bytes) = data.downcast_ref::<Bytes>() {
            file.write_all(bytes)?;
        } else if let Some(stream) = data.downcast_mut::<ByteStream>() {
            io::copy(stream, file)?;
        } else {
            anyhow::bail!("cannot write {} to the disk cache", data.tag());
        }
        Ok(())
    }
}

/// Encodes [`Bitmap`]s into PNG [`Bytes`].
#[derive(Debug, Default)]
pub struct BitmapBytesTranscoder;

impl ResourceTranscoder for BitmapBytesTranscoder {
    fn transcode(
        &self,
        resource: Box<dyn Resource>,
        options: &Options,
    ) -> anyhow::Result<Box<dyn Resource>> {
        let bitmap = resource
            .downcast_ref::<Bitmap>()
            .context("expected a bitmap")?;
        let mut png = Vec::new();
        encode_png(bitmap, &mut png, options)?;
        resource.recycle();
        Ok(Box::new(BytesResource::new(png.into())))
    }
}
