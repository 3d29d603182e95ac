use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use image::RgbaImage;
use lru::LruCache;

use super::Resource;
use crate::caching::TrimLevel;
use crate::types::TypeTag;

/// The in-memory pixel format of a [`Bitmap`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BitmapConfig {
    /// Four bytes per pixel with alpha.
    #[default]
    Argb8888,
    /// Two bytes per pixel, no alpha.
    Rgb565,
    /// A single alpha byte per pixel.
    Alpha8,
    /// Immutable, full color bitmaps that are never pooled.
    Hardware,
}

impl BitmapConfig {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Argb8888 | Self::Hardware => 4,
            Self::Rgb565 => 2,
            Self::Alpha8 => 1,
        }
    }

    /// Parses the value of the [`DECODE_FORMAT`](crate::types::Options::DECODE_FORMAT) option.
    pub fn from_option(value: &str) -> Option<Self> {
        match value {
            "argb_8888" => Some(Self::Argb8888),
            "rgb_565" => Some(Self::Rgb565),
            "alpha_8" => Some(Self::Alpha8),
            _ => None,
        }
    }
}

/// A decoded image.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    config: BitmapConfig,
    pixels: Vec<u8>,
}

impl Bitmap {
    /// Creates a fully transparent bitmap.
    pub fn new(width: u32, height: u32, config: BitmapConfig) -> Self {
        let len = width as usize * height as usize * config.bytes_per_pixel();
        Self {
            width,
            height,
            config,
            pixels: vec![0; len],
        }
    }

    /// Converts `image` to `config`, reusing a pooled bitmap where possible.
    pub fn from_rgba(pool: &BitmapPool, image: &RgbaImage, config: BitmapConfig) -> Self {
        let mut bitmap = pool
            .get_dirty(image.width(), image.height(), config)
            .unwrap_or_else(|| Self::new(image.width(), image.height(), config));
        bitmap.write_rgba(image.as_raw());
        bitmap
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn config(&self) -> BitmapConfig {
        self.config
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_size(&self) -> u64 {
        self.pixels.len() as u64
    }

    pub fn is_mutable(&self) -> bool {
        self.config != BitmapConfig::Hardware
    }

    fn erase(&mut self) {
        self.pixels.fill(0);
    }

    fn write_rgba(&mut self, rgba: &[u8]) {
        match self.config {
            BitmapConfig::Argb8888 | BitmapConfig::Hardware => self.pixels.copy_from_slice(rgba),
            BitmapConfig::Rgb565 => {
                for (dst, src) in self.pixels.chunks_exact_mut(2).zip(rgba.chunks_exact(4)) {
                    let (r, g, b) = (src[0] as u16, src[1] as u16, src[2] as u16);
                    let packed = ((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3);
                    dst.copy_from_slice(&packed.to_le_bytes());
                }
            }
            BitmapConfig::Alpha8 => {
                for (dst, src) in self.pixels.iter_mut().zip(rgba.chunks_exact(4)) {
                    *dst = src[3];
                }
            }
        }
    }

    /// Expands the pixels into an 8 bit RGBA image.
    pub fn to_rgba(&self) -> RgbaImage {
        let mut rgba = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        match self.config {
            BitmapConfig::Argb8888 | BitmapConfig::Hardware => rgba.extend_from_slice(&self.pixels),
            BitmapConfig::Rgb565 => {
                for src in self.pixels.chunks_exact(2) {
                    let packed = u16::from_le_bytes([src[0], src[1]]);
                    let r = ((packed >> 11) & 0x1f) as u8;
                    let g = ((packed >> 5) & 0x3f) as u8;
                    let b = (packed & 0x1f) as u8;
                    rgba.extend_from_slice(&[
                        (r << 3) | (r >> 2),
                        (g << 2) | (g >> 4),
                        (b << 3) | (b >> 2),
                        u8::MAX,
                    ]);
                }
            }
            BitmapConfig::Alpha8 => {
                for &alpha in &self.pixels {
                    rgba.extend_from_slice(&[0, 0, 0, alpha]);
                }
            }
        }
        RgbaImage::from_raw(self.width, self.height, rgba).unwrap_or_default()
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("config", &self.config)
            .finish()
    }
}

/// A [`Bitmap`] that returns its pixel memory to a [`BitmapPool`] when recycled.
pub struct BitmapResource {
    bitmap: Bitmap,
    pool: Arc<BitmapPool>,
    recycled: AtomicBool,
}

impl BitmapResource {
    pub fn new(bitmap: Bitmap, pool: Arc<BitmapPool>) -> Self {
        Self {
            bitmap,
            pool,
            recycled: AtomicBool::new(false),
        }
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn pool(&self) -> &Arc<BitmapPool> {
        &self.pool
    }
}

impl Resource for BitmapResource {
    fn value(&self) -> &dyn Any {
        &self.bitmap
    }

    fn tag(&self) -> TypeTag {
        TypeTag::of::<Bitmap>()
    }

    fn size(&self) -> u64 {
        self.bitmap.byte_size()
    }

    fn recycle(&self) {
        self.recycled.store(true, Ordering::Release);
    }
}

impl Drop for BitmapResource {
    // The pixels can only be moved out once the last reference is gone.
    fn drop(&mut self) {
        if self.recycled.load(Ordering::Acquire) {
            self.pool.put(std::mem::take(&mut self.bitmap));
        }
    }
}

type PoolKey = (u32, u32, BitmapConfig);

struct PoolState {
    groups: LruCache<PoolKey, Vec<Bitmap>>,
    current_size: u64,
}

/// A size bounded pool of reusable bitmaps.
///
/// Bitmaps are grouped by their dimensions and config, groups are evicted least recently
/// used first.
pub struct BitmapPool {
    max_size: u64,
    state: Mutex<PoolState>,
}

impl BitmapPool {
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            state: Mutex::new(PoolState {
                groups: LruCache::unbounded(),
                current_size: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn current_size(&self) -> u64 {
        self.lock().current_size
    }

    /// Offers a bitmap for reuse.
    pub fn put(&self, bitmap: Bitmap) {
        if !bitmap.is_mutable() || bitmap.byte_size() == 0 || bitmap.byte_size() > self.max_size {
            return;
        }

        let mut state = self.lock();
        state.current_size += bitmap.byte_size();
        let key = (bitmap.width, bitmap.height, bitmap.config);
        state.groups.get_or_insert_mut(key, Vec::new).push(bitmap);
        Self::trim_to(&mut state, self.max_size);
    }

    /// Returns a cleared bitmap, allocating a new one if nothing matches.
    pub fn get(&self, width: u32, height: u32, config: BitmapConfig) -> Bitmap {
        match self.get_dirty(width, height, config) {
            Some(mut bitmap) => {
                bitmap.erase();
                bitmap
            }
            None => Bitmap::new(width, height, config),
        }
    }

    /// Returns a pooled bitmap with arbitrary pixel content.
    pub fn get_dirty(&self, width: u32, height: u32, config: BitmapConfig) -> Option<Bitmap> {
        let key = (width, height, config);
        let mut state = self.lock();
        let group = state.groups.get_mut(&key)?;
        let bitmap = group.pop()?;
        if group.is_empty() {
            state.groups.pop(&key);
        }
        state.current_size -= bitmap.byte_size();
        Some(bitmap)
    }

    pub fn clear_memory(&self) {
        let mut state = self.lock();
        Self::trim_to(&mut state, 0);
    }

    pub fn trim_memory(&self, level: TrimLevel) {
        let mut state = self.lock();
        match level {
            TrimLevel::Background | TrimLevel::Complete => Self::trim_to(&mut state, 0),
            TrimLevel::UiHidden | TrimLevel::RunningCritical => {
                Self::trim_to(&mut state, self.max_size / 2)
            }
        }
    }

    fn trim_to(state: &mut PoolState, size: u64) {
        while state.current_size > size {
            let Some(key) = state.groups.peek_lru().map(|(key, _)| *key) else {
                break;
            };
            let removed = state.groups.peek_mut(&key).and_then(|group| group.pop());
            if state.groups.peek(&key).is_none_or(|group| group.is_empty()) {
                state.groups.pop(&key);
            }
            if let Some(bitmap) = removed {
                state.current_size -= bitmap.byte_size();
            }
        }
    }
}

impl fmt::Debug for BitmapPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapPool")
            .field("max_size", &self.max_size)
            .field("current_size", &self.current_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    #[test]
    fn test_rgb565_roundtrip_drops_alpha() {
        let pool = BitmapPool::new(0);
        let image = RgbaImage::from_pixel(2, 2, Rgba([255, 0, 255, 10]));
        let bitmap = Bitmap::from_rgba(&pool, &image, BitmapConfig::Rgb565);

        assert_eq!(bitmap.byte_size(), 8);
        assert_eq!(bitmap.to_rgba().get_pixel(1, 1), &Rgba([255, 0, 255, 255]));
    }

    #[test]
    fn test_pool_reuses_recycled_bitmaps() {
        let pool = Arc::new(BitmapPool::new(1024));
        let resource = BitmapResource::new(
            Bitmap::new(4, 4, BitmapConfig::Argb8888),
            Arc::clone(&pool),
        );
        resource.recycle();
        drop(resource);
        assert_eq!(pool.current_size(), 64);

        let bitmap = pool.get(4, 4, BitmapConfig::Argb8888);
        assert_eq!(bitmap.byte_size(), 64);
        assert_eq!(pool.current_size(), 0);
    }

    #[test]
    fn test_unrecycled_resource_is_not_pooled() {
        let pool = Arc::new(BitmapPool::new(1024));
        drop(BitmapResource::new(
            Bitmap::new(4, 4, BitmapConfig::Argb8888),
            Arc::clone(&pool),
        ));
        assert_eq!(pool.current_size(), 0);
    }

    #[test]
    fn test_pool_rejects_hardware_and_evicts_lru() {
        let pool = BitmapPool::new(100);
        pool.put(Bitmap::new(4, 4, BitmapConfig::Hardware));
        assert_eq!(pool.current_size(), 0);

        pool.put(Bitmap::new(4, 4, BitmapConfig::Argb8888));
        pool.put(Bitmap::new(5, 5, BitmapConfig::Alpha8));
        pool.put(Bitmap::new(3, 3, BitmapConfig::Argb8888));
        // 64 + 25 + 36 > 100, so the oldest group goes
        assert_eq!(pool.current_size(), 61);
        assert!(pool.get_dirty(4, 4, BitmapConfig::Argb8888).is_none());
        assert!(pool.get_dirty(5, 5, BitmapConfig::Alpha8).is_some());

        pool.trim_memory(TrimLevel::Complete);
        assert_eq!(pool.current_size(), 0);
    }
}
