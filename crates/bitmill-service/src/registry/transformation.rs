//! Transformations applied to decoded resources before they are cached and handed out.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use image::RgbaImage;
use image::imageops::{self, FilterType};

use super::Registry;
use crate::resource::{Bitmap, BitmapPool, BitmapResource, Resource};
use crate::types::{SIZE_ORIGINAL, TypeTag};

/// Transforms a decoded resource, for example by cropping or scaling it.
pub trait Transformation: Send + Sync {
    /// A stable identifier that is part of the cache keys of transformed resources.
    fn id(&self) -> Cow<'static, str>;

    /// Whether the transformation only ever scales the resource, and never alters its content.
    fn is_scale_only(&self) -> bool {
        false
    }

    /// Transforms `resource` to fit the target size.
    ///
    /// Returns the input if nothing needs to change. Otherwise the input is recycled.
    fn transform(
        &self,
        pool: &Arc<BitmapPool>,
        resource: Box<dyn Resource>,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Box<dyn Resource>>;
}

/// Leaves resources untouched.
#[derive(Debug, Default)]
pub struct UnitTransformation;

impl Transformation for UnitTransformation {
    fn id(&self) -> Cow<'static, str> {
        Cow::Borrowed("unit")
    }

    fn is_scale_only(&self) -> bool {
        true
    }

    fn transform(
        &self,
        _pool: &Arc<BitmapPool>,
        resource: Box<dyn Resource>,
        _width: u32,
        _height: u32,
    ) -> anyhow::Result<Box<dyn Resource>> {
        Ok(resource)
    }
}

fn target_size(bitmap: &Bitmap, width: u32, height: u32) -> (u32, u32) {
    let width = if width == SIZE_ORIGINAL {
        bitmap.width()
    } else {
        width
    };
    let height = if height == SIZE_ORIGINAL {
        bitmap.height()
    } else {
        height
    };
    (width.max(1), height.max(1))
}

/// Runs `f` on the bitmap of `resource`, and replaces the resource if the output differs.
fn transform_bitmap<F>(
    pool: &Arc<BitmapPool>,
    resource: Box<dyn Resource>,
    width: u32,
    height: u32,
    f: F,
) -> anyhow::Result<Box<dyn Resource>>
where
    F: FnOnce(&Bitmap, u32, u32) -> Option<RgbaImage>,
{
    let Some(bitmap) = resource.downcast_ref::<Bitmap>() else {
        let tag = resource.tag();
        resource.recycle();
        anyhow::bail!("cannot transform {tag}");
    };
    let (width, height) = target_size(bitmap, width, height);
    let Some(transformed) = f(bitmap, width, height) else {
        return Ok(resource);
    };
    let bitmap = Bitmap::from_rgba(pool, &transformed, bitmap.config());
    resource.recycle();
    Ok(Box::new(BitmapResource::new(bitmap, Arc::clone(pool))))
}

fn scaled(width: u32, height: u32, scale: f64) -> (u32, u32) {
    (
        ((width as f64 * scale).round() as u32).max(1),
        ((height as f64 * scale).round() as u32).max(1),
    )
}

/// Scales the bitmap so it fills the target size, cropping whatever does not fit.
#[derive(Debug, Default)]
pub struct CenterCrop;

impl Transformation for CenterCrop {
    fn id(&self) -> Cow<'static, str> {
        Cow::Borrowed("center_crop")
    }

    fn transform(
        &self,
        pool: &Arc<BitmapPool>,
        resource: Box<dyn Resource>,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Box<dyn Resource>> {
        transform_bitmap(pool, resource, width, height, |bitmap, width, height| {
            if (bitmap.width(), bitmap.height()) == (width, height) {
                return None;
            }
            let scale = f64::max(
                width as f64 / bitmap.width() as f64,
                height as f64 / bitmap.height() as f64,
            );
            let (scaled_width, scaled_height) = scaled(bitmap.width(), bitmap.height(), scale);
            let image = imageops::resize(
                &bitmap.to_rgba(),
                scaled_width.max(width),
                scaled_height.max(height),
                FilterType::Triangle,
            );
            let x = (image.width() - width) / 2;
            let y = (image.height() - height) / 2;
            Some(imageops::crop_imm(&image, x, y, width, height).to_image())
        })
    }
}

/// Scales the bitmap uniformly so it fits into the target size.
#[derive(Debug, Default)]
pub struct FitCenter;

impl Transformation for FitCenter {
    fn id(&self) -> Cow<'static, str> {
        Cow::Borrowed("fit_center")
    }

    fn transform(
        &self,
        pool: &Arc<BitmapPool>,
        resource: Box<dyn Resource>,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Box<dyn Resource>> {
        transform_bitmap(pool, resource, width, height, |bitmap, width, height| {
            let scale = f64::min(
                width as f64 / bitmap.width() as f64,
                height as f64 / bitmap.height() as f64,
            );
            let (width, height) = scaled(bitmap.width(), bitmap.height(), scale);
            if (bitmap.width(), bitmap.height()) == (width, height) {
                return None;
            }
            Some(imageops::resize(
                &bitmap.to_rgba(),
                width,
                height,
                FilterType::Triangle,
            ))
        })
    }
}

/// Downscales the bitmap so it fits into the target size. Never upscales.
#[derive(Debug, Default)]
pub struct Resize;

impl Transformation for Resize {
    fn id(&self) -> Cow<'static, str> {
        Cow::Borrowed("resize")
    }

    fn is_scale_only(&self) -> bool {
        true
    }

    fn transform(
        &self,
        pool: &Arc<BitmapPool>,
        resource: Box<dyn Resource>,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Box<dyn Resource>> {
        transform_bitmap(pool, resource, width, height, |bitmap, width, height| {
            let scale = f64::min(
                width as f64 / bitmap.width() as f64,
                height as f64 / bitmap.height() as f64,
            );
            if scale >= 1.0 {
                return None;
            }
            let (width, height) = scaled(bitmap.width(), bitmap.height(), scale);
            Some(imageops::resize(
                &bitmap.to_rgba(),
                width,
                height,
                FilterType::Triangle,
            ))
        })
    }
}

/// The transformations of a load request, one per resource type.
#[derive(Clone, Default)]
pub struct Transformations {
    entries: Vec<(TypeTag, Arc<dyn Transformation>)>,
    required: bool,
}

impl Transformations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `transformation` to resources of type `T` and its subtypes.
    pub fn with<T: Any>(mut self, transformation: impl Transformation + 'static) -> Self {
        let tag = TypeTag::of::<T>();
        self.entries.retain(|(existing, _)| *existing != tag);
        self.entries.push((tag, Arc::new(transformation)));
        self
    }

    /// Fails loads of resources for which no transformation is registered.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_scale_only_or_none(&self) -> bool {
        self.entries
            .iter()
            .all(|(_, transformation)| transformation.is_scale_only())
    }

    /// Finds the transformation for `tag`, falling back to the first one registered for a
    /// supertype of it.
    pub fn get(&self, tag: TypeTag, registry: &Registry) -> Option<Arc<dyn Transformation>> {
        let exact = self.entries.iter().find(|(entry, _)| *entry == tag);
        exact
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(entry, _)| registry.is_assignable(tag, *entry))
            })
            .map(|(_, transformation)| Arc::clone(transformation))
    }

    /// The `(resource type, transformation id)` pairs that go into an
    /// [`EngineKey`](crate::caching::EngineKey).
    pub fn key_parts(&self) -> Vec<(TypeTag, String)> {
        self.entries
            .iter()
            .map(|(tag, transformation)| (*tag, transformation.id().into_owned()))
            .collect()
    }
}

impl fmt::Debug for Transformations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformations")
            .field("entries", &self.key_parts())
            .field("required", &self.required)
            .finish()
    }
}
