//! Opaque RGBA8 pixel buffer passed between pipeline stages.
//!
//! Clones share the pixel buffer; [`Bitmap::pixels_mut`] copies on write, so a
//! stage can never mutate a buffer another stage still holds.

use std::fmt;
use std::sync::{Arc, OnceLock};

use image::{DynamicImage, RgbaImage};
use sha2::{Digest, Sha256};

#[derive(Clone)]
pub struct Bitmap {
    inner: Arc<BitmapInner>,
    display_scale: f32,
    reference_id: Option<Arc<str>>,
}

struct BitmapInner {
    pixels: RgbaImage,
    content_digest: OnceLock<String>,
}

impl Clone for BitmapInner {
    fn clone(&self) -> Self {
        Self {
            pixels: self.pixels.clone(),
            content_digest: OnceLock::new(),
        }
    }
}

impl Bitmap {
    pub fn from_rgba(pixels: RgbaImage) -> Self {
        Self {
            inner: Arc::new(BitmapInner {
                pixels,
                content_digest: OnceLock::new(),
            }),
            display_scale: 1.0,
            reference_id: None,
        }
    }

    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self::from_rgba(image.into_rgba8())
    }

    /// Use a caller-supplied identity (e.g. the page URL) instead of hashing pixels.
    pub fn with_reference_id(mut self, id: impl Into<String>) -> Self {
        self.reference_id = Some(Arc::from(id.into()));
        self
    }

    pub fn with_display_scale(mut self, scale: f32) -> Self {
        self.display_scale = scale;
        self
    }

    pub fn width(&self) -> u32 {
        self.inner.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.inner.pixels.dimensions()
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    /// Device pixel density the image is meant to be shown at.
    pub fn display_scale(&self) -> f32 {
        self.display_scale
    }

    pub fn as_rgba(&self) -> &RgbaImage {
        &self.inner.pixels
    }

    /// Mutable access; copies the buffer first if it is shared.
    ///
    /// The bitmap's identity is reset: the mutated image is a different image.
    pub fn pixels_mut(&mut self) -> &mut RgbaImage {
        self.reference_id = None;
        let inner = Arc::make_mut(&mut self.inner);
        inner.content_digest = OnceLock::new();
        &mut inner.pixels
    }

    pub fn into_rgba(self) -> RgbaImage {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.pixels,
            Err(shared) => shared.pixels.clone(),
        }
    }

    /// Stable identity used for result caching.
    ///
    /// The reference id when one was given, otherwise a SHA-256 of the
    /// dimensions and pixel bytes, computed once and shared by all clones.
    pub fn identity(&self) -> &str {
        if let Some(id) = &self.reference_id {
            return id;
        }
        self.inner.content_digest.get_or_init(|| {
            let mut hasher = Sha256::new();
            hasher.update(self.width().to_le_bytes());
            hasher.update(self.height().to_le_bytes());
            hasher.update(self.inner.pixels.as_raw());
            format!("sha256:{:x}", hasher.finalize())
        })
    }

    /// Whether both bitmaps share the same underlying buffer.
    pub fn ptr_eq(&self, other: &Bitmap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A bitmap with new pixels that keeps this one's display scale.
    pub(crate) fn derive(&self, pixels: RgbaImage) -> Bitmap {
        Bitmap::from_rgba(pixels).with_display_scale(self.display_scale)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("display_scale", &self.display_scale)
            .field("reference_id", &self.reference_id)
            .finish()
    }
}

impl From<RgbaImage> for Bitmap {
    fn from(pixels: RgbaImage) -> Self {
        Self::from_rgba(pixels)
    }
}
