#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use image::{imageops, Rgba, RgbaImage};
use mangasr_core::model::{InferenceModel, ModelLoader};
use mangasr_core::{Bitmap, UpscaleError, UpscaleResult, UpscaleSettings};

/// Nearest-neighbour "super-resolution" with a call counter.
pub struct PixelDoubler {
    scale: u32,
    calls: AtomicUsize,
}

impl PixelDoubler {
    pub fn new(scale: u32) -> Arc<Self> {
        Arc::new(Self {
            scale,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceModel for PixelDoubler {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn infer(&self, image: &RgbaImage) -> Result<RgbaImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(imageops::resize(
            image,
            image.width() * self.scale,
            image.height() * self.scale,
            imageops::FilterType::Nearest,
        ))
    }
}

/// Serves one model for one settings triple.
pub struct SingleModelLoader {
    pub settings: UpscaleSettings,
    pub model: Arc<PixelDoubler>,
}

impl ModelLoader for SingleModelLoader {
    fn load(&self, settings: UpscaleSettings) -> UpscaleResult<Arc<dyn InferenceModel>> {
        if settings == self.settings {
            Ok(self.model.clone())
        } else {
            Err(UpscaleError::ModelUnavailable(settings.model_stem()))
        }
    }
}

/// Screentone-like checkerboard with a gradient so every pixel is distinct enough to
/// catch misplaced tiles.
pub fn page(width: u32, height: u32, id: &str) -> Bitmap {
    let pixels = RgbaImage::from_fn(width, height, |x, y| {
        let tone = if (x / 3 + y / 3) % 2 == 0 { 30 } else { 220 };
        Rgba([tone, (x % 256) as u8, (y % 256) as u8, 255])
    });
    Bitmap::from_rgba(pixels).with_reference_id(id)
}
