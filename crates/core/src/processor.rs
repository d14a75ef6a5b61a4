//! Synchronous image-pipeline adapter over the async upscaler service.
//!
//! The host pipeline asks [`ImageProcessor::should_process`] and then calls
//! [`ImageProcessor::process`] on one of its own threads. `process` spawns
//! `upscale_now` on the service's runtime and waits on a channel with a hard
//! deadline, so only the calling thread blocks.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::Rgba;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use crate::bitmap::Bitmap;
use crate::error::UpscaleError;
use crate::service::UpscalerService;
use crate::settings::UpscaleSettings;
use crate::store::SettingsStore;

pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Images at least this fraction of the display in both dimensions are left alone.
pub const ELIGIBILITY_RATIO: f64 = 0.8;

pub const ENV_DEBUG_OVERLAY: &str = "MANGASR_DEBUG_OVERLAY";

/// Contract of the host image pipeline.
pub trait ImageProcessor: Send + Sync {
    /// Two processors with the same identifier are interchangeable.
    fn identifier(&self) -> &str;

    fn should_process(&self, image: Option<&Bitmap>) -> bool;

    fn process(&self, image: Option<Bitmap>) -> Option<Bitmap>;
}

/// Physical pixel size and density of the screen pages are shown on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayGeometry {
    pub width_px: u32,
    pub height_px: u32,
    pub scale: f32,
}

impl Default for DisplayGeometry {
    fn default() -> Self {
        Self {
            width_px: 1536,
            height_px: 2048,
            scale: 2.0,
        }
    }
}

impl DisplayGeometry {
    pub fn from_points(width_pt: f32, height_pt: f32, scale: f32) -> Self {
        Self {
            width_px: (width_pt * scale).round() as u32,
            height_px: (height_pt * scale).round() as u32,
            scale,
        }
    }
}

pub fn debug_overlay_from_env() -> bool {
    std::env::var(ENV_DEBUG_OVERLAY)
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

pub struct UpscaleProcessor {
    identifier: String,
    settings: UpscaleSettings,
    service: Arc<UpscalerService>,
    store: Arc<dyn SettingsStore>,
    display: DisplayGeometry,
    runtime: Handle,
    timeout: Duration,
    debug_overlay: bool,
}

impl UpscaleProcessor {
    /// `runtime` must be a runtime the calling threads do not drive.
    pub fn new(
        service: Arc<UpscalerService>,
        settings: UpscaleSettings,
        store: Arc<dyn SettingsStore>,
        display: DisplayGeometry,
        runtime: Handle,
    ) -> Self {
        Self {
            identifier: Self::identifier_for(&settings),
            settings,
            service,
            store,
            display,
            runtime,
            timeout: DEFAULT_PROCESS_TIMEOUT,
            debug_overlay: debug_overlay_from_env(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_debug_overlay(mut self, enabled: bool) -> Self {
        self.debug_overlay = enabled;
        self
    }

    /// Format: `mangasr.upscale.{family}.noise{n}.scale{k}x`
    pub fn identifier_for(settings: &UpscaleSettings) -> String {
        format!(
            "mangasr.upscale.{}.noise{}.scale{}x",
            settings.model_family.slug(),
            settings.denoise_level.value(),
            settings.scale_factor.value()
        )
    }

    pub fn settings(&self) -> UpscaleSettings {
        self.settings
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn display(&self) -> DisplayGeometry {
        self.display
    }

    fn upscale_blocking(&self, image: &Bitmap) -> Bitmap {
        let caller_flavor = Handle::try_current().ok().map(|h| h.runtime_flavor());
        if caller_flavor == Some(RuntimeFlavor::CurrentThread) {
            warn!(
                processor = %self.identifier,
                "process called from a current-thread runtime; returning original"
            );
            return image.clone();
        }

        let (tx, rx) = sync_channel(1);
        let service = Arc::clone(&self.service);
        let input = image.clone();
        let settings = self.settings;
        self.runtime.spawn(async move {
            let result = service.upscale_now(&input, settings).await;
            let _ = tx.send(result);
        });

        let started = Instant::now();
        let wait = || rx.recv_timeout(self.timeout);
        let received = if caller_flavor.is_some() {
            tokio::task::block_in_place(wait)
        } else {
            wait()
        };

        match received {
            Ok(Ok(result)) => {
                debug!(
                    processor = %self.identifier,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Processed image"
                );
                if self.debug_overlay {
                    draw_debug_marker(result, self.display.scale)
                } else {
                    result
                }
            }
            Ok(Err(err)) => {
                warn!(processor = %self.identifier, error = %err, "Upscale failed, returning original");
                image.clone()
            }
            Err(RecvTimeoutError::Timeout) => {
                let err = UpscaleError::Timeout(self.timeout);
                warn!(processor = %self.identifier, error = %err, "Returning original");
                image.clone()
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(
                    processor = %self.identifier,
                    "Upscale task ended without a result, returning original"
                );
                image.clone()
            }
        }
    }
}

impl ImageProcessor for UpscaleProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn should_process(&self, image: Option<&Bitmap>) -> bool {
        let Some(image) = image else {
            return false;
        };
        if image.width() == 0 || image.height() == 0 {
            return false;
        }
        if !self.store.upscaling_enabled() {
            return false;
        }

        let max_w = f64::from(self.display.width_px) * ELIGIBILITY_RATIO;
        let max_h = f64::from(self.display.height_px) * ELIGIBILITY_RATIO;
        f64::from(image.width()) < max_w || f64::from(image.height()) < max_h
    }

    fn process(&self, image: Option<Bitmap>) -> Option<Bitmap> {
        let image = image?;
        if !self.should_process(Some(&image)) {
            return Some(image);
        }
        Some(self.upscale_blocking(&image))
    }
}

/// Magenta square in the top-left corner, sized for the display density.
fn draw_debug_marker(mut bitmap: Bitmap, display_scale: f32) -> Bitmap {
    let side = (8.0 * display_scale.max(1.0)).round() as u32;
    let pixels = bitmap.pixels_mut();
    let (w, h) = pixels.dimensions();
    for y in 0..side.min(h) {
        for x in 0..side.min(w) {
            pixels.put_pixel(x, y, Rgba([255, 0, 255, 255]));
        }
    }
    bitmap
}

impl PartialEq for UpscaleProcessor {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for UpscaleProcessor {}

impl Hash for UpscaleProcessor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl fmt::Debug for UpscaleProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpscaleProcessor")
            .field("identifier", &self.identifier)
            .field("display", &self.display)
            .field("timeout", &self.timeout)
            .field("debug_overlay", &self.debug_overlay)
            .finish()
    }
}
