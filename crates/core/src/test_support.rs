//! Test-double models and loaders shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use image::{imageops, RgbaImage};

use crate::error::{UpscaleError, UpscaleResult};
use crate::model::{InferenceModel, ModelLoader};
use crate::settings::UpscaleSettings;

/// Nearest-neighbour upscaler that counts its calls.
pub(crate) struct NearestModel {
    scale: u32,
    calls: AtomicUsize,
    delay: Duration,
    /// Zero-based call index that errors instead of upscaling.
    fail_on_call: Option<usize>,
}

impl NearestModel {
    pub(crate) fn new(scale: u32) -> Self {
        Self::with_delay(scale, Duration::ZERO)
    }

    pub(crate) fn with_delay(scale: u32, delay: Duration) -> Self {
        Self {
            scale,
            calls: AtomicUsize::new(0),
            delay,
            fail_on_call: None,
        }
    }

    pub(crate) fn failing_on_call(scale: u32, call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::new(scale)
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceModel for NearestModel {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn infer(&self, image: &RgbaImage) -> Result<RgbaImage> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_call == Some(call) {
            bail!("simulated failure on call {call}");
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let (w, h) = image.dimensions();
        Ok(imageops::resize(
            image,
            w * self.scale,
            h * self.scale,
            imageops::FilterType::Nearest,
        ))
    }
}

pub(crate) struct FailingModel {
    scale: u32,
    calls: AtomicUsize,
}

impl FailingModel {
    pub(crate) fn new(scale: u32) -> Self {
        Self {
            scale,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceModel for FailingModel {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn infer(&self, _image: &RgbaImage) -> Result<RgbaImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("simulated inference failure")
    }
}

/// Blocks inside `infer` until the paired sender is used or dropped.
pub(crate) struct HangingModel {
    scale: u32,
    release: Mutex<Receiver<()>>,
}

impl HangingModel {
    pub(crate) fn new(scale: u32) -> (Self, Sender<()>) {
        let (tx, rx) = channel();
        (
            Self {
                scale,
                release: Mutex::new(rx),
            },
            tx,
        )
    }
}

impl InferenceModel for HangingModel {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn infer(&self, _image: &RgbaImage) -> Result<RgbaImage> {
        if let Ok(rx) = self.release.lock() {
            let _ = rx.recv();
        }
        bail!("released without a result")
    }
}

/// Hands out pre-built models and counts load attempts.
#[derive(Default)]
pub(crate) struct StaticLoader {
    models: HashMap<UpscaleSettings, Arc<dyn InferenceModel>>,
    loads: AtomicUsize,
}

impl StaticLoader {
    pub(crate) fn with(mut self, settings: UpscaleSettings, model: Arc<dyn InferenceModel>) -> Self {
        self.models.insert(settings, model);
        self
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for StaticLoader {
    fn load(&self, settings: UpscaleSettings) -> UpscaleResult<Arc<dyn InferenceModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        // Keeps concurrent first uses overlapping.
        std::thread::sleep(Duration::from_millis(20));
        self.models
            .get(&settings)
            .cloned()
            .ok_or_else(|| UpscaleError::ModelUnavailable(settings.model_stem()))
    }
}
