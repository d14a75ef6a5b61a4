//! Inference model adapter: one loaded model bound to one settings triple.
//!
//! [`InferenceModel`] is the whole-image pass the tiling engine drives;
//! [`OnnxModel`] implements it on an ONNX Runtime session. [`ModelAdapter`]
//! pairs a model (or its absence) with the tiling engine and runs the work on
//! the blocking thread pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use image::{imageops, GrayImage, Luma, Rgba, RgbaImage};
use ndarray::{Array4, ArrayD};
use ort::{session::Session, tensor::TensorElementType, value::Tensor};
use tracing::{debug, info, warn};

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::bitmap::Bitmap;
use crate::error::{UpscaleError, UpscaleResult};
use crate::settings::UpscaleSettings;
use crate::tiling::TilingEngine;

/// Model requires spatial dimensions to be multiples of this.
const PAD_ALIGN: usize = 4;

/// A loaded super-resolution network: one RGBA image in, one `scale`× image out.
pub trait InferenceModel: Send + Sync {
    fn scale(&self) -> u32;

    /// Output must be exactly `width × scale` by `height × scale`.
    fn infer(&self, image: &RgbaImage) -> Result<RgbaImage>;
}

pub struct OnnxModel {
    session: Arc<Mutex<Session>>,
    path: PathBuf,
    scale: u32,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OnnxModel {
    pub fn load(config: &SessionConfig<'_>, scale: u32) -> Result<Self> {
        debug!(
            model = %config.model_path.display(),
            scale,
            backend = %config.backend,
            "Loading ONNX super-resolution model"
        );

        let session = build_session(config)?;

        let (input_name, output_name, is_fp16) = {
            let input = session
                .inputs()
                .first()
                .context("model declares no inputs")?;
            let output = session
                .outputs()
                .first()
                .context("model declares no outputs")?;
            let is_fp16 = matches!(
                input.dtype(),
                ort::value::ValueType::Tensor { ty, .. } if *ty == TensorElementType::Float16
            );
            (input.name().to_string(), output.name().to_string(), is_fp16)
        };

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            path: config.model_path.to_path_buf(),
            scale,
            input_name,
            output_name,
            is_fp16,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    fn run(&self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;
        if self.is_fp16 {
            run_f16_inference(&mut session, &input, &self.input_name, &self.output_name)
        } else {
            run_f32_inference(&mut session, input, &self.input_name, &self.output_name)
        }
    }
}

impl InferenceModel for OnnxModel {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn infer(&self, image: &RgbaImage) -> Result<RgbaImage> {
        let (width, height) = image.dimensions();
        let out_w = width * self.scale;
        let out_h = height * self.scale;

        let input = pad_nchw(rgba_to_nchw(image));
        let output = self.run(input).with_context(|| {
            format!(
                "{} on {width}x{height} input",
                self.path.display()
            )
        })?;

        let alpha = upscale_alpha(image, out_w, out_h);
        nchw_to_rgba(&output, out_w, out_h, alpha.as_ref())
    }
}

/// Interleaved RGBA8 → NCHW `[1,3,H,W]` float32 in 0–1. Alpha is dropped.
fn rgba_to_nchw(image: &RgbaImage) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut nchw = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, px) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            nchw[[0, c, y, x]] = f32::from(px[c]) / 255.0;
        }
    }
    nchw
}

fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - (dim % PAD_ALIGN)) % PAD_ALIGN
}

/// Symmetric reflection: `len, len+1, …` map to `len-1, len-2, …`.
fn mirror(i: usize, len: usize) -> usize {
    let r = i % (2 * len);
    if r < len {
        r
    } else {
        2 * len - 1 - r
    }
}

/// Reflection-pad an NCHW array so H and W are multiples of [`PAD_ALIGN`].
fn pad_nchw(arr: Array4<f32>) -> Array4<f32> {
    let (n, c, h, w) = arr.dim();
    let (pad_h, pad_w) = (pad_amount(h), pad_amount(w));
    if pad_h == 0 && pad_w == 0 {
        return arr;
    }
    Array4::from_shape_fn((n, c, h + pad_h, w + pad_w), |(n, c, y, x)| {
        arr[[n, c, mirror(y, h), mirror(x, w)]]
    })
}

fn run_f32_inference(
    session: &mut Session,
    input: Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let input_tensor = Tensor::from_array(input)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f32>()?;
    Ok(output_view.to_owned())
}

fn run_f16_inference(
    session: &mut Session,
    input: &Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let f32_slice = input
        .as_slice()
        .context("input tensor must be contiguous for f16 conversion")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
    let input_tensor = Tensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let fp16_owned = output_view.as_standard_layout().into_owned();
    let fp16_slice = fp16_owned
        .as_slice()
        .context("output tensor is not contiguous")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ArrayD::from_shape_vec(fp16_owned.shape().to_vec(), f32_data)?)
}

/// Alpha plane resized to the output size, or `None` when the input is opaque.
fn upscale_alpha(image: &RgbaImage, out_w: u32, out_h: u32) -> Option<GrayImage> {
    if image.pixels().all(|px| px[3] == u8::MAX) {
        return None;
    }
    let alpha = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y)[3]])
    });
    Some(imageops::resize(
        &alpha,
        out_w,
        out_h,
        imageops::FilterType::Triangle,
    ))
}

/// NCHW `[1,3,H',W']` float32 (0–1) → RGBA8, cropping padding away.
fn nchw_to_rgba(
    arr: &ArrayD<f32>,
    out_w: u32,
    out_h: u32,
    alpha: Option<&GrayImage>,
) -> Result<RgbaImage> {
    let shape = arr.shape();
    if shape.len() != 4 || shape[1] < 3 {
        bail!("unexpected output tensor shape {shape:?}");
    }
    if shape[2] < out_h as usize || shape[3] < out_w as usize {
        bail!(
            "output tensor {}x{} is smaller than expected {out_w}x{out_h}",
            shape[3],
            shape[2]
        );
    }

    let to_u8 = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
    Ok(RgbaImage::from_fn(out_w, out_h, |x, y| {
        let (xi, yi) = (x as usize, y as usize);
        let a = alpha.map_or(u8::MAX, |plane| plane.get_pixel(x, y)[0]);
        Rgba([
            to_u8(arr[[0, 0, yi, xi]]),
            to_u8(arr[[0, 1, yi, xi]]),
            to_u8(arr[[0, 2, yi, xi]]),
            a,
        ])
    }))
}

/// Resolves a loaded model for a settings triple.
pub trait ModelLoader: Send + Sync {
    /// Blocking; the service calls this from the blocking thread pool.
    fn load(&self, settings: UpscaleSettings) -> UpscaleResult<Arc<dyn InferenceModel>>;
}

/// Loads `{models_dir}/{family}_noise{n}_scale{k}x.onnx`.
#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    models_dir: PathBuf,
    backend: InferenceBackend,
    trt_cache_dir: Option<PathBuf>,
}

impl OnnxModelLoader {
    pub fn new(models_dir: impl Into<PathBuf>, backend: InferenceBackend) -> Self {
        Self {
            models_dir: models_dir.into(),
            backend,
            trt_cache_dir: None,
        }
    }

    pub fn with_trt_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trt_cache_dir = Some(dir.into());
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn model_path(&self, settings: &UpscaleSettings) -> PathBuf {
        self.models_dir
            .join(format!("{}.onnx", settings.model_stem()))
    }

    /// Whether a model file for these settings is on disk and its family is supported.
    pub fn is_present(&self, settings: &UpscaleSettings) -> bool {
        settings.model_family.is_implemented() && self.model_path(settings).is_file()
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, settings: UpscaleSettings) -> UpscaleResult<Arc<dyn InferenceModel>> {
        if !settings.model_family.is_implemented() {
            return Err(UpscaleError::ModelUnavailable(format!(
                "{settings} ({} models are not supported yet)",
                settings.model_family.display_name()
            )));
        }

        let model_path = self.model_path(&settings);
        if !model_path.is_file() {
            return Err(UpscaleError::ModelUnavailable(
                model_path.display().to_string(),
            ));
        }

        let started = Instant::now();
        let config = SessionConfig {
            model_path: &model_path,
            backend: self.backend,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
        };
        let model = OnnxModel::load(&config, settings.scale())?;

        info!(
            model = %model_path.display(),
            backend = %self.backend,
            fp16 = model.is_fp16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model loaded"
        );
        Ok(Arc::new(model))
    }
}

/// Wraps one model (or its absence) for one settings triple.
#[derive(Clone)]
pub struct ModelAdapter {
    settings: UpscaleSettings,
    model: Option<Arc<dyn InferenceModel>>,
    engine: TilingEngine,
}

impl ModelAdapter {
    pub fn new(settings: UpscaleSettings, model: Arc<dyn InferenceModel>, engine: TilingEngine) -> Self {
        Self {
            settings,
            model: Some(model),
            engine,
        }
    }

    /// An adapter with no backing model; it passes every image through.
    pub fn unavailable(settings: UpscaleSettings, engine: TilingEngine) -> Self {
        Self {
            settings,
            model: None,
            engine,
        }
    }

    pub fn settings(&self) -> UpscaleSettings {
        self.settings
    }

    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    /// Upscales `image`, surfacing failures. Unavailable adapters return the input.
    pub async fn try_upscale(&self, image: &Bitmap) -> UpscaleResult<Bitmap> {
        let Some(model) = self.model.clone() else {
            return Ok(image.clone());
        };

        let engine = self.engine.clone();
        let source = image.clone();
        let started = Instant::now();
        let pixels = tokio::task::spawn_blocking(move || engine.upscale(&*model, source.as_rgba()))
            .await
            .map_err(|err| UpscaleError::Inference(format!("inference task failed: {err}")))??;

        debug!(
            settings = %self.settings,
            width = image.width(),
            height = image.height(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upscale finished"
        );
        Ok(image.derive(pixels))
    }

    /// Best-effort upscale: any failure is logged and the input comes back.
    pub async fn upscale(&self, image: &Bitmap) -> Bitmap {
        match self.try_upscale(image).await {
            Ok(result) => result,
            Err(err) => {
                warn!(settings = %self.settings, error = %err, "Upscale failed, returning original");
                image.clone()
            }
        }
    }
}
