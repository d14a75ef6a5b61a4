//! ONNX Runtime session construction: CPU, CUDA EP and TensorRT EP.
//!
//! [`build_session`] registers the execution providers for the requested
//! [`InferenceBackend`], with TensorRT engine caching when asked for.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Inference backend selection.
///
/// Default is `Cpu`, which works everywhere. `Cuda` and `Tensorrt` need the
/// matching runtime libraries; when they are missing ORT falls back to CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Number of built TensorRT engines in `dir`. Missing dirs count as empty.
fn cached_engine_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "engine"))
                .count()
        })
        .unwrap_or(0)
}

/// Build an `ort::Session` with the requested backend and fallback chain.
///
/// - `Tensorrt`: TRT EP with engine caching, then CUDA EP as fallback.
/// - `Cuda`: CUDA EP only.
/// - `Cpu`: no execution providers registered.
///
/// If the GPU providers are unavailable, ORT runs the model on CPU.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let load_context = || format!("Failed to load ONNX model: {}", config.model_path.display());

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));

            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let engines = cached_engine_count(cache_dir);
            if engines == 0 {
                info!(
                    model = %config.model_path.display(),
                    "No cached TensorRT engine, building one; this can take minutes"
                );
            }
            let started = Instant::now();

            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().into_owned())
                        .with_fp16(true)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(load_context)
                .inspect(|_| {
                    debug!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        engines_before = engines,
                        engines_after = cached_engine_count(cache_dir),
                        "TensorRT session ready"
                    );
                })?
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session on CPU");
            builder
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
    };

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str_lossy() {
        assert_eq!(InferenceBackend::from_str_lossy("cpu"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy("CUDA"), InferenceBackend::Cuda);
        assert_eq!(InferenceBackend::from_str_lossy("gpu"), InferenceBackend::Cuda);
        assert_eq!(
            InferenceBackend::from_str_lossy("TensorRT"),
            InferenceBackend::Tensorrt
        );
        assert_eq!(InferenceBackend::from_str_lossy("trt"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy("unknown"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy(""), InferenceBackend::Cpu);
    }

    #[test]
    fn test_backend_default_and_display() {
        assert_eq!(InferenceBackend::default(), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::Cpu.to_string(), "cpu");
        assert_eq!(InferenceBackend::Cuda.to_string(), "cuda");
        assert_eq!(InferenceBackend::Tensorrt.to_string(), "tensorrt");
    }

    #[test]
    fn cached_engines_are_counted_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(cached_engine_count(dir.path()), 0);

        std::fs::write(dir.path().join("waifu2x_graph_sm86.engine"), [0u8; 4]).unwrap();
        std::fs::write(dir.path().join("waifu2x_graph_sm86.profile"), [0u8; 4]).unwrap();
        assert_eq!(cached_engine_count(dir.path()), 1);
        assert_eq!(cached_engine_count(&dir.path().join("missing")), 0);
    }
}
