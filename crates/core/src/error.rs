//! Error taxonomy for the upscaling pipeline.
//!
//! Only the guaranteed-attempt entry points (`try_upscale`, `upscale_now`)
//! surface these; best-effort paths log them and hand back the original image.

use std::time::Duration;

use thiserror::Error;

pub type UpscaleResult<T> = Result<T, UpscaleError>;

/// Errors shared between concurrent waiters, hence `Clone` and string payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpscaleError {
    /// No backing model on disk for the requested settings.
    #[error("no model available for {0}")]
    ModelUnavailable(String),

    /// Model execution or tensor encoding/decoding failed.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The blocking bridge gave up waiting.
    #[error("upscale timed out after {0:?}")]
    Timeout(Duration),

    /// The destination buffer could not be allocated.
    #[error("cannot allocate {width}x{height} destination buffer")]
    Allocation { width: u32, height: u32 },

    #[error("invalid tile configuration: {0}")]
    InvalidTileConfig(String),
}

impl From<anyhow::Error> for UpscaleError {
    fn from(err: anyhow::Error) -> Self {
        Self::Inference(format!("{err:#}"))
    }
}
