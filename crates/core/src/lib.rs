//! On-device super-resolution for manga pages.

pub mod backend;
pub mod bitmap;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod processor;
pub mod service;
pub mod settings;
pub mod store;
pub mod tiling;

#[cfg(test)]
mod test_support;

pub use bitmap::Bitmap;
pub use error::{UpscaleError, UpscaleResult};
pub use processor::{ImageProcessor, UpscaleProcessor};
pub use service::UpscalerService;
pub use settings::{DenoiseLevel, ModelFamily, ScaleFactor, UpscaleSettings};
