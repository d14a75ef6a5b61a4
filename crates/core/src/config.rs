use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::backend::InferenceBackend;
use crate::model::OnnxModelLoader;
use crate::processor::{DisplayGeometry, UpscaleProcessor, DEFAULT_PROCESS_TIMEOUT};
use crate::service::{ServiceOptions, UpscalerService, DEFAULT_BACKGROUND_PERMITS};
use crate::settings::{DenoiseLevel, ModelFamily, ScaleFactor, UpscaleSettings};
use crate::store::SettingsStore;
use crate::tiling::TileConfig;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "MANGASR_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub upscale: UpscaleConfig,
    pub tiling: TileConfig,
    pub runtime: RuntimeConfig,
    pub cache: CacheConfig,
    pub display: DisplayGeometry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

/// Feature flag and default settings triple.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpscaleConfig {
    pub enabled: bool,
    pub model_family: ModelFamily,
    pub scale_factor: ScaleFactor,
    pub denoise_level: DenoiseLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: InferenceBackend,
    pub process_timeout_ms: u64,
    pub background_permits: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// 0 keeps every result until the cache is cleared.
    pub max_entries: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        let settings = UpscaleSettings::default();
        Self {
            enabled: true,
            model_family: settings.model_family,
            scale_factor: settings.scale_factor,
            denoise_level: settings.denoise_level,
        }
    }
}

impl UpscaleConfig {
    pub fn settings(&self) -> UpscaleSettings {
        UpscaleSettings::new(self.model_family, self.scale_factor, self.denoise_level)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::default(),
            process_timeout_ms: DEFAULT_PROCESS_TIMEOUT.as_millis() as u64,
            background_permits: DEFAULT_BACKGROUND_PERMITS,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            tiling: self.tiling,
            background_permits: self.runtime.background_permits,
            max_cache_entries: self.cache.max_entries,
        }
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.runtime.process_timeout_ms)
    }

    /// Processor for the configured settings, display and blocking timeout.
    pub fn processor(
        &self,
        service: Arc<UpscalerService>,
        store: Arc<dyn SettingsStore>,
        runtime: Handle,
    ) -> UpscaleProcessor {
        UpscaleProcessor::new(service, self.upscale.settings(), store, self.display, runtime)
            .with_timeout(self.process_timeout())
    }

    /// ONNX loader with model and TensorRT cache paths resolved against `data_dir`.
    pub fn model_loader(&self, data_dir: &Path) -> OnnxModelLoader {
        OnnxModelLoader::new(
            resolve_relative_to(data_dir, &self.paths.models_dir),
            self.runtime.backend,
        )
        .with_trt_cache_dir(resolve_relative_to(data_dir, &self.paths.trt_cache_dir))
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. MANGASR_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
