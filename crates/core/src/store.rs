//! The external settings store: the "upscaling enabled" flag and the default
//! settings triple.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use tracing::info;

use crate::config::{AppConfig, UpscaleConfig};
use crate::settings::UpscaleSettings;

pub trait SettingsStore: Send + Sync {
    fn upscaling_enabled(&self) -> bool;

    fn default_settings(&self) -> UpscaleSettings;
}

/// In-process store; nothing is persisted.
#[derive(Debug)]
pub struct MemorySettingsStore {
    enabled: AtomicBool,
    settings: RwLock<UpscaleSettings>,
}

impl MemorySettingsStore {
    pub fn new(enabled: bool, settings: UpscaleSettings) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            settings: RwLock::new(settings),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_default_settings(&self, settings: UpscaleSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new(true, UpscaleSettings::default())
    }
}

impl SettingsStore for MemorySettingsStore {
    fn upscaling_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn default_settings(&self) -> UpscaleSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Backed by the `[upscale]` section of `config.toml`.
#[derive(Debug)]
pub struct ConfigSettingsStore {
    path: PathBuf,
    section: RwLock<UpscaleConfig>,
}

impl ConfigSettingsStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = AppConfig::load_from_path(&path)?;
        Ok(Self {
            path,
            section: RwLock::new(config.upscale),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file, picking up edits made by other processes.
    pub fn reload(&self) -> Result<()> {
        let config = AppConfig::load_from_path(&self.path)?;
        *self.section.write().unwrap_or_else(PoisonError::into_inner) = config.upscale;
        Ok(())
    }

    /// Updates the flag and writes it back, keeping the rest of the file's settings.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        let mut config = AppConfig::load_from_path(&self.path)?;
        config.upscale.enabled = enabled;
        config.save_to_path(&self.path)?;
        *self.section.write().unwrap_or_else(PoisonError::into_inner) = config.upscale;
        info!(enabled, path = %self.path.display(), "Upscaling flag updated");
        Ok(())
    }
}

impl SettingsStore for ConfigSettingsStore {
    fn upscaling_enabled(&self) -> bool {
        self.section
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enabled
    }

    fn default_settings(&self) -> UpscaleSettings {
        self.section
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .settings()
    }
}
