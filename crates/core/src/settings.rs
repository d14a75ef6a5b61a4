//! Closed sets of supported model families, scale factors and denoise levels.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Line art and flat colour; the usual choice for manga pages.
    #[default]
    Anime,
    /// Photographs and painted colour pages.
    Photo,
    /// Listed for settings compatibility; no models ship for it yet.
    RealCugan,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 3] = [Self::Anime, Self::Photo, Self::RealCugan];

    /// Filename prefix used when resolving model files.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Anime => "anime",
            Self::Photo => "photo",
            Self::RealCugan => "realcugan",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Anime => "waifu2x Anime",
            Self::Photo => "waifu2x Photo",
            Self::RealCugan => "Real-CUGAN",
        }
    }

    pub fn is_implemented(self) -> bool {
        !matches!(self, Self::RealCugan)
    }

    /// Parse from string (case-insensitive). Returns `Anime` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "photo" => Self::Photo,
            "realcugan" | "real-cugan" | "real_cugan" | "cugan" => Self::RealCugan,
            _ => Self::Anime,
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleFactor {
    #[default]
    X2,
    X4,
}

impl ScaleFactor {
    pub const ALL: [ScaleFactor; 2] = [Self::X2, Self::X4];

    pub fn value(self) -> u32 {
        match self {
            Self::X2 => 2,
            Self::X4 => 4,
        }
    }

    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            2 => Some(Self::X2),
            4 => Some(Self::X4),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::X2 => "2×",
            Self::X4 => "4×",
        }
    }
}

impl fmt::Display for ScaleFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.value())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenoiseLevel {
    None,
    Low,
    #[default]
    Medium,
    High,
    Highest,
}

impl DenoiseLevel {
    pub const ALL: [DenoiseLevel; 5] = [
        Self::None,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::Highest,
    ];

    /// Numeric level as used in model filenames; `-1` disables denoising.
    pub fn value(self) -> i8 {
        match self {
            Self::None => -1,
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Highest => 3,
        }
    }

    pub fn from_value(value: i8) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.value() == value)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Highest => "Highest",
        }
    }
}

impl fmt::Display for DenoiseLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// One (family, factor, denoise) combination; selects exactly one model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleSettings {
    pub model_family: ModelFamily,
    pub scale_factor: ScaleFactor,
    pub denoise_level: DenoiseLevel,
}

impl UpscaleSettings {
    pub fn new(
        model_family: ModelFamily,
        scale_factor: ScaleFactor,
        denoise_level: DenoiseLevel,
    ) -> Self {
        Self {
            model_family,
            scale_factor,
            denoise_level,
        }
    }

    /// Format: `{family}_noise{denoise}_scale{factor}x`
    pub fn model_stem(&self) -> String {
        format!(
            "{}_noise{}_scale{}x",
            self.model_family.slug(),
            self.denoise_level.value(),
            self.scale_factor.value()
        )
    }

    pub fn scale(&self) -> u32 {
        self.scale_factor.value()
    }

    /// Every combination the enums allow, implemented or not.
    pub fn all() -> impl Iterator<Item = UpscaleSettings> {
        ModelFamily::ALL.into_iter().flat_map(|family| {
            ScaleFactor::ALL.into_iter().flat_map(move |factor| {
                DenoiseLevel::ALL
                    .into_iter()
                    .map(move |noise| UpscaleSettings::new(family, factor, noise))
            })
        })
    }
}

impl fmt::Display for UpscaleSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.model_stem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn model_stem_follows_naming_scheme() {
        let settings = UpscaleSettings::new(ModelFamily::Anime, ScaleFactor::X2, DenoiseLevel::Medium);
        assert_eq!(settings.model_stem(), "anime_noise1_scale2x");

        let settings = UpscaleSettings::new(ModelFamily::Photo, ScaleFactor::X4, DenoiseLevel::None);
        assert_eq!(settings.model_stem(), "photo_noise-1_scale4x");
    }

    #[test]
    fn every_combination_has_a_distinct_stem() {
        let stems: HashSet<String> = UpscaleSettings::all().map(|s| s.model_stem()).collect();
        assert_eq!(stems.len(), 3 * 2 * 5);
    }

    #[test]
    fn family_from_str_lossy() {
        assert_eq!(ModelFamily::from_str_lossy("PHOTO"), ModelFamily::Photo);
        assert_eq!(ModelFamily::from_str_lossy("real-cugan"), ModelFamily::RealCugan);
        assert_eq!(ModelFamily::from_str_lossy("anything"), ModelFamily::Anime);
        assert!(!ModelFamily::RealCugan.is_implemented());
    }

    #[test]
    fn numeric_conversions() {
        assert_eq!(ScaleFactor::from_value(4), Some(ScaleFactor::X4));
        assert_eq!(ScaleFactor::from_value(3), None);
        assert_eq!(DenoiseLevel::from_value(-1), Some(DenoiseLevel::None));
        assert_eq!(DenoiseLevel::from_value(3), Some(DenoiseLevel::Highest));
        assert_eq!(DenoiseLevel::from_value(4), None);
    }

    #[test]
    fn settings_toml_uses_snake_case() {
        let settings = UpscaleSettings::new(ModelFamily::RealCugan, ScaleFactor::X4, DenoiseLevel::High);
        let encoded = toml::to_string(&settings).expect("serialize settings");
        assert!(encoded.contains("model_family = \"real_cugan\""));
        assert!(encoded.contains("scale_factor = \"x4\""));
        let decoded: UpscaleSettings = toml::from_str(&encoded).expect("deserialize settings");
        assert_eq!(decoded, settings);
    }
}
