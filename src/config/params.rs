//! Preprocessing and augmentation parameters
//!
//! Callers pass loose `option -> value` maps (typically read from JSON);
//! [`ParamResolver`] merges them over the typed defaults, keeps unknown keys
//! in an `extra` map, and applies the augmentation factor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::error::ConfigError;

const PREPROCESSING: &str = "preprocessing";
const AUGMENTATION: &str = "augmentation";

/// A single option value as it appears in an override map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "integer",
            ParamValue::Float(_) => "float",
            ParamValue::Text(_) => "text",
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Option name to value
pub type ParamOverrides = BTreeMap<String, ParamValue>;

fn expect_bool(section: &'static str, key: &str, value: &ParamValue) -> Result<bool, ConfigError> {
    match value {
        ParamValue::Bool(b) => Ok(*b),
        other => Err(ConfigError::InvalidValue {
            section,
            key: key.to_string(),
            reason: format!("expected bool, got {}", other.type_name()),
        }),
    }
}

fn expect_number(section: &'static str, key: &str, value: &ParamValue) -> Result<f64, ConfigError> {
    value.as_f64().ok_or_else(|| ConfigError::InvalidValue {
        section,
        key: key.to_string(),
        reason: format!("expected number, got {}", value.type_name()),
    })
}

fn expect_count(section: &'static str, key: &str, value: &ParamValue) -> Result<usize, ConfigError> {
    match value {
        ParamValue::Int(i) if *i >= 0 => Ok(*i as usize),
        ParamValue::Float(f) if *f >= 0.0 && f.fract() == 0.0 => Ok(*f as usize),
        other => Err(ConfigError::InvalidValue {
            section,
            key: key.to_string(),
            reason: format!("expected non-negative integer, got {:?}", other),
        }),
    }
}

fn expect_text<'a>(section: &'static str, key: &str, value: &'a ParamValue) -> Result<&'a str, ConfigError> {
    match value {
        ParamValue::Text(s) => Ok(s.as_str()),
        other => Err(ConfigError::InvalidValue {
            section,
            key: key.to_string(),
            reason: format!("expected text, got {}", other.type_name()),
        }),
    }
}

/// Global normalization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMode {
    /// Rescale to `[0, 1]`
    MinMax,
    /// Zero mean, unit variance
    MeanStd,
}

impl std::str::FromStr for NormalizationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "min_max" | "minmax" => Ok(NormalizationMode::MinMax),
            "mean_std" | "meanstd" | "mean" => Ok(NormalizationMode::MeanStd),
            other => Err(format!("unknown normalization mode '{}'", other)),
        }
    }
}

/// How points outside the input are filled after an affine transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    Constant,
    Nearest,
    Reflect,
    Wrap,
}

impl std::str::FromStr for FillMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "constant" => Ok(FillMode::Constant),
            "nearest" => Ok(FillMode::Nearest),
            "reflect" => Ok(FillMode::Reflect),
            "wrap" => Ok(FillMode::Wrap),
            other => Err(format!("unknown fill mode '{}'", other)),
        }
    }
}

/// Preprocessing toggles and their parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingParams {
    /// Random affine augmentation of training batches
    pub augmentation: bool,
    /// Multiplier applied to every numeric augmentation parameter
    pub augmentation_factor: f64,
    pub normalization: bool,
    pub normalization_mode: NormalizationMode,
    pub histogram_equalization: bool,
    /// Fraction clipped from each end of the intensity histogram
    pub histogram_cutoff_percentage: f64,
    /// Accepted and tracked, not applied by the pipeline
    pub remove_vignette_algorithm: bool,
    /// Accepted and tracked, not applied by the pipeline
    pub add_border: bool,
    pub border_width: usize,
    pub per_channel_normalization: bool,
    pub gaussian_blur: bool,
    pub gaussian_blur_radius: usize,
    pub zca_whitening: bool,
    pub connected_components: bool,
}

impl Default for PreprocessingParams {
    fn default() -> Self {
        Self {
            augmentation: false,
            augmentation_factor: 1.0,
            normalization: true,
            normalization_mode: NormalizationMode::MinMax,
            histogram_equalization: false,
            histogram_cutoff_percentage: 0.02,
            remove_vignette_algorithm: false,
            add_border: false,
            border_width: 20,
            per_channel_normalization: false,
            gaussian_blur: false,
            gaussian_blur_radius: 2,
            zca_whitening: false,
            connected_components: false,
        }
    }
}

impl PreprocessingParams {
    /// Set one option by name. Returns `Ok(false)` when the key is not a
    /// recognised preprocessing option.
    pub fn set(&mut self, key: &str, value: &ParamValue) -> Result<bool, ConfigError> {
        let s = PREPROCESSING;
        match key {
            "augmentation" => self.augmentation = expect_bool(s, key, value)?,
            "augmentation_factor" => {
                let factor = expect_number(s, key, value)?;
                if !(factor.is_finite() && factor > 0.0) {
                    return Err(ConfigError::InvalidValue {
                        section: s,
                        key: key.to_string(),
                        reason: format!("factor must be positive, got {}", factor),
                    });
                }
                self.augmentation_factor = factor;
            }
            "normalization" => self.normalization = expect_bool(s, key, value)?,
            "normalization_mode" => {
                self.normalization_mode =
                    expect_text(s, key, value)?
                        .parse()
                        .map_err(|reason| ConfigError::InvalidValue {
                            section: s,
                            key: key.to_string(),
                            reason,
                        })?;
            }
            "histogram_equalization" => self.histogram_equalization = expect_bool(s, key, value)?,
            "histogram_cutoff_percentage" => {
                let p = expect_number(s, key, value)?;
                if !(0.0..0.5).contains(&p) {
                    return Err(ConfigError::InvalidValue {
                        section: s,
                        key: key.to_string(),
                        reason: format!("cutoff must be in [0, 0.5), got {}", p),
                    });
                }
                self.histogram_cutoff_percentage = p;
            }
            "remove_vignette_algorithm" => {
                self.remove_vignette_algorithm = expect_bool(s, key, value)?
            }
            "add_border" => self.add_border = expect_bool(s, key, value)?,
            "border_width" => self.border_width = expect_count(s, key, value)?,
            "per_channel_normalization" => {
                self.per_channel_normalization = expect_bool(s, key, value)?
            }
            "gaussian_blur" => self.gaussian_blur = expect_bool(s, key, value)?,
            "gaussian_blur_radius" => self.gaussian_blur_radius = expect_count(s, key, value)?,
            "zca_whitening" => self.zca_whitening = expect_bool(s, key, value)?,
            "connected_components" => self.connected_components = expect_bool(s, key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Enable flags from keyword substrings of a settings string
    ///
    /// Matching is case-insensitive and cumulative: `AUG`, `HEQ`, `PCN`,
    /// `CC`, `ZCA`, `GAUS`. Flags are only ever switched on.
    pub fn apply_settings_string(&mut self, settings: &str) {
        let settings = settings.to_uppercase();
        let flags: [(&str, &mut bool); 6] = [
            ("AUG", &mut self.augmentation),
            ("HEQ", &mut self.histogram_equalization),
            ("PCN", &mut self.per_channel_normalization),
            ("CC", &mut self.connected_components),
            ("ZCA", &mut self.zca_whitening),
            ("GAUS", &mut self.gaussian_blur),
        ];
        for (keyword, flag) in flags {
            if settings.contains(keyword) {
                *flag = true;
                debug!("Settings keyword {} enabled", keyword);
            }
        }
    }
}

/// Random affine augmentation ranges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationParams {
    /// Degrees
    pub rotation_range: f64,
    pub zoom_range: f64,
    /// Fraction of the width when < 1, pixels otherwise
    pub width_shift_range: f64,
    pub height_shift_range: f64,
    /// Degrees
    pub shear_range: f64,
    pub fill_mode: FillMode,
    pub cval: f64,
    pub horizontal_flip: bool,
    pub vertical_flip: bool,
}

impl Default for AugmentationParams {
    fn default() -> Self {
        Self {
            rotation_range: 30.0,
            zoom_range: 0.1,
            width_shift_range: 0.1,
            height_shift_range: 0.1,
            shear_range: 0.2,
            fill_mode: FillMode::Constant,
            cval: 0.0,
            horizontal_flip: true,
            vertical_flip: true,
        }
    }
}

impl AugmentationParams {
    /// Identity augmentation
    pub fn disabled() -> Self {
        Self {
            rotation_range: 0.0,
            zoom_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            fill_mode: FillMode::Constant,
            cval: 0.0,
            horizontal_flip: false,
            vertical_flip: false,
        }
    }

    /// Whether any random transform can change a sample
    pub fn is_identity(&self) -> bool {
        self.rotation_range == 0.0
            && self.zoom_range == 0.0
            && self.width_shift_range == 0.0
            && self.height_shift_range == 0.0
            && self.shear_range == 0.0
            && !self.horizontal_flip
            && !self.vertical_flip
    }

    /// Set one option by name. Returns `Ok(false)` for unknown keys.
    pub fn set(&mut self, key: &str, value: &ParamValue) -> Result<bool, ConfigError> {
        let s = AUGMENTATION;
        match key {
            "rotation_range" => self.rotation_range = expect_number(s, key, value)?,
            "zoom_range" => self.zoom_range = expect_number(s, key, value)?,
            "width_shift_range" => self.width_shift_range = expect_number(s, key, value)?,
            "height_shift_range" => self.height_shift_range = expect_number(s, key, value)?,
            "shear_range" => self.shear_range = expect_number(s, key, value)?,
            "fill_mode" => {
                self.fill_mode = expect_text(s, key, value)?
                    .parse()
                    .map_err(|reason| ConfigError::InvalidValue {
                        section: s,
                        key: key.to_string(),
                        reason,
                    })?;
            }
            "cval" => self.cval = expect_number(s, key, value)?,
            "horizontal_flip" => self.horizontal_flip = expect_bool(s, key, value)?,
            "vertical_flip" => self.vertical_flip = expect_bool(s, key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Multiply every numeric range (and `cval`) by `factor`
    pub fn scale(&mut self, factor: f64) {
        self.rotation_range *= factor;
        self.zoom_range *= factor;
        self.width_shift_range *= factor;
        self.height_shift_range *= factor;
        self.shear_range *= factor;
        self.cval *= factor;
    }
}

/// Merged parameters for one run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResolvedParams {
    pub preprocessing: PreprocessingParams,
    pub augmentation: AugmentationParams,
    /// Unrecognised preprocessing keys, kept verbatim
    pub preprocessing_extra: ParamOverrides,
    /// Unrecognised augmentation keys (numeric ones are scaled too)
    pub augmentation_extra: ParamOverrides,
}

impl ResolvedParams {
    /// Augmentation used by the training generators: the configured ranges
    /// when the `augmentation` flag is on, identity otherwise.
    pub fn effective_augmentation(&self) -> AugmentationParams {
        if self.preprocessing.augmentation {
            self.augmentation.clone()
        } else {
            AugmentationParams::disabled()
        }
    }

    /// Flattened `name -> value` map of one section plus its extras
    fn section_map<T: Serialize>(typed: &T, extra: &ParamOverrides) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(typed) {
            map.extend(fields);
        }
        for (key, value) in extra {
            if let Ok(v) = serde_json::to_value(value) {
                map.insert(key.clone(), v);
            }
        }
        map
    }

    pub fn preprocessing_map(&self) -> BTreeMap<String, serde_json::Value> {
        Self::section_map(&self.preprocessing, &self.preprocessing_extra)
    }

    pub fn augmentation_map(&self) -> BTreeMap<String, serde_json::Value> {
        Self::section_map(&self.augmentation, &self.augmentation_extra)
    }

    /// Enable flags from a settings string (see [`PreprocessingParams::apply_settings_string`])
    pub fn apply_settings_string(&mut self, settings: &str) {
        self.preprocessing.apply_settings_string(settings);
    }
}

/// Merges caller overrides into the default parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct ParamResolver {
    strict: bool,
}

impl ParamResolver {
    /// Unknown keys are kept and warned about
    pub fn new() -> Self {
        Self { strict: false }
    }

    /// Unknown keys are rejected
    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn resolve(
        &self,
        preprocessing: &ParamOverrides,
        augmentation: &ParamOverrides,
    ) -> Result<ResolvedParams, ConfigError> {
        let mut resolved = ResolvedParams::default();

        for (key, value) in preprocessing {
            if !resolved.preprocessing.set(key, value)? {
                self.unknown(PREPROCESSING, key)?;
                resolved.preprocessing_extra.insert(key.clone(), value.clone());
            }
        }

        for (key, value) in augmentation {
            if !resolved.augmentation.set(key, value)? {
                self.unknown(AUGMENTATION, key)?;
                resolved.augmentation_extra.insert(key.clone(), value.clone());
            }
        }

        let factor = resolved.preprocessing.augmentation_factor;
        if factor != 1.0 {
            resolved.augmentation.scale(factor);
            for value in resolved.augmentation_extra.values_mut() {
                if let Some(v) = value.as_f64() {
                    *value = ParamValue::Float(v * factor);
                }
            }
            debug!("Scaled numeric augmentation parameters by {}", factor);
        }

        Ok(resolved)
    }

    fn unknown(&self, section: &'static str, key: &str) -> Result<(), ConfigError> {
        if self.strict {
            return Err(ConfigError::UnknownOption {
                section,
                key: key.to_string(),
            });
        }
        warn!("Unknown {} option '{}' kept verbatim", section, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, ParamValue)]) -> ParamOverrides {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let resolved = ParamResolver::new()
            .resolve(&ParamOverrides::new(), &ParamOverrides::new())
            .unwrap();
        assert_eq!(resolved.preprocessing, PreprocessingParams::default());
        assert_eq!(resolved.augmentation, AugmentationParams::default());
        assert!(resolved.preprocessing_extra.is_empty());
    }

    #[test]
    fn test_factor_scales_numeric_values_only() {
        let prep = overrides(&[("augmentation_factor", ParamValue::Int(2))]);
        let resolved = ParamResolver::new().resolve(&prep, &ParamOverrides::new()).unwrap();

        assert!((resolved.augmentation.zoom_range - 0.2).abs() < 1e-12);
        assert!((resolved.augmentation.width_shift_range - 0.2).abs() < 1e-12);
        assert!((resolved.augmentation.rotation_range - 60.0).abs() < 1e-12);
        assert!(resolved.augmentation.horizontal_flip);
        assert!(resolved.augmentation.vertical_flip);
        assert_eq!(resolved.augmentation.fill_mode, FillMode::Constant);
    }

    #[test]
    fn test_factor_scales_numeric_extras() {
        let prep = overrides(&[("augmentation_factor", ParamValue::Float(2.0))]);
        let aug = overrides(&[
            ("brightness_shift", ParamValue::Float(0.1)),
            ("interpolation", ParamValue::from("bilinear")),
        ]);
        let resolved = ParamResolver::new().resolve(&prep, &aug).unwrap();

        assert_eq!(
            resolved.augmentation_extra.get("brightness_shift"),
            Some(&ParamValue::Float(0.2))
        );
        assert_eq!(
            resolved.augmentation_extra.get("interpolation"),
            Some(&ParamValue::from("bilinear"))
        );
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let prep = overrides(&[
            ("gaussian_blur", ParamValue::Bool(true)),
            ("gaussian_blur_radius", ParamValue::Int(3)),
            ("normalization_mode", ParamValue::from("mean_std")),
        ]);
        let aug = overrides(&[("fill_mode", ParamValue::from("reflect"))]);
        let resolved = ParamResolver::new().resolve(&prep, &aug).unwrap();

        assert!(resolved.preprocessing.gaussian_blur);
        assert_eq!(resolved.preprocessing.gaussian_blur_radius, 3);
        assert_eq!(resolved.preprocessing.normalization_mode, NormalizationMode::MeanStd);
        assert_eq!(resolved.augmentation.fill_mode, FillMode::Reflect);
    }

    #[test]
    fn test_unknown_keys_kept_or_rejected() {
        let prep = overrides(&[("sharpen", ParamValue::Bool(true))]);

        let resolved = ParamResolver::new().resolve(&prep, &ParamOverrides::new()).unwrap();
        assert_eq!(resolved.preprocessing_extra.get("sharpen"), Some(&ParamValue::Bool(true)));

        let err = ParamResolver::strict()
            .resolve(&prep, &ParamOverrides::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption { key, .. } if key == "sharpen"));
    }

    #[test]
    fn test_wrong_type_is_invalid_value() {
        let prep = overrides(&[("zca_whitening", ParamValue::from("yes"))]);
        let err = ParamResolver::new()
            .resolve(&prep, &ParamOverrides::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_settings_string_sets_named_flags() {
        let mut params = PreprocessingParams::default();
        params.apply_settings_string("aug_heq_cc");

        let expected = PreprocessingParams {
            augmentation: true,
            histogram_equalization: true,
            connected_components: true,
            ..PreprocessingParams::default()
        };
        assert_eq!(params, expected);
    }

    #[test]
    fn test_settings_string_never_clears_flags() {
        let mut params = PreprocessingParams {
            zca_whitening: true,
            ..Default::default()
        };
        params.apply_settings_string("gaus");
        assert!(params.zca_whitening);
        assert!(params.gaussian_blur);
    }

    #[test]
    fn test_param_value_deserializes_untagged() {
        let map: ParamOverrides =
            serde_json::from_str(r#"{"a": true, "b": 2, "c": 0.5, "d": "wrap"}"#).unwrap();
        assert_eq!(map["a"], ParamValue::Bool(true));
        assert_eq!(map["b"], ParamValue::Int(2));
        assert_eq!(map["c"], ParamValue::Float(0.5));
        assert_eq!(map["d"], ParamValue::from("wrap"));
    }

    #[test]
    fn test_effective_augmentation_respects_flag() {
        let mut resolved = ResolvedParams::default();
        assert!(resolved.effective_augmentation().is_identity());
        resolved.preprocessing.augmentation = true;
        assert!(!resolved.effective_augmentation().is_identity());
    }
}
