//! Scan configuration structs, loading and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::detection::ThresholdKind;
use crate::grid::Polygon;
use crate::types::{LagMode, Phase};

/// Environment variable pointing at a config file.
pub const CONFIG_ENV: &str = "BRIGHTNESS_CONFIG";

/// Config file looked for in the working directory.
pub const LOCAL_CONFIG: &str = "scan_config.toml";

// ============================================================================
// Top-level Config
// ============================================================================

/// Complete configuration for one brightness scan.
///
/// Every section and field has a default, so an empty file (or no file)
/// yields a runnable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub grid: GridConfig,

    #[serde(default)]
    pub stack: StackConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub template: TemplateConfig,

    #[serde(default)]
    pub memory: MemoryConfig,
}

impl ScanConfig {
    /// Load configuration using the standard search order:
    /// 1. `$BRIGHTNESS_CONFIG` environment variable
    /// 2. `./scan_config.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded scan config from {CONFIG_ENV}");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {CONFIG_ENV}, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{CONFIG_ENV} points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded scan config from ./{LOCAL_CONFIG}");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{LOCAL_CONFIG}, using defaults");
                }
            }
        }

        info!("No {LOCAL_CONFIG} found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path. Unknown keys are warned about;
    /// parse and validation failures are errors.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        info!(path = %path.display(), "Scan config saved");
        Ok(())
    }

    /// Check internal consistency. Collects every problem before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let finite = [
            ("grid.ps_ratio", self.grid.ps_ratio),
            ("stack.clip_level", self.stack.clip_level),
            ("detection.threshold", self.detection.threshold),
            ("detection.min_separation_s", self.detection.min_separation_s),
            ("template.length_s", self.template.length_s),
            ("template.pre_pick_s", self.template.pre_pick_s),
            ("template.coherence_a", self.template.coherence_a),
            ("template.coherence_b", self.template.coherence_b),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                errors.push(format!("{name} must be a finite number (got {value})"));
            }
        }

        if self.grid.ps_ratio <= 0.0 {
            errors.push(format!("grid.ps_ratio ({}) must be > 0", self.grid.ps_ratio));
        }
        if let Some(t) = self.grid.dedup_threshold_s {
            if !t.is_finite() || t < 0.0 {
                errors.push(format!("grid.dedup_threshold_s ({t}) must be >= 0"));
            }
        }
        if let Some(v) = &self.grid.volume {
            if v.max_depth_km <= v.min_depth_km {
                errors.push(format!(
                    "grid.volume.max_depth_km ({:.2}) must be > min_depth_km ({:.2})",
                    v.max_depth_km, v.min_depth_km
                ));
            }
        }

        if self.stack.clip_level <= 0.0 {
            errors.push(format!("stack.clip_level ({}) must be > 0", self.stack.clip_level));
        }
        if self.stack.cores == 0 {
            errors.push("stack.cores must be > 0".to_string());
        }

        if self.detection.threshold <= 0.0 {
            errors.push(format!("detection.threshold ({}) must be > 0", self.detection.threshold));
        }
        if self.detection.min_separation_s < 0.0 {
            errors.push("detection.min_separation_s must be >= 0".to_string());
        }

        if self.template.length_s <= 0.0 {
            errors.push(format!("template.length_s ({}) must be > 0", self.template.length_s));
        }
        if self.template.pre_pick_s < 0.0 {
            errors.push("template.pre_pick_s must be >= 0".to_string());
        }
        if self.template.coherence_b == 0.0 {
            errors.push("template.coherence_b must be non-zero (used as divisor)".to_string());
        }
        if let Some([start, end]) = self.template.coherence_clip {
            if !(start.is_finite() && end.is_finite()) || start < 0.0 || end <= start {
                errors.push(format!(
                    "template.coherence_clip [{start}, {end}] must satisfy 0 <= start < end"
                ));
            }
        }

        let (range_errors, range_warnings) = super::validation::validate_ranges(self);
        errors.extend(range_errors);
        for w in &range_warnings {
            warn!("{}", w);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {e}"),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {e}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Grid
// ============================================================================

/// Travel-time grid loading and reduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Phase of the grid files to prefer
    #[serde(default = "default_phase")]
    pub phase: Phase,

    /// Phase the lag table is expressed in
    #[serde(default = "default_phase")]
    pub output_phase: Phase,

    /// Vp/Vs ratio used to convert between phases
    #[serde(default = "default_ps_ratio")]
    pub ps_ratio: f64,

    #[serde(default)]
    pub lag_mode: LagMode,

    /// Drop nodes whose summed lag difference to a kept node is at or below this (s)
    #[serde(default)]
    pub dedup_threshold_s: Option<f64>,

    /// Optional cut to a depth range inside a horizontal polygon
    #[serde(default)]
    pub volume: Option<VolumeConfig>,
}

fn default_phase() -> Phase {
    Phase::S
}
fn default_ps_ratio() -> f64 {
    1.68
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            phase: default_phase(),
            output_phase: default_phase(),
            ps_ratio: default_ps_ratio(),
            lag_mode: LagMode::default(),
            dedup_threshold_s: None,
            volume: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub min_depth_km: f64,
    pub max_depth_km: f64,
    /// `[[lon, lat], ...]`, at least three vertices
    pub polygon: Polygon,
}

// ============================================================================
// Stacking
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Energy above `clip_level * mean` is clipped
    #[serde(default = "default_clip_level")]
    pub clip_level: f64,

    /// Requested stacking workers
    #[serde(default = "default_cores")]
    pub cores: usize,
}

fn default_clip_level() -> f64 {
    100.0
}
fn default_cores() -> usize {
    1
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            clip_level: default_clip_level(),
            cores: default_cores(),
        }
    }
}

// ============================================================================
// Detection
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Multiplier for MAD/RMS, or the absolute level
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// `MAD`, `RMS` or `abs`
    #[serde(default = "default_threshold_kind")]
    pub threshold_kind: ThresholdKind,

    /// Minimum time between detections (s)
    #[serde(default = "default_min_separation")]
    pub min_separation_s: f64,
}

fn default_threshold() -> f64 {
    10.0
}
fn default_threshold_kind() -> ThresholdKind {
    ThresholdKind::Mad
}
fn default_min_separation() -> f64 {
    2.0
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            threshold_kind: default_threshold_kind(),
            min_separation_s: default_min_separation(),
        }
    }
}

// ============================================================================
// Templates
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Template length (s)
    #[serde(default = "default_template_length")]
    pub length_s: f64,

    /// Seconds before each pick the template starts
    #[serde(default = "default_pre_pick")]
    pub pre_pick_s: f64,

    /// Acceptance: coherence > a - channels / b
    #[serde(default = "default_coherence_a")]
    pub coherence_a: f64,

    #[serde(default = "default_coherence_b")]
    pub coherence_b: f64,

    /// Stations used for coherence; empty means all
    #[serde(default)]
    pub coherence_stations: Vec<String>,

    /// `[start, end]` seconds within each template used for coherence
    #[serde(default)]
    pub coherence_clip: Option<[f64; 2]>,
}

fn default_template_length() -> f64 {
    1.0
}
fn default_pre_pick() -> f64 {
    0.2
}
fn default_coherence_a() -> f64 {
    0.5
}
fn default_coherence_b() -> f64 {
    100.0
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            length_s: default_template_length(),
            pre_pick_s: default_pre_pick(),
            coherence_a: default_coherence_a(),
            coherence_b: default_coherence_b(),
            coherence_stations: Vec::new(),
            coherence_clip: None,
        }
    }
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Spill node energies to scratch files instead of holding them all
    #[serde(default)]
    pub conserve: bool,

    /// Parent directory for the instance scratch directory
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Run-instance identifier; generated when unset
    #[serde(default)]
    pub instance: Option<String>,
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            conserve: false,
            scratch_dir: default_scratch_dir(),
            instance: None,
        }
    }
}

impl MemoryConfig {
    /// The configured instance id, or one unique to this process and moment.
    pub fn instance_id(&self) -> String {
        self.instance.clone().unwrap_or_else(|| {
            format!(
                "{}-{}",
                std::process::id(),
                chrono::Utc::now().format("%Y%m%dT%H%M%S%6f")
            )
        })
    }
}
