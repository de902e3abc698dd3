//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/beamline.toml`)
//! 2. environment variables prefixed with `BEAMLINE_`; nested keys are
//!    separated by a double underscore, e.g.
//!    `BEAMLINE_WORKFLOW__TRIGGER_TIMEOUT_MS=30000`
//!
//! Every component receives its own record (`AxisSpec`, `WorkflowSettings`,
//! `DecompositionSettings`, ...) from here; nothing reads global state.
//!
//! # Example
//! ```no_run
//! use beamline_positioner::config::BeamlineConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BeamlineConfig::load()?;
//! let stage = config.active()?;
//! println!("{} axes on {}", stage.axes.len(), stage.name);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{AppResult, PositionerError};
use crate::motion::axis::AxisSpec;
use crate::motion::controllers::{VelocityConfig, WorkPointConfig};
use crate::motion::decomposition::DecompositionSettings;
use crate::workflow::operations::ImagingSettings;
use crate::workflow::scheduler::WorkflowSettings;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/beamline.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamlineConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Scheduler settings
    #[serde(default)]
    pub workflow: WorkflowSettings,
    /// Decomposition solver settings
    #[serde(default)]
    pub decomposition: DecompositionSettings,
    /// Imaging acquisition settings
    #[serde(default)]
    pub imaging: ImagingSettings,
    /// Name of the stage selected at startup
    pub active_stage: String,
    /// Stage definitions
    pub stages: Vec<StageConfig>,
    /// Detectors
    #[serde(default)]
    pub detectors: Vec<DetectorConfig>,
    /// Beam source
    #[serde(default)]
    pub source: Option<SourceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One patient stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage name
    pub name: String,
    /// Axes, any order; sorted by `order` when the chain is built
    pub axes: Vec<AxisSpec>,
    /// Speed control
    #[serde(default)]
    pub velocity: Option<VelocityConfig>,
    /// Rotation pivot control
    #[serde(default)]
    pub work_point: Option<WorkPointConfig>,
}

/// Detector definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Unique detector name
    pub name: String,
    /// Control-system address
    pub address: String,
}

/// Beam source definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Control-system address
    pub address: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

impl BeamlineConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment, then validate
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAMLINE_").split("__"))
            .extract()?;
        config.validate().map_err(PositionerError::Configuration)?;
        Ok(config)
    }

    /// Parse and validate a TOML document (no environment overrides)
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config: Self = Figment::from(Toml::string(toml)).extract()?;
        config.validate().map_err(PositionerError::Configuration)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let tolerance = self.decomposition.tolerance_mm;
        if !tolerance.is_finite() || tolerance <= 0.0 {
            return Err(format!("decomposition.tolerance_mm must be positive, got {}", tolerance));
        }
        if self.decomposition.max_iterations == 0 {
            return Err("decomposition.max_iterations must be at least 1".to_string());
        }

        let imaging = &self.imaging;
        if !imaging.scan_duration_s.is_finite() || imaging.scan_duration_s <= 0.0 {
            return Err(format!(
                "imaging.scan_duration_s must be positive, got {}",
                imaging.scan_duration_s
            ));
        }
        if imaging.scan_dof.is_rotation() {
            return Err(format!("imaging.scan_dof must be a translation, got {}", imaging.scan_dof));
        }
        if !imaging.rotation_dof.is_rotation() {
            return Err(format!(
                "imaging.rotation_dof must be a rotation, got {}",
                imaging.rotation_dof
            ));
        }

        if self.stages.is_empty() {
            return Err("At least one stage must be configured".to_string());
        }
        let mut stage_names = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err("Stage name must not be empty".to_string());
            }
            if !stage_names.insert(stage.name.as_str()) {
                return Err(format!("Duplicate stage name: {}", stage.name));
            }
            stage.validate()?;
        }
        if !stage_names.contains(self.active_stage.as_str()) {
            return Err(format!("Unknown active_stage '{}'", self.active_stage));
        }

        let mut detector_names = HashSet::new();
        for detector in &self.detectors {
            if detector.name.trim().is_empty() || detector.address.trim().is_empty() {
                return Err("Detector name and address must not be empty".to_string());
            }
            if !detector_names.insert(detector.name.as_str()) {
                return Err(format!("Duplicate detector name: {}", detector.name));
            }
        }
        if let Some(wanted) = &imaging.detector {
            if !detector_names.contains(wanted.as_str()) {
                return Err(format!("imaging.detector '{}' is not configured", wanted));
            }
        }
        if let Some(source) = &self.source {
            if source.address.trim().is_empty() {
                return Err("source.address must not be empty".to_string());
            }
        }

        Ok(())
    }

    /// Stage by name
    pub fn select_stage(&self, name: &str) -> AppResult<&StageConfig> {
        self.stages
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| PositionerError::Configuration(format!("Unknown stage '{}'", name)))
    }

    /// The stage named by `active_stage`
    pub fn active(&self) -> AppResult<&StageConfig> {
        self.select_stage(&self.active_stage)
    }

    /// Detector used for imaging: `imaging.detector` or the first one
    pub fn imaging_detector(&self) -> Option<&DetectorConfig> {
        match &self.imaging.detector {
            Some(name) => self.detectors.iter().find(|d| &d.name == name),
            None => self.detectors.first(),
        }
    }
}

impl StageConfig {
    /// Validate the stage's axis table
    pub fn validate(&self) -> Result<(), String> {
        if self.axes.is_empty() {
            return Err(format!("Stage '{}' has no axes", self.name));
        }
        let mut names = HashSet::new();
        let mut orders = HashSet::new();
        for axis in &self.axes {
            let context = format!("Stage '{}' axis '{}'", self.name, axis.name);
            if axis.name.trim().is_empty() {
                return Err(format!("Stage '{}' has an axis without a name", self.name));
            }
            if !names.insert(axis.name.as_str()) {
                return Err(format!("{}: duplicate axis name", context));
            }
            if !orders.insert(axis.order) {
                return Err(format!("{}: duplicate order {}", context, axis.order));
            }
            if axis.direction != 1 && axis.direction != -1 {
                return Err(format!("{}: direction must be +1 or -1, got {}", context, axis.direction));
            }
            let numbers = [
                axis.size,
                axis.precision,
                axis.backlash,
                axis.limits[0],
                axis.limits[1],
                axis.work_distance[0],
                axis.work_distance[1],
                axis.work_distance[2],
            ];
            if !finite(&numbers) {
                return Err(format!("{}: values must be finite", context));
            }
            if axis.lower() >= axis.upper() {
                return Err(format!(
                    "{}: lower limit {} must be below upper limit {}",
                    context,
                    axis.lower(),
                    axis.upper()
                ));
            }
            if axis.size < 0.0 || axis.precision < 0.0 || axis.backlash < 0.0 {
                return Err(format!("{}: size, precision and backlash must not be negative", context));
            }
            if axis.address.trim().is_empty() {
                return Err(format!("{}: address must not be empty", context));
            }
        }
        if let Some(velocity) = &self.velocity {
            if !velocity.max_speed.is_finite() || velocity.max_speed <= 0.0 {
                return Err(format!("Stage '{}': velocity.max_speed must be positive", self.name));
            }
        }
        if let Some(work_point) = &self.work_point {
            if !finite(&work_point.offset) {
                return Err(format!("Stage '{}': work_point.offset must be finite", self.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::pose::Dof;
    use std::io::Write;

    const SAMPLE: &str = r#"
active_stage = "DynMRT"

[application]
name = "Test Positioner"
log_level = "debug"

[workflow]
trigger_timeout_ms = 30000

[[stages]]
name = "DynMRT"

  [[stages.axes]]
  name = "x"
  dof = "tx"
  order = 0
  limits = [-100.0, 100.0]
  precision = 0.01
  address = "SR08ID01:X"

  [[stages.axes]]
  name = "rz"
  dof = "rz"
  order = 1
  direction = -1
  frame = "local"
  work_distance = [100.0, 0.0, 0.0]
  limits = [-90.0, 90.0]
  address = "SR08ID01:RZ"

  [stages.velocity]
  address = "SR08ID01:SPEED"
  max_speed = 20.0

[[detectors]]
name = "ruby"
address = "SR08ID01DET:RUBY"

[source]
address = "SR08ID01:SHUTTER"
"#;

    fn sample() -> BeamlineConfig {
        BeamlineConfig::from_toml_str(SAMPLE).unwrap()
    }

    #[test]
    fn parses_sample_with_defaults() {
        let config = sample();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.workflow.trigger_timeout_ms, 30000);
        assert!(config.workflow.abort_on_error);
        assert_eq!(config.decomposition, DecompositionSettings::default());
        assert_eq!(config.imaging.scan_dof, Dof::Tz);

        let stage = config.active().unwrap();
        assert_eq!(stage.axes.len(), 2);
        assert_eq!(stage.axes[0].direction, 1);
        assert_eq!(stage.axes[1].direction, -1);
        assert_eq!(stage.axes[1].work_distance, [100.0, 0.0, 0.0]);
        assert_eq!(config.imaging_detector().unwrap().name, "ruby");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = BeamlineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.active_stage, "DynMRT");
    }

    #[test]
    fn rejects_inverted_limits() {
        let mut config = sample();
        config.stages[0].axes[0].limits = [10.0, -10.0];
        let err = config.validate().unwrap_err();
        assert!(err.contains("lower limit"));
    }

    #[test]
    fn rejects_bad_direction_and_duplicate_order() {
        let mut config = sample();
        config.stages[0].axes[0].direction = 2;
        assert!(config.validate().unwrap_err().contains("direction"));

        let mut config = sample();
        config.stages[0].axes[1].order = 0;
        assert!(config.validate().unwrap_err().contains("duplicate order"));
    }

    #[test]
    fn rejects_unknown_active_stage() {
        let mut config = sample();
        config.active_stage = "Nope".into();
        assert!(config.validate().unwrap_err().contains("active_stage"));
        assert!(matches!(
            config.select_stage("Nope"),
            Err(PositionerError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_non_finite_and_negative_values() {
        let mut config = sample();
        config.stages[0].axes[0].precision = -0.1;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.stages[0].axes[1].work_distance[2] = f64::NAN;
        assert!(config.validate().unwrap_err().contains("finite"));
    }

    #[test]
    fn rejects_bad_solver_settings() {
        let mut config = sample();
        config.decomposition.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.decomposition.tolerance_mm = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_entries_fail_at_load_time() {
        let broken = SAMPLE.replace("dof = \"tx\"", "dof = \"tw\"");
        assert!(matches!(
            BeamlineConfig::from_toml_str(&broken),
            Err(PositionerError::Config(_))
        ));

        let invalid = SAMPLE.replace("log_level = \"debug\"", "log_level = \"loud\"");
        assert!(matches!(
            BeamlineConfig::from_toml_str(&invalid),
            Err(PositionerError::Configuration(_))
        ));
    }
}
