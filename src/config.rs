use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use app_dirs2::{app_root, AppDataType, AppInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::CalibrationSet;
use crate::optics::OpticalParameters;

pub const APP_INFO: AppInfo = AppInfo {
    name: "fishtrace",
    author: "FishTrace",
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    AppDirs(#[from] app_dirs2::AppDirsError),
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Allometric and volumetric shape constants for the measured species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeciesProfile {
    pub name: String,
    /// `a` in the length-weight relation `W = a L^b`, grams per cm^b.
    pub weight_coeff: f64,
    /// `b` in the length-weight relation.
    pub weight_exponent: f64,
    /// Share of the allometric estimate in the final weight; the rest
    /// comes from the ellipsoid volume model.
    pub allometric_blend: f64,
    pub tissue_density_g_cm3: f64,
    /// Fraction of the bounding ellipsoid the body actually fills.
    pub form_factor: f64,
}

impl Default for SpeciesProfile {
    fn default() -> Self {
        SpeciesProfile {
            name: "rainbow trout".to_string(),
            weight_coeff: 0.0139,
            weight_exponent: 3.02,
            allometric_blend: 1.0,
            tissue_density_g_cm3: 1.04,
            form_factor: 0.76,
        }
    }
}

/// Review bounds for fused records. Breaching one attaches a warning to
/// the record, it never aborts the capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlausibilityLimits {
    pub min_length_cm: f64,
    pub max_length_cm: f64,
    pub min_condition_k: f64,
    pub max_condition_k: f64,
    pub min_height_ratio: f64,
    pub max_height_ratio: f64,
    pub max_width_ratio: f64,
    pub max_weight_deviation: f64,
    pub min_occupancy: f64,
    pub max_occupancy: f64,
    pub max_area_inversion: f64,
}

impl Default for PlausibilityLimits {
    fn default() -> Self {
        PlausibilityLimits {
            min_length_cm: 4.0,
            max_length_cm: 50.0,
            min_condition_k: 0.80,
            max_condition_k: 2.20,
            min_height_ratio: 0.1,
            max_height_ratio: 0.4,
            max_width_ratio: 0.25,
            max_weight_deviation: 0.45,
            min_occupancy: 0.15,
            max_occupancy: 0.90,
            max_area_inversion: 3.0,
        }
    }
}

/// Hard gates applied while a capture is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineTolerances {
    /// Detector confidence below this counts as no detection.
    pub confidence_floor: f32,
    /// Contour axes shorter than this are degenerate.
    pub min_axis_px: f64,
    /// Largest timestamp skew at which two frames still form a pair.
    pub frame_sync_tolerance_ms: i64,
    /// Relative disagreement between view lengths that still averages.
    pub length_tolerance_fraction: f64,
}

impl Default for PipelineTolerances {
    fn default() -> Self {
        PipelineTolerances {
            confidence_floor: 0.6,
            min_axis_px: 10.0,
            frame_sync_tolerance_ms: 50,
            length_tolerance_fraction: 0.1,
        }
    }
}

/// Everything a measurement session needs, loaded once and treated as
/// read-only while captures run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub calibration: CalibrationSet,
    pub optics: OpticalParameters,
    pub species: SpeciesProfile,
    pub limits: PlausibilityLimits,
    pub tolerances: PipelineTolerances,
}

impl SessionConfig {
    /// Location of the session file under the user's configuration
    /// directory.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = app_root(AppDataType::UserConfig, &APP_INFO)?;
        path.push("session.json");

        Ok(path)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Self::default_path()?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path.as_ref())?;
        let config: SessionConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        log::info!(
            "session configuration loaded from {}",
            path.as_ref().display()
        );

        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        log::debug!("session configuration saved to {}", path.as_ref().display());

        Ok(())
    }

    /// Checks the cross-field invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for calibration in [&self.calibration.top, &self.calibration.side]
            .into_iter()
            .flatten()
        {
            if !calibration.is_valid() {
                return Err(ConfigError::Invalid {
                    reason: format!(
                        "{} camera calibration carries a non-positive scale",
                        calibration.camera_id
                    ),
                });
            }
        }

        let optics = &self.optics;
        require(
            optics.glass_thickness_mm.is_finite() && optics.glass_thickness_mm >= 0.0,
            "glass thickness must be finite and non-negative",
        )?;
        require(
            optics.camera_to_glass_distance_cm.is_finite()
                && optics.camera_to_glass_distance_cm > 0.0,
            "camera-to-glass distance must be positive",
        )?;
        require(
            optics.subject_distance_cm.is_finite()
                && optics.subject_distance_cm >= optics.glass_thickness_cm(),
            "subject distance must sit beyond the viewing glass",
        )?;
        if !optics.is_dry() {
            require(
                optics.refractive_index_air >= 1.0 && optics.refractive_index_air < 1.01,
                "air refractive index must stay close to 1",
            )?;
            require(
                optics.refractive_index_glass.is_finite() && optics.refractive_index_glass > 1.0,
                "glass refractive index must exceed 1",
            )?;
            require(
                optics.refractive_index_water.is_finite() && optics.refractive_index_water > 1.0,
                "water refractive index must exceed 1",
            )?;
        }
        let curve = optics.position_correction;
        require(
            curve.a.is_finite() && curve.b.is_finite() && curve.c.is_finite(),
            "position correction coefficients must be finite",
        )?;

        let species = &self.species;
        require(
            species.weight_coeff > 0.0,
            "weight coefficient must be positive",
        )?;
        require(
            species.weight_exponent > 0.0,
            "weight exponent must be positive",
        )?;
        require(
            (0.0..=1.0).contains(&species.allometric_blend),
            "allometric blend must lie in [0, 1]",
        )?;
        require(
            species.tissue_density_g_cm3 > 0.0,
            "tissue density must be positive",
        )?;
        require(species.form_factor > 0.0, "form factor must be positive")?;

        let limits = &self.limits;
        require(
            limits.min_length_cm > 0.0 && limits.min_length_cm < limits.max_length_cm,
            "length limits must satisfy 0 < min < max",
        )?;
        require(
            limits.min_condition_k > 0.0 && limits.min_condition_k < limits.max_condition_k,
            "condition factor limits must satisfy 0 < min < max",
        )?;
        require(
            limits.min_height_ratio > 0.0 && limits.min_height_ratio < limits.max_height_ratio,
            "height ratio limits must satisfy 0 < min < max",
        )?;
        require(
            limits.max_width_ratio > 0.0,
            "width ratio limit must be positive",
        )?;
        require(
            limits.max_weight_deviation > 0.0,
            "weight deviation limit must be positive",
        )?;
        require(
            limits.min_occupancy > 0.0
                && limits.min_occupancy < limits.max_occupancy
                && limits.max_occupancy <= 1.0,
            "occupancy limits must satisfy 0 < min < max <= 1",
        )?;
        require(
            limits.max_area_inversion >= 1.0,
            "area inversion factor must be at least 1",
        )?;

        let tolerances = &self.tolerances;
        require(
            (0.0..=1.0).contains(&tolerances.confidence_floor),
            "confidence floor must lie in [0, 1]",
        )?;
        require(tolerances.min_axis_px > 0.0, "minimum axis must be positive")?;
        require(
            tolerances.frame_sync_tolerance_ms >= 0,
            "frame sync tolerance cannot be negative",
        )?;
        require(
            (0.0..1.0).contains(&tolerances.length_tolerance_fraction),
            "length tolerance fraction must lie in [0, 1)",
        )?;

        Ok(())
    }
}

fn require(condition: bool, reason: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            reason: reason.to_string(),
        })
    }
}
