use std::f64::consts::PI;
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::calibration::CameraId;
use crate::config::{PlausibilityLimits, SessionConfig, SpeciesProfile};

use super::validator::{MeasurementValidator, MeasurementWarning};

#[derive(Debug, Error)]
pub enum BiometryError {
    #[error(
        "implausible body dimensions: length {length_cm} cm, height {height_cm} cm, width {width_cm} cm"
    )]
    InvalidBiometry {
        length_cm: f64,
        height_cm: f64,
        width_cm: f64,
    },
    #[error("the {expected} measurement slot received the {actual} view")]
    ViewMismatch {
        expected: CameraId,
        actual: CameraId,
    },
}

/// Opaque handle naming a captured frame in the acquisition store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRef(pub String);

impl Display for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFrames {
    pub top: FrameRef,
    pub side: FrameRef,
}

/// Metric measurement from a single camera after optical correction and
/// calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectedMeasurement {
    pub camera: CameraId,
    /// Body length along the principal axis.
    pub length_cm: f64,
    /// Extent across the principal axis: body width seen from the top
    /// camera, body height seen from the side camera.
    pub secondary_dimension_cm: f64,
    pub silhouette_area_cm2: f64,
}

/// Fused measurement for one fish pass. Immutable once produced;
/// persistence belongs to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiometricRecord {
    pub measurement_id: Uuid,
    /// Capture timestamp of the frame pair, not the processing time.
    pub timestamp: DateTime<Utc>,
    pub length_cm: f64,
    pub height_cm: f64,
    pub width_cm: f64,
    pub estimated_weight_g: f64,
    /// Fulton condition factor, `k = 100 W / L^3`.
    pub condition_factor_k: f64,
    /// Ellipsoid volume estimate from the three body dimensions.
    pub volume_cm3: f64,
    pub lateral_area_cm2: f64,
    pub top_area_cm2: f64,
    pub warnings: Vec<MeasurementWarning>,
    pub source_frames: SourceFrames,
}

/// Fuses the two per-view measurements into one biometric record using
/// the session's species profile.
#[derive(Debug, Clone, Copy)]
pub struct BiometricCalculator<'a> {
    species: &'a SpeciesProfile,
    limits: &'a PlausibilityLimits,
    length_tolerance_fraction: f64,
}

impl<'a> BiometricCalculator<'a> {
    pub fn new(
        species: &'a SpeciesProfile,
        limits: &'a PlausibilityLimits,
        length_tolerance_fraction: f64,
    ) -> Self {
        BiometricCalculator {
            species,
            limits,
            length_tolerance_fraction,
        }
    }

    pub fn from_config(config: &'a SessionConfig) -> Self {
        BiometricCalculator {
            species: &config.species,
            limits: &config.limits,
            length_tolerance_fraction: config.tolerances.length_tolerance_fraction,
        }
    }

    /// Builds the record for one frame pair. Length comes from both
    /// views, height only from the side view, width only from the top
    /// view. No dimension is ever invented for a view that did not
    /// measure it, and a measurement in the wrong camera slot is
    /// rejected.
    pub fn fuse(
        &self,
        top: &CorrectedMeasurement,
        side: &CorrectedMeasurement,
        captured_at: DateTime<Utc>,
        source_frames: SourceFrames,
    ) -> Result<BiometricRecord, BiometryError> {
        if top.camera != CameraId::Top {
            return Err(BiometryError::ViewMismatch {
                expected: CameraId::Top,
                actual: top.camera,
            });
        }
        if side.camera != CameraId::Side {
            return Err(BiometryError::ViewMismatch {
                expected: CameraId::Side,
                actual: side.camera,
            });
        }

        let length_cm = self.reconcile_length(top.length_cm, side.length_cm);
        let height_cm = side.secondary_dimension_cm;
        let width_cm = top.secondary_dimension_cm;

        if !is_usable_dimension(length_cm)
            || !is_usable_dimension(height_cm)
            || !is_usable_dimension(width_cm)
        {
            return Err(BiometryError::InvalidBiometry {
                length_cm,
                height_cm,
                width_cm,
            });
        }

        let volume_cm3 = self.species.form_factor * (PI / 6.0) * length_cm * height_cm * width_cm;
        let allometric_g = self.species.weight_coeff * length_cm.powf(self.species.weight_exponent);
        let volumetric_g = volume_cm3 * self.species.tissue_density_g_cm3;
        let blend = self.species.allometric_blend;
        let estimated_weight_g = blend * allometric_g + (1.0 - blend) * volumetric_g;

        let condition_factor_k = 100.0 * estimated_weight_g / length_cm.powi(3);

        let record = BiometricRecord {
            measurement_id: Uuid::new_v4(),
            timestamp: captured_at,
            length_cm,
            height_cm,
            width_cm,
            estimated_weight_g,
            condition_factor_k,
            volume_cm3,
            lateral_area_cm2: side.silhouette_area_cm2,
            top_area_cm2: top.silhouette_area_cm2,
            warnings: Vec::new(),
            source_frames,
        };

        Ok(BiometricRecord {
            warnings: MeasurementValidator::audit(&record, self.species, self.limits),
            ..record
        })
    }

    /// Within `length_tolerance_fraction` of the longer view the two
    /// lengths average; beyond that the longer view wins outright.
    fn reconcile_length(&self, top_cm: f64, side_cm: f64) -> f64 {
        let longer = top_cm.max(side_cm);
        if (top_cm - side_cm).abs() <= self.length_tolerance_fraction * longer {
            (top_cm + side_cm) / 2.0
        } else {
            log::debug!(
                "view lengths disagree: top {top_cm:.2} cm vs side {side_cm:.2} cm, keeping {longer:.2} cm"
            );
            longer
        }
    }
}

fn is_usable_dimension(value_cm: f64) -> bool {
    value_cm.is_finite() && value_cm > 0.0
}
