use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum OpticsError {
    #[error("apparent distance {apparent_cm} cm lies inside the viewing glass ({glass_cm} cm)")]
    OpticalRange { apparent_cm: f64, glass_cm: f64 },
    #[error("position correction factor {factor} at x = {position} px is not a usable scale")]
    NonPositiveCorrection { position: f64, factor: f64 },
}

/// Quadratic correction `f(x) = a x^2 + b x + c` for residual lens
/// distortion that varies along the tank axis. Applied multiplicatively
/// to a length at the contour's axial position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionCorrectionCurve {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl PositionCorrectionCurve {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        PositionCorrectionCurve { a, b, c }
    }

    /// Flat curve with no positional effect.
    pub fn identity() -> Self {
        PositionCorrectionCurve {
            a: 0.0,
            b: 0.0,
            c: 1.0,
        }
    }

    pub fn evaluate(&self, position_px: f64) -> f64 {
        (self.a * position_px + self.b) * position_px + self.c
    }

    pub fn apply(&self, length: f64, position_px: f64) -> Result<f64, OpticsError> {
        let factor = self.evaluate(position_px);
        if !factor.is_finite() || factor <= 0.0 {
            return Err(OpticsError::NonPositiveCorrection {
                position: position_px,
                factor,
            });
        }

        Ok(length * factor)
    }
}

impl Default for PositionCorrectionCurve {
    fn default() -> Self {
        Self::identity()
    }
}

/// Refraction model for a camera looking into the tank through a flat
/// viewing window.
///
/// Axial distances are measured from the outer glass face. The apparent
/// subject distance is what the camera geometry reports; the air, glass
/// and water layers compress it, and `true_distance` unfolds the stack
/// layer by layer. `correct_length` turns the distance shift into a
/// magnification factor for pixel lengths and then applies the fitted
/// position curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticalParameters {
    pub glass_thickness_mm: f64,
    pub refractive_index_air: f64,
    pub refractive_index_glass: f64,
    pub refractive_index_water: f64,
    pub camera_to_glass_distance_cm: f64,
    pub subject_distance_cm: f64,
    pub position_correction: PositionCorrectionCurve,
}

impl Default for OpticalParameters {
    fn default() -> Self {
        OpticalParameters {
            glass_thickness_mm: 6.0,
            refractive_index_air: 1.0003,
            refractive_index_glass: 1.52,
            refractive_index_water: 1.333,
            camera_to_glass_distance_cm: 7.0,
            subject_distance_cm: 15.0,
            position_correction: PositionCorrectionCurve::identity(),
        }
    }
}

impl OpticalParameters {
    /// Parameters of a dry rig with no glass or water in the path.
    /// Lengths pass through unchanged.
    pub fn identity() -> Self {
        OpticalParameters {
            glass_thickness_mm: 0.0,
            refractive_index_air: 1.0,
            refractive_index_glass: 1.0,
            refractive_index_water: 1.0,
            camera_to_glass_distance_cm: 7.0,
            subject_distance_cm: 15.0,
            position_correction: PositionCorrectionCurve::identity(),
        }
    }

    pub fn glass_thickness_cm(&self) -> f64 {
        self.glass_thickness_mm / 10.0
    }

    /// Whether the medium stack is inert, as on a rig measured in air.
    pub fn is_dry(&self) -> bool {
        self.glass_thickness_mm == 0.0
            && self.refractive_index_air == 1.0
            && self.refractive_index_glass == 1.0
            && self.refractive_index_water == 1.0
    }

    /// Converts an apparent axial distance to the true one. Fails when
    /// the apparent distance puts the subject inside the glass.
    pub fn true_distance(&self, apparent_cm: f64) -> Result<f64, OpticsError> {
        let glass_cm = self.glass_thickness_cm();
        if apparent_cm < glass_cm {
            return Err(OpticsError::OpticalRange {
                apparent_cm,
                glass_cm,
            });
        }

        let water_path =
            (apparent_cm - glass_cm) * (self.refractive_index_water / self.refractive_index_glass);
        let glass_path = glass_cm * (self.refractive_index_glass / self.refractive_index_air);

        Ok(water_path + glass_path)
    }

    /// Magnification change caused by the subject sitting at its true
    /// distance instead of the apparent one.
    pub fn length_scale_factor(&self) -> Result<f64, OpticsError> {
        let apparent = self.subject_distance_cm;
        let real = self.true_distance(apparent)?;

        Ok((self.camera_to_glass_distance_cm + real) / (self.camera_to_glass_distance_cm + apparent))
    }

    /// Rescales a pixel length measured at axial position `position_px`,
    /// refraction first, then the fitted position curve.
    pub fn correct_length(&self, length_px: f64, position_px: f64) -> Result<f64, OpticsError> {
        let refracted = length_px * self.length_scale_factor()?;
        self.position_correction.apply(refracted, position_px)
    }
}
