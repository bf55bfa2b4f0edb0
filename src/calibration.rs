use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error("no calibration stored for the {0} camera")]
    CalibrationMissing(CameraId),
    #[error("reference of {pixel_length} px against {known_length_cm} cm cannot produce a scale")]
    InvalidReference {
        pixel_length: f64,
        known_length_cm: f64,
    },
}

/// The two fixed viewpoints of the measurement rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraId {
    /// Cenital camera looking straight down into the tank.
    Top,
    /// Lateral camera looking through the side wall.
    Side,
}

impl Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraId::Top => write!(f, "top"),
            CameraId::Side => write!(f, "side"),
        }
    }
}

/// Pixel-to-centimeter scale for one camera, derived from a reference
/// object of known physical length placed in the scene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub camera_id: CameraId,
    pub pixels_per_cm: f64,
    pub reference_object_length_cm: f64,
    pub captured_at: DateTime<Utc>,
}

impl CameraCalibration {
    pub fn from_reference(
        camera_id: CameraId,
        pixel_length: f64,
        known_length_cm: f64,
    ) -> Result<Self, CalibrationError> {
        if !pixel_length.is_finite()
            || !known_length_cm.is_finite()
            || pixel_length <= 0.0
            || known_length_cm <= 0.0
        {
            return Err(CalibrationError::InvalidReference {
                pixel_length,
                known_length_cm,
            });
        }

        Ok(CameraCalibration {
            camera_id,
            pixels_per_cm: pixel_length / known_length_cm,
            reference_object_length_cm: known_length_cm,
            captured_at: Utc::now(),
        })
    }

    pub fn to_centimeters(&self, pixels: f64) -> Result<f64, CalibrationError> {
        if !pixels.is_finite() || pixels <= 0.0 {
            return Err(CalibrationError::InvalidReference {
                pixel_length: pixels,
                known_length_cm: self.reference_object_length_cm,
            });
        }

        Ok(pixels / self.pixels_per_cm)
    }

    pub fn is_valid(&self) -> bool {
        self.pixels_per_cm.is_finite()
            && self.pixels_per_cm > 0.0
            && self.reference_object_length_cm.is_finite()
            && self.reference_object_length_cm > 0.0
    }
}

/// Per-camera calibration slots. Either slot may be empty until the rig
/// has been calibrated; conversions through an empty slot fail rather
/// than fall back to a guessed scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSet {
    pub top: Option<CameraCalibration>,
    pub side: Option<CameraCalibration>,
}

impl CalibrationSet {
    pub fn get(&self, camera: CameraId) -> Result<&CameraCalibration, CalibrationError> {
        let slot = match camera {
            CameraId::Top => self.top.as_ref(),
            CameraId::Side => self.side.as_ref(),
        };

        slot.ok_or(CalibrationError::CalibrationMissing(camera))
    }

    pub fn set(&mut self, calibration: CameraCalibration) {
        match calibration.camera_id {
            CameraId::Top => self.top = Some(calibration),
            CameraId::Side => self.side = Some(calibration),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.top.is_some() && self.side.is_some()
    }

    pub fn to_centimeters(&self, camera: CameraId, pixels: f64) -> Result<f64, CalibrationError> {
        self.get(camera)?.to_centimeters(pixels)
    }
}
