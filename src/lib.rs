//! Contactless fish biometry from a calibrated dual-camera rig.
//!
//! A top camera sees length and width, a side camera sees length and
//! height. Each frame arrives with a detector mask; a principal-axis
//! fit turns the mask into pixel dimensions, refraction and calibration
//! turn pixels into centimeters, and the two views fuse into a single
//! weighed and sanity-checked record per fish pass.

pub mod biometry;
pub mod calibration;
pub mod config;
pub mod contour;
mod linalg;
pub mod optics;
pub mod pipeline;

pub use biometry::{
    BiometricCalculator, BiometricRecord, BiometryError, CorrectedMeasurement, FrameRef,
    MeasurementValidator, MeasurementWarning, SourceFrames,
};
pub use calibration::{CalibrationError, CalibrationSet, CameraCalibration, CameraId};
pub use config::{
    ConfigError, PipelineTolerances, PlausibilityLimits, SessionConfig, SpeciesProfile, APP_INFO,
};
pub use contour::{ContourError, ContourExtractor, RoiMask, ViewContour};
pub use optics::{OpticalParameters, OpticsError, PositionCorrectionCurve};
pub use pipeline::{
    Abort, CaptureFrame, CaptureOutcome, CapturePair, MeasurementSession, PipelineError,
    PipelineStage, RecordSink,
};
