mod calculator;
mod validator;

pub use calculator::{
    BiometricCalculator, BiometricRecord, BiometryError, CorrectedMeasurement, FrameRef,
    SourceFrames,
};
pub use validator::{MeasurementValidator, MeasurementWarning};
