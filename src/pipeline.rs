use std::fmt::{self, Display};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::biometry::{
    BiometricCalculator, BiometricRecord, BiometryError, CorrectedMeasurement, FrameRef,
    SourceFrames,
};
use crate::calibration::{CalibrationError, CameraCalibration, CameraId};
use crate::config::{ConfigError, SessionConfig};
use crate::contour::{ContourError, ContourExtractor, RoiMask};
use crate::optics::OpticsError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame pair out of sync: {skew_ms} ms skew exceeds the {tolerance_ms} ms tolerance")]
    FrameDesync { skew_ms: i64, tolerance_ms: i64 },
    #[error("the {expected} slot holds a frame labelled {actual}")]
    ViewMismatch {
        expected: CameraId,
        actual: CameraId,
    },
    #[error(transparent)]
    Contour(#[from] ContourError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Optics(#[from] OpticsError),
    #[error(transparent)]
    Biometry(#[from] BiometryError),
}

impl PipelineError {
    /// Stage at which this class of failure arises.
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::FrameDesync { .. } | PipelineError::ViewMismatch { .. } => {
                PipelineStage::AwaitingFrames
            }
            PipelineError::Contour(_) => PipelineStage::ExtractingContours,
            PipelineError::Calibration(_) | PipelineError::Optics(_) => PipelineStage::Correcting,
            PipelineError::Biometry(_) => PipelineStage::Fusing,
        }
    }
}

/// Lifecycle of one capture as it moves through the measurement
/// pipeline. `Complete` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    AwaitingFrames,
    ExtractingContours,
    Correcting,
    Fusing,
    Complete,
    Aborted,
}

impl PipelineStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Complete | PipelineStage::Aborted)
    }
}

impl Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::AwaitingFrames => write!(f, "awaiting frames"),
            PipelineStage::ExtractingContours => write!(f, "extracting contours"),
            PipelineStage::Correcting => write!(f, "correcting"),
            PipelineStage::Fusing => write!(f, "fusing"),
            PipelineStage::Complete => write!(f, "complete"),
            PipelineStage::Aborted => write!(f, "aborted"),
        }
    }
}

/// One camera frame queued for measurement: where it came from, when it
/// was taken, and the detector mask over it.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub camera: CameraId,
    pub timestamp: DateTime<Utc>,
    pub frame: FrameRef,
    pub mask: RoiMask,
}

/// The two near-simultaneous frames describing one fish pass.
#[derive(Debug, Clone)]
pub struct CapturePair {
    pub top: CaptureFrame,
    pub side: CaptureFrame,
}

impl CapturePair {
    pub fn new(top: CaptureFrame, side: CaptureFrame) -> Self {
        CapturePair { top, side }
    }

    /// Absolute timestamp skew between the two frames.
    pub fn skew_ms(&self) -> i64 {
        (self.top.timestamp - self.side.timestamp)
            .num_milliseconds()
            .abs()
    }

    fn source_frames(&self) -> SourceFrames {
        SourceFrames {
            top: self.top.frame.clone(),
            side: self.side.frame.clone(),
        }
    }

    fn check(&self, tolerance_ms: i64) -> Result<(), PipelineError> {
        if self.top.camera != CameraId::Top {
            return Err(PipelineError::ViewMismatch {
                expected: CameraId::Top,
                actual: self.top.camera,
            });
        }
        if self.side.camera != CameraId::Side {
            return Err(PipelineError::ViewMismatch {
                expected: CameraId::Side,
                actual: self.side.camera,
            });
        }

        let skew_ms = self.skew_ms();
        if skew_ms > tolerance_ms {
            return Err(PipelineError::FrameDesync {
                skew_ms,
                tolerance_ms,
            });
        }

        Ok(())
    }
}

/// Terminal failure report for one capture.
#[derive(Debug)]
pub struct Abort {
    /// Stage that was executing when the capture failed.
    pub stage: PipelineStage,
    pub error: PipelineError,
    pub frames: SourceFrames,
}

#[derive(Debug)]
pub enum CaptureOutcome {
    Complete(BiometricRecord),
    Aborted(Abort),
}

impl CaptureOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, CaptureOutcome::Complete(_))
    }

    pub fn record(&self) -> Option<&BiometricRecord> {
        match self {
            CaptureOutcome::Complete(record) => Some(record),
            CaptureOutcome::Aborted(_) => None,
        }
    }
}

/// Downstream consumer of completed records, typically a database
/// writer or exporter. `commit` is invoked at most once per capture.
pub trait RecordSink {
    fn commit(
        &mut self,
        record: &BiometricRecord,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Long-lived measurement session owning the configuration. Captures
/// share it on the read side; recalibration takes the write side and
/// waits for in-flight captures to drain.
pub struct MeasurementSession {
    config: RwLock<SessionConfig>,
}

impl MeasurementSession {
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(MeasurementSession {
            config: RwLock::new(config),
        })
    }

    /// Runs one capture pair through the pipeline. Failures abort the
    /// capture and are reported in the outcome, never panicked.
    pub fn process(&self, pair: &CapturePair) -> CaptureOutcome {
        let config = self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        run(&config, pair)
    }

    /// Like [`Self::process`], additionally committing a completed
    /// record to `sink`. A sink failure is logged; the outcome still
    /// carries the record.
    pub fn process_into(&self, pair: &CapturePair, sink: &mut dyn RecordSink) -> CaptureOutcome {
        let outcome = self.process(pair);
        if let CaptureOutcome::Complete(record) = &outcome {
            if let Err(error) = sink.commit(record) {
                log::error!(
                    "record sink rejected measurement {}: {error}",
                    record.measurement_id
                );
            }
        }

        outcome
    }

    /// Replaces one camera's scale from a fresh reference measurement.
    /// The other camera keeps its calibration.
    pub fn recalibrate(
        &self,
        camera: CameraId,
        pixel_length: f64,
        known_length_cm: f64,
    ) -> Result<CameraCalibration, CalibrationError> {
        let calibration = CameraCalibration::from_reference(camera, pixel_length, known_length_cm)?;
        let mut config = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        config.calibration.set(calibration);
        log::info!(
            "{camera} camera recalibrated at {:.3} px/cm against a {:.1} cm reference",
            calibration.pixels_per_cm,
            calibration.reference_object_length_cm
        );

        Ok(calibration)
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> SessionConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn run(config: &SessionConfig, pair: &CapturePair) -> CaptureOutcome {
    let frames = pair.source_frames();
    let mut stage = PipelineStage::AwaitingFrames;

    if let Err(error) = pair.check(config.tolerances.frame_sync_tolerance_ms) {
        return abort(error, frames);
    }

    advance(&mut stage, PipelineStage::ExtractingContours);
    // Contour extraction and per-view correction run in the two view
    // branches; the shared stage advances once both branches return.
    let (top, side) = rayon::join(
        || measure_view(config, &pair.top),
        || measure_view(config, &pair.side),
    );
    let (top, side) = match (top, side) {
        (Ok(top), Ok(side)) => (top, side),
        (Err(error), other) => {
            if let Err(side_error) = other {
                log::debug!("side view also failed: {side_error}");
            }
            return abort(error, frames);
        }
        (_, Err(error)) => return abort(error, frames),
    };
    advance(&mut stage, PipelineStage::Correcting);
    advance(&mut stage, PipelineStage::Fusing);

    let calculator = BiometricCalculator::from_config(config);
    match calculator.fuse(&top, &side, pair.top.timestamp, frames.clone()) {
        Ok(record) => {
            advance(&mut stage, PipelineStage::Complete);
            if !record.warnings.is_empty() {
                log::info!(
                    "measurement {} completed with {} warnings",
                    record.measurement_id,
                    record.warnings.len()
                );
            }

            CaptureOutcome::Complete(record)
        }
        Err(error) => abort(error.into(), frames),
    }
}

fn measure_view(
    config: &SessionConfig,
    frame: &CaptureFrame,
) -> Result<CorrectedMeasurement, PipelineError> {
    let extractor = ContourExtractor::from_tolerances(&config.tolerances);
    let contour = extractor.extract(frame.camera, &frame.mask)?;
    log::debug!(
        "{} contour: {:.1} x {:.1} px at ({:.1}, {:.1})",
        frame.camera,
        contour.major_axis_px,
        contour.minor_axis_px,
        contour.centroid_px.0,
        contour.centroid_px.1
    );

    let optics = &config.optics;
    let axial_position = contour.centroid_px.0;
    let major_px = optics.correct_length(contour.major_axis_px, axial_position)?;
    let minor_px = optics.correct_length(contour.minor_axis_px, axial_position)?;
    let area_scale = optics.correct_length(1.0, axial_position)?;

    let calibration = config.calibration.get(frame.camera)?;
    let length_cm = calibration.to_centimeters(major_px)?;
    let secondary_dimension_cm = calibration.to_centimeters(minor_px)?;
    let cm_per_px = area_scale / calibration.pixels_per_cm;
    let silhouette_area_cm2 = contour.foreground_px as f64 * cm_per_px * cm_per_px;

    Ok(CorrectedMeasurement {
        camera: frame.camera,
        length_cm,
        secondary_dimension_cm,
        silhouette_area_cm2,
    })
}

fn advance(stage: &mut PipelineStage, next: PipelineStage) {
    log::debug!("pipeline stage {stage} -> {next}");
    *stage = next;
}

fn abort(error: PipelineError, frames: SourceFrames) -> CaptureOutcome {
    let stage = error.stage();
    log::warn!("capture aborted while {stage}: {error}");

    CaptureOutcome::Aborted(Abort {
        stage,
        error,
        frames,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use chrono::Duration;
    use ndarray::Array2;

    use crate::biometry::MeasurementWarning;
    use crate::config::SpeciesProfile;
    use crate::optics::{OpticalParameters, PositionCorrectionCurve};

    use super::*;

    fn isometric_species() -> SpeciesProfile {
        SpeciesProfile {
            name: "isometric reference".into(),
            weight_coeff: 0.01,
            weight_exponent: 3.0,
            allometric_blend: 1.0,
            tissue_density_g_cm3: 1.0,
            form_factor: 0.76,
        }
    }

    fn dry_config() -> SessionConfig {
        let mut config = SessionConfig {
            optics: OpticalParameters::identity(),
            species: isometric_species(),
            ..SessionConfig::default()
        };
        config
            .calibration
            .set(CameraCalibration::from_reference(CameraId::Top, 200.0, 10.0).unwrap());
        config
            .calibration
            .set(CameraCalibration::from_reference(CameraId::Side, 200.0, 10.0).unwrap());

        config
    }

    fn filled_mask(rows: usize, cols: usize) -> RoiMask {
        RoiMask::new(Array2::from_elem((rows, cols), 1u8), 0.95)
    }

    fn frame(camera: CameraId, mask: RoiMask, at: DateTime<Utc>) -> CaptureFrame {
        CaptureFrame {
            camera,
            timestamp: at,
            frame: FrameRef(format!("{camera}-frame")),
            mask,
        }
    }

    fn reference_pair(at: DateTime<Utc>) -> CapturePair {
        CapturePair::new(
            frame(CameraId::Top, filled_mask(90, 400), at),
            frame(CameraId::Side, filled_mask(70, 410), at),
        )
    }

    #[test]
    fn reference_scenario_end_to_end() {
        let session = MeasurementSession::new(dry_config()).unwrap();
        let at = Utc::now();

        let outcome = session.process(&reference_pair(at));
        let record = outcome.record().expect("capture should complete");

        assert_relative_eq!(record.length_cm, 20.25, epsilon = 1e-9);
        assert_relative_eq!(record.width_cm, 4.5, epsilon = 1e-9);
        assert_relative_eq!(record.height_cm, 3.5, epsilon = 1e-9);
        assert_relative_eq!(record.estimated_weight_g, 83.03765625, epsilon = 1e-6);
        assert_relative_eq!(record.condition_factor_k, 1.0, epsilon = 1e-9);
        assert_eq!(record.timestamp, at);
        assert_eq!(record.source_frames.top.0, "top-frame");
        // Solid rectangles overfill their bounding boxes; nothing else
        // about the reference scenario is implausible.
        assert!(record
            .warnings
            .iter()
            .all(|w| matches!(w, MeasurementWarning::OccupancyOutOfRange { .. })));
    }

    #[test]
    fn replays_are_bit_identical_apart_from_the_identifier() {
        let session = MeasurementSession::new(dry_config()).unwrap();
        let pair = reference_pair(Utc::now());

        let first = session.process(&pair);
        let second = session.process(&pair);
        let first = first.record().unwrap();
        let second = second.record().unwrap();

        assert_ne!(first.measurement_id, second.measurement_id);
        assert_eq!(first.timestamp, second.timestamp);
        assert_eq!(first.length_cm.to_bits(), second.length_cm.to_bits());
        assert_eq!(first.height_cm.to_bits(), second.height_cm.to_bits());
        assert_eq!(first.width_cm.to_bits(), second.width_cm.to_bits());
        assert_eq!(
            first.estimated_weight_g.to_bits(),
            second.estimated_weight_g.to_bits()
        );
        assert_eq!(
            first.condition_factor_k.to_bits(),
            second.condition_factor_k.to_bits()
        );
        assert_eq!(first.volume_cm3.to_bits(), second.volume_cm3.to_bits());
        assert_eq!(
            first.lateral_area_cm2.to_bits(),
            second.lateral_area_cm2.to_bits()
        );
        assert_eq!(first.top_area_cm2.to_bits(), second.top_area_cm2.to_bits());
        assert_eq!(first.warnings, second.warnings);
        assert_eq!(first.source_frames, second.source_frames);
    }

    #[test]
    fn only_the_closing_stages_are_terminal() {
        assert!(PipelineStage::Complete.is_terminal());
        assert!(PipelineStage::Aborted.is_terminal());
        assert!(!PipelineStage::AwaitingFrames.is_terminal());
        assert!(!PipelineStage::ExtractingContours.is_terminal());
        assert!(!PipelineStage::Correcting.is_terminal());
        assert!(!PipelineStage::Fusing.is_terminal());
    }

    #[test]
    fn skew_beyond_tolerance_aborts_and_at_tolerance_passes() {
        let session = MeasurementSession::new(dry_config()).unwrap();
        let at = Utc::now();

        let desynced = CapturePair::new(
            frame(CameraId::Top, filled_mask(90, 400), at),
            frame(
                CameraId::Side,
                filled_mask(70, 410),
                at + Duration::milliseconds(200),
            ),
        );
        match session.process(&desynced) {
            CaptureOutcome::Aborted(abort) => {
                assert_eq!(abort.stage, PipelineStage::AwaitingFrames);
                assert!(matches!(
                    abort.error,
                    PipelineError::FrameDesync {
                        skew_ms: 200,
                        tolerance_ms: 50,
                    }
                ));
            }
            CaptureOutcome::Complete(_) => panic!("a 200 ms skew must abort"),
        }

        let borderline = CapturePair::new(
            frame(CameraId::Top, filled_mask(90, 400), at),
            frame(
                CameraId::Side,
                filled_mask(70, 410),
                at + Duration::milliseconds(50),
            ),
        );
        assert!(session.process(&borderline).is_complete());
    }

    #[test]
    fn empty_top_mask_aborts_during_extraction() {
        let session = MeasurementSession::new(dry_config()).unwrap();
        let at = Utc::now();
        let pair = CapturePair::new(
            frame(CameraId::Top, RoiMask::new(Array2::zeros((90, 400)), 0.95), at),
            frame(CameraId::Side, filled_mask(70, 410), at),
        );

        match session.process(&pair) {
            CaptureOutcome::Aborted(abort) => {
                assert_eq!(abort.stage, PipelineStage::ExtractingContours);
                // The report names the stage that was in flight, not a
                // closing stage.
                assert!(!abort.stage.is_terminal());
                assert!(matches!(
                    abort.error,
                    PipelineError::Contour(ContourError::EmptyMask)
                ));
                assert_eq!(abort.frames.top.0, "top-frame");
            }
            CaptureOutcome::Complete(_) => panic!("an empty mask must abort"),
        }
    }

    #[test]
    fn hairline_side_mask_aborts_as_degenerate() {
        let session = MeasurementSession::new(dry_config()).unwrap();
        let at = Utc::now();
        let pair = CapturePair::new(
            frame(CameraId::Top, filled_mask(90, 400), at),
            frame(CameraId::Side, filled_mask(1, 410), at),
        );

        match session.process(&pair) {
            CaptureOutcome::Aborted(abort) => {
                assert_eq!(abort.stage, PipelineStage::ExtractingContours);
                assert!(matches!(
                    abort.error,
                    PipelineError::Contour(ContourError::DegenerateShape { .. })
                ));
            }
            CaptureOutcome::Complete(_) => panic!("a hairline mask must abort"),
        }
    }

    #[test]
    fn missing_side_calibration_aborts_during_correction() {
        let mut config = dry_config();
        config.calibration.side = None;
        let session = MeasurementSession::new(config).unwrap();

        match session.process(&reference_pair(Utc::now())) {
            CaptureOutcome::Aborted(abort) => {
                assert_eq!(abort.stage, PipelineStage::Correcting);
                assert!(matches!(
                    abort.error,
                    PipelineError::Calibration(CalibrationError::CalibrationMissing(
                        CameraId::Side
                    ))
                ));
            }
            CaptureOutcome::Complete(_) => panic!("a missing calibration must abort"),
        }
    }

    #[test]
    fn swapped_cameras_are_rejected() {
        let session = MeasurementSession::new(dry_config()).unwrap();
        let at = Utc::now();
        let pair = CapturePair::new(
            frame(CameraId::Side, filled_mask(90, 400), at),
            frame(CameraId::Top, filled_mask(70, 410), at),
        );

        match session.process(&pair) {
            CaptureOutcome::Aborted(abort) => {
                assert_eq!(abort.stage, PipelineStage::AwaitingFrames);
                assert!(matches!(
                    abort.error,
                    PipelineError::ViewMismatch {
                        expected: CameraId::Top,
                        actual: CameraId::Side,
                    }
                ));
            }
            CaptureOutcome::Complete(_) => panic!("swapped cameras must abort"),
        }
    }

    #[test]
    fn recalibration_rescales_subsequent_captures() {
        let session = MeasurementSession::new(dry_config()).unwrap();
        let at = Utc::now();

        let before = session.process(&reference_pair(at));
        assert_relative_eq!(before.record().unwrap().length_cm, 20.25, epsilon = 1e-9);

        session.recalibrate(CameraId::Top, 100.0, 10.0).unwrap();
        session.recalibrate(CameraId::Side, 100.0, 10.0).unwrap();
        assert_relative_eq!(
            session
                .config()
                .calibration
                .get(CameraId::Top)
                .unwrap()
                .pixels_per_cm,
            10.0
        );

        let after = session.process(&reference_pair(at));
        assert_relative_eq!(after.record().unwrap().length_cm, 40.5, epsilon = 1e-9);
    }

    #[test]
    fn failed_recalibration_keeps_the_stored_scale() {
        let session = MeasurementSession::new(dry_config()).unwrap();
        let at = Utc::now();

        assert!(session.recalibrate(CameraId::Top, 0.0, 10.0).is_err());
        assert!(session.recalibrate(CameraId::Top, 200.0, f64::NAN).is_err());

        let outcome = session.process(&reference_pair(at));
        assert_relative_eq!(outcome.record().unwrap().length_cm, 20.25, epsilon = 1e-9);
    }

    #[test]
    fn refraction_rescales_the_dry_lengths() {
        let mut config = dry_config();
        config.optics = OpticalParameters::default();
        let session = MeasurementSession::new(config).unwrap();

        let record_outcome = session.process(&reference_pair(Utc::now()));
        let record = record_outcome.record().expect("capture should complete");

        // 20.25 cm scaled by (7 + 13.540147534686963) / (7 + 15).
        assert_relative_eq!(record.length_cm, 18.90627216260959, epsilon = 1e-9);
        assert_relative_eq!(record.condition_factor_k, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn position_curve_is_evaluated_at_each_views_centroid() {
        let mut config = dry_config();
        config.optics.position_correction = PositionCorrectionCurve::new(0.0, 0.001, 1.0);
        let session = MeasurementSession::new(config).unwrap();

        let outcome = session.process(&reference_pair(Utc::now()));
        let record = outcome.record().expect("capture should complete");

        // Top centroid x = 199.5 gives 1.1995, side centroid x = 204.5
        // gives 1.2045.
        assert_relative_eq!(record.width_cm, 4.5 * 1.1995, epsilon = 1e-9);
        assert_relative_eq!(record.height_cm, 3.5 * 1.2045, epsilon = 1e-9);
        assert_relative_eq!(
            record.length_cm,
            (20.0 * 1.1995 + 20.5 * 1.2045) / 2.0,
            epsilon = 1e-9
        );
    }

    struct MemorySink {
        records: Vec<BiometricRecord>,
        fail: bool,
    }

    impl RecordSink for MemorySink {
        fn commit(
            &mut self,
            record: &BiometricRecord,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            if self.fail {
                return Err("sink offline".into());
            }
            self.records.push(record.clone());

            Ok(())
        }
    }

    #[test]
    fn sink_sees_each_completed_record_once() {
        let session = MeasurementSession::new(dry_config()).unwrap();
        let at = Utc::now();
        let mut sink = MemorySink {
            records: Vec::new(),
            fail: false,
        };

        let outcome = session.process_into(&reference_pair(at), &mut sink);
        assert!(outcome.is_complete());
        assert_eq!(sink.records.len(), 1);
        assert_eq!(
            sink.records[0].measurement_id,
            outcome.record().unwrap().measurement_id
        );

        let desynced = CapturePair::new(
            frame(CameraId::Top, filled_mask(90, 400), at),
            frame(
                CameraId::Side,
                filled_mask(70, 410),
                at + Duration::milliseconds(500),
            ),
        );
        let aborted = session.process_into(&desynced, &mut sink);
        assert!(!aborted.is_complete());
        assert_eq!(sink.records.len(), 1);
    }

    #[test]
    fn failing_sink_does_not_abort_the_capture() {
        let session = MeasurementSession::new(dry_config()).unwrap();
        let mut sink = MemorySink {
            records: Vec::new(),
            fail: true,
        };

        let outcome = session.process_into(&reference_pair(Utc::now()), &mut sink);

        assert!(outcome.is_complete());
        assert!(sink.records.is_empty());
    }
}
