use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::calibration::CameraId;
use crate::config::{PlausibilityLimits, SpeciesProfile};

use super::calculator::BiometricRecord;

/// Soft plausibility findings attached to a record. Warnings never block
/// a measurement; they mark it for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeasurementWarning {
    LengthOutOfRange {
        length_cm: f64,
        min_cm: f64,
        max_cm: f64,
    },
    ConditionFactorLow {
        k: f64,
        min_k: f64,
    },
    ConditionFactorHigh {
        k: f64,
        max_k: f64,
    },
    WeightDeviation {
        weight_g: f64,
        expected_g: f64,
        deviation: f64,
    },
    HeightRatioLow {
        ratio: f64,
        min_ratio: f64,
    },
    HeightRatioHigh {
        ratio: f64,
        max_ratio: f64,
    },
    WidthRatioHigh {
        ratio: f64,
        max_ratio: f64,
    },
    OccupancyOutOfRange {
        camera: CameraId,
        occupancy: f64,
    },
    AreaInversion {
        top_cm2: f64,
        lateral_cm2: f64,
    },
}

impl Display for MeasurementWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementWarning::LengthOutOfRange {
                length_cm,
                min_cm,
                max_cm,
            } => write!(
                f,
                "length {length_cm:.1} cm outside the plausible band [{min_cm:.1}, {max_cm:.1}] cm"
            ),
            MeasurementWarning::ConditionFactorLow { k, min_k } => {
                write!(f, "condition factor {k:.2} below {min_k:.2}")
            }
            MeasurementWarning::ConditionFactorHigh { k, max_k } => {
                write!(f, "condition factor {k:.2} above {max_k:.2}")
            }
            MeasurementWarning::WeightDeviation {
                weight_g,
                expected_g,
                deviation,
            } => write!(
                f,
                "weight {weight_g:.1} g deviates {:.0}% from the {expected_g:.1} g allometric expectation",
                deviation * 100.0
            ),
            MeasurementWarning::HeightRatioLow { ratio, min_ratio } => {
                write!(f, "height/length ratio {ratio:.2} below {min_ratio:.2}")
            }
            MeasurementWarning::HeightRatioHigh { ratio, max_ratio } => {
                write!(f, "height/length ratio {ratio:.2} above {max_ratio:.2}")
            }
            MeasurementWarning::WidthRatioHigh { ratio, max_ratio } => {
                write!(f, "width/length ratio {ratio:.2} above {max_ratio:.2}")
            }
            MeasurementWarning::OccupancyOutOfRange { camera, occupancy } => write!(
                f,
                "{camera} silhouette fills {:.0}% of its bounding box",
                occupancy * 100.0
            ),
            MeasurementWarning::AreaInversion {
                top_cm2,
                lateral_cm2,
            } => write!(
                f,
                "top silhouette {top_cm2:.1} cm2 dwarfs the lateral {lateral_cm2:.1} cm2"
            ),
        }
    }
}

/// Audits a fused record against the session's plausibility limits.
pub struct MeasurementValidator;

impl MeasurementValidator {
    pub fn audit(
        record: &BiometricRecord,
        species: &SpeciesProfile,
        limits: &PlausibilityLimits,
    ) -> Vec<MeasurementWarning> {
        let mut warnings = Vec::new();

        if record.length_cm < limits.min_length_cm || record.length_cm > limits.max_length_cm {
            warnings.push(MeasurementWarning::LengthOutOfRange {
                length_cm: record.length_cm,
                min_cm: limits.min_length_cm,
                max_cm: limits.max_length_cm,
            });
            // Ratio checks only mean anything inside the species band.
            return warnings;
        }

        if record.condition_factor_k < limits.min_condition_k {
            warnings.push(MeasurementWarning::ConditionFactorLow {
                k: record.condition_factor_k,
                min_k: limits.min_condition_k,
            });
        } else if record.condition_factor_k > limits.max_condition_k {
            warnings.push(MeasurementWarning::ConditionFactorHigh {
                k: record.condition_factor_k,
                max_k: limits.max_condition_k,
            });
        }

        let expected_g = species.weight_coeff * record.length_cm.powf(species.weight_exponent);
        if expected_g > 0.0 {
            let deviation = (record.estimated_weight_g - expected_g).abs() / expected_g;
            if deviation > limits.max_weight_deviation {
                warnings.push(MeasurementWarning::WeightDeviation {
                    weight_g: record.estimated_weight_g,
                    expected_g,
                    deviation,
                });
            }
        }

        let height_ratio = record.height_cm / record.length_cm;
        if height_ratio < limits.min_height_ratio {
            warnings.push(MeasurementWarning::HeightRatioLow {
                ratio: height_ratio,
                min_ratio: limits.min_height_ratio,
            });
        } else if height_ratio > limits.max_height_ratio {
            warnings.push(MeasurementWarning::HeightRatioHigh {
                ratio: height_ratio,
                max_ratio: limits.max_height_ratio,
            });
        }

        let width_ratio = record.width_cm / record.length_cm;
        if width_ratio > limits.max_width_ratio {
            warnings.push(MeasurementWarning::WidthRatioHigh {
                ratio: width_ratio,
                max_ratio: limits.max_width_ratio,
            });
        }

        let lateral_box = record.length_cm * record.height_cm;
        if lateral_box > 0.0 {
            let occupancy = record.lateral_area_cm2 / lateral_box;
            if occupancy < limits.min_occupancy || occupancy > limits.max_occupancy {
                warnings.push(MeasurementWarning::OccupancyOutOfRange {
                    camera: CameraId::Side,
                    occupancy,
                });
            }
        }

        let top_box = record.length_cm * record.width_cm;
        if top_box > 0.0 {
            let occupancy = record.top_area_cm2 / top_box;
            if occupancy < limits.min_occupancy || occupancy > limits.max_occupancy {
                warnings.push(MeasurementWarning::OccupancyOutOfRange {
                    camera: CameraId::Top,
                    occupancy,
                });
            }
        }

        if record.top_area_cm2 > record.lateral_area_cm2 * limits.max_area_inversion {
            warnings.push(MeasurementWarning::AreaInversion {
                top_cm2: record.top_area_cm2,
                lateral_cm2: record.lateral_area_cm2,
            });
        }

        warnings
    }
}
