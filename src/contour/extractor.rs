use std::cmp::Ordering;
use std::f64::consts::{FRAC_PI_2, PI};
use std::mem;

use faer::Mat;
use ndarray::{array, stack, Array1, Array2, Axis};
use ndarray_stats::{errors::EmptyInput, CorrelationExt};
use num::Complex;
use thiserror::Error;

use crate::calibration::CameraId;
use crate::config::PipelineTolerances;
use crate::linalg::norm;

use super::RoiMask;

#[derive(Debug, Error)]
pub enum ContourError {
    #[error("mask holds no usable foreground")]
    EmptyMask,
    #[error(
        "contour axes {major_px:.1} x {minor_px:.1} px are too small to measure against the {min_axis_px:.1} px floor"
    )]
    DegenerateShape {
        major_px: f64,
        minor_px: f64,
        min_axis_px: f64,
    },
    #[error("covariance of the mask coordinates is undefined")]
    Covariance(#[from] EmptyInput),
}

/// Principal-axis summary of one view's mask.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewContour {
    pub camera: CameraId,
    /// Extent along the principal axis, in pixels.
    pub major_axis_px: f64,
    /// Extent across the principal axis, in pixels.
    pub minor_axis_px: f64,
    /// Foreground centroid as (x, y) image coordinates.
    pub centroid_px: (f64, f64),
    /// Angle of the principal axis against the image x axis, in (-pi/2, pi/2].
    pub orientation_rad: f64,
    pub foreground_px: usize,
}

/// Fits an oriented body contour to a binary mask by principal component
/// analysis of the foreground pixel cloud.
#[derive(Debug, Clone, Copy)]
pub struct ContourExtractor {
    pub min_axis_px: f64,
    pub confidence_floor: f32,
}

impl ContourExtractor {
    /// Clouds smaller than this cannot support a stable covariance
    /// estimate and are measured by their axis-aligned bounding box
    /// instead.
    const MIN_FOREGROUND_PX: usize = 16;

    pub fn new(min_axis_px: f64, confidence_floor: f32) -> Self {
        ContourExtractor {
            min_axis_px,
            confidence_floor,
        }
    }

    pub fn from_tolerances(tolerances: &PipelineTolerances) -> Self {
        ContourExtractor {
            min_axis_px: tolerances.min_axis_px,
            confidence_floor: tolerances.confidence_floor,
        }
    }

    pub fn extract(&self, camera: CameraId, mask: &RoiMask) -> Result<ViewContour, ContourError> {
        if mask.confidence() < self.confidence_floor {
            log::debug!(
                "{camera} mask confidence {:.2} is below the {:.2} floor",
                mask.confidence(),
                self.confidence_floor
            );
            return Err(ContourError::EmptyMask);
        }

        let nonzero: Vec<(usize, usize)> = mask
            .grid()
            .indexed_iter()
            .filter_map(|(index, &item)| if item != 0 { Some(index) } else { None })
            .collect();
        if nonzero.is_empty() {
            return Err(ContourError::EmptyMask);
        }

        // Grid indices are (row, column), image coordinates (x, y).
        let mut x: Array1<f64> = Array1::default(nonzero.len());
        let mut y: Array1<f64> = Array1::default(nonzero.len());
        for i in 0..nonzero.len() {
            y[i] = nonzero[i].0 as f64;
            x[i] = nonzero[i].1 as f64;
        }

        if nonzero.len() < Self::MIN_FOREGROUND_PX {
            return self.bounding_box_contour(camera, &x, &y);
        }

        let x_mean = x.iter().sum::<f64>() / (x.len() as f64);
        let y_mean = y.iter().sum::<f64>() / (y.len() as f64);

        let mut new_x: Array1<f64> = Array1::default(x.len());
        let mut new_y: Array1<f64> = Array1::default(y.len());
        for i in 0..x.len() {
            new_x[i] = x[i] - x_mean;
            new_y[i] = y[i] - y_mean;
        }

        let coords: Array2<f64> = stack![Axis(0), new_x, new_y];
        let cov = CorrelationExt::cov(&coords, 1.0)?;

        let mut cov_mat: Mat<f64> = Mat::zeros(2, 2);
        for (loc, value) in cov.indexed_iter() {
            cov_mat[loc] = *value;
        }

        let eigendecomp: faer::solvers::Eigendecomposition<Complex<f64>> =
            cov_mat.eigendecomposition();
        let eigenvectors: faer::prelude::MatRef<Complex<f64>> = eigendecomp.u();
        let eigenvalues: Vec<Complex<f64>> = cov_mat.eigenvalues();

        let spectrum: Vec<f64> = eigenvalues.iter().map(|value| value.re).collect();
        let mut order = argsort_by(&spectrum, cmp_f64);
        order.reverse();

        let principal = eigenvectors.get(0..eigenvectors.nrows(), order[0]).as_2d();
        let mut axis: Array1<f64> = array![principal.read(0, 0).re, principal.read(1, 0).re];

        let scale = norm(&axis);
        if scale > 0.0 {
            axis /= scale;
        }
        // Point the axis toward +x so angles stay within (-pi/2, pi/2].
        if axis[0] < 0.0 || (axis[0] == 0.0 && axis[1] < 0.0) {
            axis *= -1.0;
        }

        let mut along_min = f64::INFINITY;
        let mut along_max = f64::NEG_INFINITY;
        let mut across_min = f64::INFINITY;
        let mut across_max = f64::NEG_INFINITY;
        for i in 0..new_x.len() {
            let along = new_x[i] * axis[0] + new_y[i] * axis[1];
            let across = -new_x[i] * axis[1] + new_y[i] * axis[0];
            along_min = along_min.min(along);
            along_max = along_max.max(along);
            across_min = across_min.min(across);
            across_max = across_max.max(across);
        }

        // Pixel extents count both end pixels, matching axis-aligned
        // spans on rectangular masks.
        let mut major = along_max - along_min + 1.0;
        let mut minor = across_max - across_min + 1.0;
        let mut orientation = axis[1].atan2(axis[0]);
        if minor > major {
            mem::swap(&mut major, &mut minor);
            orientation += FRAC_PI_2;
            if orientation > FRAC_PI_2 {
                orientation -= PI;
            }
        }

        if major < self.min_axis_px || minor < self.min_axis_px {
            return Err(ContourError::DegenerateShape {
                major_px: major,
                minor_px: minor,
                min_axis_px: self.min_axis_px,
            });
        }

        Ok(ViewContour {
            camera,
            major_axis_px: major,
            minor_axis_px: minor,
            centroid_px: (x_mean, y_mean),
            orientation_rad: orientation,
            foreground_px: nonzero.len(),
        })
    }

    /// Axis-aligned fallback for clouds too small to support the
    /// covariance estimate. The spans face the same `min_axis_px`
    /// floor as the principal-axis extents.
    fn bounding_box_contour(
        &self,
        camera: CameraId,
        x: &Array1<f64>,
        y: &Array1<f64>,
    ) -> Result<ViewContour, ContourError> {
        let x_min = x.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let x_max = x.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let y_min = y.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let y_max = y.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let span_x = x_max - x_min + 1.0;
        let span_y = y_max - y_min + 1.0;

        let (major, minor, orientation) = if span_y > span_x {
            (span_y, span_x, FRAC_PI_2)
        } else {
            (span_x, span_y, 0.0)
        };
        if major < self.min_axis_px || minor < self.min_axis_px {
            return Err(ContourError::DegenerateShape {
                major_px: major,
                minor_px: minor,
                min_axis_px: self.min_axis_px,
            });
        }

        Ok(ViewContour {
            camera,
            major_axis_px: major,
            minor_axis_px: minor,
            centroid_px: (
                x.iter().sum::<f64>() / (x.len() as f64),
                y.iter().sum::<f64>() / (y.len() as f64),
            ),
            orientation_rad: orientation,
            foreground_px: x.len(),
        })
    }
}

fn argsort_by<T, F>(data: &[T], mut compare: F) -> Vec<usize>
where
    F: FnMut(&T, &T) -> Ordering,
{
    let mut indices = (0..data.len()).collect::<Vec<_>>();
    indices.sort_by(|&i, &j| compare(&data[i], &data[j]));
    indices
}

fn cmp_f64(a: &f64, b: &f64) -> Ordering {
    if a.is_nan() {
        return Ordering::Greater;
    }
    if b.is_nan() {
        return Ordering::Less;
    }

    if a < b {
        Ordering::Less
    } else if a > b {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use std::f64::consts::FRAC_PI_4;

    use super::*;

    fn extractor() -> ContourExtractor {
        ContourExtractor::new(10.0, 0.6)
    }

    fn filled(rows: usize, cols: usize) -> RoiMask {
        RoiMask::new(Array2::from_elem((rows, cols), 1u8), 0.95)
    }

    #[test]
    fn filled_rectangle_reports_axis_aligned_extents() {
        let contour = extractor().extract(CameraId::Top, &filled(90, 400)).unwrap();

        assert_relative_eq!(contour.major_axis_px, 400.0, epsilon = 1e-6);
        assert_relative_eq!(contour.minor_axis_px, 90.0, epsilon = 1e-6);
        assert_relative_eq!(contour.centroid_px.0, 199.5, epsilon = 1e-9);
        assert_relative_eq!(contour.centroid_px.1, 44.5, epsilon = 1e-9);
        assert_relative_eq!(contour.orientation_rad, 0.0, epsilon = 1e-6);
        assert_eq!(contour.foreground_px, 90 * 400);
    }

    #[test]
    fn vertical_body_reports_a_vertical_axis() {
        let contour = extractor().extract(CameraId::Side, &filled(400, 90)).unwrap();

        assert_relative_eq!(contour.major_axis_px, 400.0, epsilon = 1e-6);
        assert_relative_eq!(contour.minor_axis_px, 90.0, epsilon = 1e-6);
        assert_relative_eq!(contour.orientation_rad, FRAC_PI_2, epsilon = 1e-6);
    }

    #[test]
    fn diagonal_band_follows_the_principal_axis() {
        let mut grid = Array2::zeros((60, 60));
        for ((row, col), value) in grid.indexed_iter_mut() {
            if (row as i64 - col as i64).abs() <= 8 {
                *value = 1u8;
            }
        }
        let contour = extractor()
            .extract(CameraId::Top, &RoiMask::new(grid, 0.9))
            .unwrap();

        let sqrt2 = 2f64.sqrt();
        assert_relative_eq!(contour.orientation_rad, FRAC_PI_4, epsilon = 1e-6);
        assert_relative_eq!(contour.major_axis_px, 118.0 / sqrt2 + 1.0, epsilon = 1e-6);
        assert_relative_eq!(contour.minor_axis_px, 16.0 / sqrt2 + 1.0, epsilon = 1e-6);
    }

    #[test]
    fn empty_mask_is_rejected() {
        let mask = RoiMask::new(Array2::zeros((64, 64)), 0.9);
        let error = extractor().extract(CameraId::Top, &mask).unwrap_err();

        assert!(matches!(error, ContourError::EmptyMask));
    }

    #[test]
    fn low_confidence_mask_is_rejected() {
        let mask = RoiMask::new(Array2::from_elem((90, 400), 1u8), 0.3);
        let error = extractor().extract(CameraId::Top, &mask).unwrap_err();

        assert!(matches!(error, ContourError::EmptyMask));
    }

    #[test]
    fn hairline_mask_is_degenerate() {
        let mask = RoiMask::new(Array2::from_elem((1, 40), 1u8), 0.9);
        let error = extractor().extract(CameraId::Top, &mask).unwrap_err();

        match error {
            ContourError::DegenerateShape {
                major_px, minor_px, ..
            } => {
                assert_relative_eq!(major_px, 40.0, epsilon = 1e-6);
                assert_relative_eq!(minor_px, 1.0, epsilon = 1e-6);
            }
            other => panic!("expected a degenerate shape, got {other:?}"),
        }
    }

    #[test]
    fn tiny_blob_is_degenerate() {
        let mut grid = Array2::zeros((32, 32));
        for row in 10..13 {
            for col in 10..13 {
                grid[[row, col]] = 1u8;
            }
        }
        let error = extractor()
            .extract(CameraId::Top, &RoiMask::new(grid, 0.9))
            .unwrap_err();

        assert!(matches!(
            error,
            ContourError::DegenerateShape { major_px, minor_px, .. }
            if major_px == 3.0 && minor_px == 3.0
        ));
    }

    #[test]
    fn sparse_cloud_is_measured_by_its_bounding_box() {
        let mut grid = Array2::zeros((20, 20));
        for i in 0..14 {
            grid[[i, i]] = 1u8;
        }
        let contour = extractor()
            .extract(CameraId::Top, &RoiMask::new(grid, 0.9))
            .unwrap();

        assert_relative_eq!(contour.major_axis_px, 14.0, epsilon = 1e-9);
        assert_relative_eq!(contour.minor_axis_px, 14.0, epsilon = 1e-9);
        assert_relative_eq!(contour.centroid_px.0, 6.5, epsilon = 1e-9);
        assert_relative_eq!(contour.centroid_px.1, 6.5, epsilon = 1e-9);
        assert_relative_eq!(contour.orientation_rad, 0.0, epsilon = 1e-9);
        assert_eq!(contour.foreground_px, 14);
    }

    #[test]
    fn sparse_line_is_still_degenerate() {
        let mut grid = Array2::zeros((20, 20));
        for col in 2..16 {
            grid[[5, col]] = 1u8;
        }
        let error = extractor()
            .extract(CameraId::Top, &RoiMask::new(grid, 0.9))
            .unwrap_err();

        assert!(matches!(
            error,
            ContourError::DegenerateShape { major_px, minor_px, .. }
            if major_px == 14.0 && minor_px == 1.0
        ));
    }
}
