use image::GrayImage;
use ndarray::Array2;

/// Binary region-of-interest mask for one camera frame, as produced by
/// an upstream detector. Any non-zero byte is foreground.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiMask {
    grid: Array2<u8>,
    confidence: f32,
}

impl RoiMask {
    pub fn new(grid: Array2<u8>, confidence: f32) -> Self {
        RoiMask { grid, confidence }
    }

    /// Wraps a detector mask delivered as an 8-bit grayscale image.
    pub fn from_luma8(image: &GrayImage, confidence: f32) -> Self {
        let grid = Array2::from_shape_vec(
            (image.height() as usize, image.width() as usize),
            image.as_raw().clone(),
        )
        .expect("luma8 buffer length matches its dimensions");

        RoiMask { grid, confidence }
    }

    pub fn grid(&self) -> &Array2<u8> {
        &self.grid
    }

    /// Detector confidence for the region, in [0, 1].
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// (rows, columns) of the underlying grid.
    pub fn dimensions(&self) -> (usize, usize) {
        self.grid.dim()
    }

    pub fn foreground_px(&self) -> usize {
        self.grid.iter().filter(|&&value| value != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.iter().all(|&value| value == 0)
    }
}
