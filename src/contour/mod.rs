mod extractor;
mod mask;

pub use extractor::{ContourError, ContourExtractor, ViewContour};
pub use mask::RoiMask;
