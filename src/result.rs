use image::GrayImage;
use imageproc::point::Point;

use crate::{util::rectangle_size, Detector};

/// Four corner points in no particular winding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quad(pub [Point<i32>; 4]);

impl Quad {
    pub fn points(&self) -> &[Point<i32>; 4] {
        &self.0
    }

    /// Inclusive pixel bounds as `(min_x, min_y, max_x, max_y)`.
    pub fn bounds(&self) -> (i32, i32, i32, i32) {
        self.0.iter().fold(
            (i32::MAX, i32::MAX, i32::MIN, i32::MIN),
            |(min_x, min_y, max_x, max_y), p| {
                (min_x.min(p.x), min_y.min(p.y), max_x.max(p.x), max_y.max(p.y))
            },
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub quad: Quad,
    pub width: f32,
    pub height: f32,
    pub area: f32,
    pub aspect_ratio: f32,
}

impl Candidate {
    pub fn new(quad: Quad) -> Self {
        let (width, height) = rectangle_size(quad.points());
        let aspect_ratio = if width > 0.0 && height > 0.0 {
            width.max(height) / width.min(height)
        } else {
            0.0
        };
        Self {
            quad,
            width,
            height,
            area: width * height,
            aspect_ratio,
        }
    }
}

/// An accepted candidate with its binarized crop. `enhanced` is set when the
/// crop went through the 2x zoom.
#[derive(Debug, Clone)]
pub struct PlateRegion {
    pub detector: Detector,
    pub candidate: Candidate,
    pub image: GrayImage,
    pub enhanced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacterBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Index of the source contour within its extraction call.
    pub contour: usize,
}

#[derive(Debug, Clone)]
pub struct Segmentation {
    pub cleaned: GrayImage,
    pub boxes: Vec<CharacterBox>,
    pub characters: Vec<GrayImage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct PlateReading {
    pub detector: Detector,
    pub candidate: Candidate,
    pub characters: Vec<Recognition>,
    pub text: String,
    pub confidence: f32,
}
