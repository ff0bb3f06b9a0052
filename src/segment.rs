use image::{GenericImageView, GrayImage};
use imageproc::contours::find_contours;
use tracing::instrument;

use crate::{
    util::{bounding_box, erase_contour},
    CharacterBox, Segmentation,
};

#[derive(Debug, Clone, Copy)]
pub struct SegmentOptions {
    /// Upper bound on a character's long/short side ratio.
    pub limit_ratio: f32,
    /// Plate area over character area must exceed this...
    pub min_area_ratio: f32,
    /// ...and stay below this. Blobs smaller than that are noise.
    pub limit_area: f32,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            limit_ratio: 5.5,
            min_area_ratio: 4.0,
            limit_area: 45.0,
        }
    }
}

/// Shape measurements of one blob's bounding box against the plate.
#[derive(Debug, Clone, Copy)]
struct BoxShape {
    ratio: f32,
    height_over_width: f32,
    area_ratio: f32,
}

impl BoxShape {
    fn new(width: u32, height: u32, plate_area: f32) -> Self {
        let (width, height) = (width as f32, height as f32);
        Self {
            ratio: width.max(height) / width.min(height),
            height_over_width: height / width,
            area_ratio: plate_area / (width * height),
        }
    }

    fn well_proportioned(&self, options: &SegmentOptions) -> bool {
        self.ratio < options.limit_ratio && self.height_over_width < options.limit_ratio
    }

    fn plausible(&self, options: &SegmentOptions) -> bool {
        self.well_proportioned(options) && self.area_ratio < options.limit_area
    }

    fn character(&self, options: &SegmentOptions) -> bool {
        self.well_proportioned(options)
            && options.min_area_ratio < self.area_ratio
            && self.area_ratio < options.limit_area
    }

    fn too_small(&self, options: &SegmentOptions) -> bool {
        self.area_ratio > options.limit_area
    }
}

/// Erases specks too small to be characters from a binary plate.
#[instrument(level = "debug", skip_all)]
pub fn suppress_noise(mut plate: GrayImage, options: &SegmentOptions) -> GrayImage {
    let plate_area = (plate.width() * plate.height()) as f32;
    let contours = find_contours::<i32>(&plate);
    let mut erased = 0;
    for contour in contours.iter().filter(|contour| contour.parent.is_none()) {
        let Some((_, _, width, height)) = bounding_box(&contour.points) else {
            continue;
        };
        let shape = BoxShape::new(width, height, plate_area);
        if !shape.plausible(options) && shape.too_small(options) {
            erase_contour(&mut plate, &contour.points);
            erased += 1;
        }
    }
    log::debug!("Erased {erased} noise blobs");
    plate
}

/// Splits a deskewed binary plate into character images in reading order.
#[instrument(level = "debug", skip_all, fields(width = plate.width(), height = plate.height()))]
pub fn segment(plate: &GrayImage, options: &SegmentOptions) -> Segmentation {
    let cleaned = suppress_noise(plate.clone(), options);
    let (cleaned, mut boxes) = extract_boxes(cleaned, options);

    boxes.sort_by_key(|it| (it.x, it.y));
    let characters = boxes
        .iter()
        .map(|it| cleaned.view(it.x, it.y, it.width, it.height).to_image())
        .collect();

    Segmentation {
        cleaned,
        boxes,
        characters,
    }
}

pub fn segment_characters(plate: &GrayImage, options: &SegmentOptions) -> Vec<GrayImage> {
    segment(plate, options).characters
}

/// Second pass: keeps top-level blobs shaped like characters. Holes inside a
/// character belong to it and are skipped; leftover specks are erased.
fn extract_boxes(mut plate: GrayImage, options: &SegmentOptions) -> (GrayImage, Vec<CharacterBox>) {
    let plate_area = (plate.width() * plate.height()) as f32;
    let contours = find_contours::<i32>(&plate);
    let mut boxes = Vec::new();
    for (index, contour) in contours.iter().enumerate() {
        if contour.parent.is_some() {
            continue;
        }
        let Some((x, y, width, height)) = bounding_box(&contour.points) else {
            continue;
        };
        let shape = BoxShape::new(width, height, plate_area);
        if shape.character(options) {
            log::trace!("Character box ({x}, {y}) {width}x{height}: {shape:?}");
            boxes.push(CharacterBox {
                x: x as u32,
                y: y as u32,
                width,
                height,
                contour: index,
            });
        } else if shape.too_small(options) {
            erase_contour(&mut plate, &contour.points);
        }
    }
    log::debug!("Found {} character boxes", boxes.len());
    (plate, boxes)
}
