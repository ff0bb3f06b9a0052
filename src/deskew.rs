use std::cmp::Reverse;

use image::{GrayImage, Luma};
use imageproc::{
    contours::find_contours,
    geometric_transformations::{rotate_about_center, warp, Interpolation, Projection},
    hough::{detect_lines, LineDetectionOptions},
    point::Point,
};
use tracing::instrument;

use crate::util::{bounding_box, rectangle_size, rotated_rect, RotatedRect};

#[derive(Debug, Clone, Copy)]
pub struct DeskewOptions {
    /// Open bounds on a stroke's long/short side ratio.
    pub stroke_ratio: (f32, f32),
    /// Open bounds on plate area over stroke area.
    pub stroke_area: (f32, f32),
    /// Largest skew difference in degrees between the outer strokes before
    /// the more rotated one falls back to its upright bounding box.
    pub max_angle_delta: f32,
    pub border_margin: i32,
}

impl Default for DeskewOptions {
    fn default() -> Self {
        Self {
            stroke_ratio: (0.5, 4.1),
            stroke_area: (4.0, 45.0),
            max_angle_delta: 10.0,
            border_margin: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LineDeskewOptions {
    /// Minimum votes for a line, as a fraction of the plate width.
    pub vote_fraction: f32,
    pub suppression_radius: u32,
    /// Lines tilted further than this many degrees are ignored.
    pub max_tilt: f32,
}

impl Default for LineDeskewOptions {
    fn default() -> Self {
        Self {
            vote_fraction: 0.75,
            suppression_radius: 8,
            max_tilt: 45.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeskewMethod {
    /// Perspective correction from the corners of the character strokes.
    #[default]
    Text,
    /// Rotation levelling the dominant straight lines.
    Lines,
}

/// A character-sized blob and the rectangles describing it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Stroke {
    pub rect: RotatedRect,
    pub bounds: (i32, i32, u32, u32),
}

impl Stroke {
    fn upright_corners(&self) -> [Point<i32>; 4] {
        let (x, y, width, height) = self.bounds;
        let right = x + width as i32 - 1;
        let bottom = y + height as i32 - 1;
        [
            Point::new(x, y),
            Point::new(right, y),
            Point::new(x, bottom),
            Point::new(right, bottom),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PlateCorners {
    pub top_left: Point<i32>,
    pub top_right: Point<i32>,
    pub bottom_left: Point<i32>,
    pub bottom_right: Point<i32>,
}

/// Straightens a binary plate so the area covered by its characters fills
/// the whole image. Plates without recognisable strokes are returned as is.
#[instrument(level = "debug", skip_all, fields(width = plate.width(), height = plate.height()))]
pub fn deskew(plate: &GrayImage, options: &DeskewOptions) -> GrayImage {
    let strokes = find_strokes(plate, options);
    if strokes.is_empty() {
        log::debug!("No strokes found, skipping deskew");
        return plate.clone();
    }
    let Some(corners) = plate_corners(&strokes, options) else {
        log::debug!("Could not place plate corners from {} strokes", strokes.len());
        return plate.clone();
    };
    log::debug!("Plate corners: {corners:?}");

    let (width, height) = (plate.width() as f32, plate.height() as f32);
    let source = [
        corners.bottom_left,
        corners.bottom_right,
        corners.top_left,
        corners.top_right,
    ]
    .map(|p| (p.x as f32, p.y as f32));
    let target = [(0.0, height), (width, height), (0.0, 0.0), (width, 0.0)];

    let Some(projection) = perspective_transform(&source, &target) else {
        log::debug!("Degenerate plate corners {corners:?}, skipping deskew");
        return plate.clone();
    };
    warp(plate, &projection, Interpolation::Nearest, Luma([0]))
}

/// Rotates a binary plate so its long straight lines become horizontal.
#[instrument(level = "debug", skip_all, fields(width = plate.width(), height = plate.height()))]
pub fn deskew_lines(plate: &GrayImage, options: &LineDeskewOptions) -> GrayImage {
    let vote_threshold = ((plate.width() as f32 * options.vote_fraction) as u32).max(1);
    let lines = detect_lines(
        plate,
        LineDetectionOptions {
            vote_threshold,
            suppression_radius: options.suppression_radius,
        },
    );
    let tilts = lines
        .iter()
        .map(|line| line.angle_in_degrees as f32 - 90.0)
        .filter(|tilt| tilt.abs() < options.max_tilt)
        .collect::<Vec<_>>();
    if tilts.is_empty() {
        log::debug!("No dominant lines, skipping rotation");
        return plate.clone();
    }

    let tilt = tilts.iter().sum::<f32>() / tilts.len() as f32;
    log::debug!("Average line tilt {tilt:.3} deg over {} lines", tilts.len());
    rotate_about_center(plate, -tilt.to_radians(), Interpolation::Nearest, Luma([0]))
}

pub(crate) fn find_strokes(plate: &GrayImage, options: &DeskewOptions) -> Vec<Stroke> {
    let plate_area = (plate.width() * plate.height()) as f32;
    find_contours::<i32>(plate)
        .into_iter()
        .filter(|contour| contour.parent.is_none())
        .filter_map(|contour| {
            let rect = rotated_rect(&contour.points)?;
            let (width, height) = rectangle_size(&rect.corners);
            if width == 0.0 || height == 0.0 {
                return None;
            }
            let ratio = width.max(height) / width.min(height);
            let area_ratio = plate_area / (width * height);
            let (min_ratio, max_ratio) = options.stroke_ratio;
            let (min_area, max_area) = options.stroke_area;
            let accepted = min_ratio < ratio
                && ratio < max_ratio
                && min_area < area_ratio
                && area_ratio < max_area;
            log::trace!("Stroke {width:.1}x{height:.1}, ratio {ratio:.3}, area ratio {area_ratio:.3}, accepted: {accepted}");
            if !accepted {
                return None;
            }
            Some(Stroke {
                rect,
                bounds: bounding_box(&contour.points)?,
            })
        })
        .collect()
}

pub(crate) fn plate_corners(strokes: &[Stroke], options: &DeskewOptions) -> Option<PlateCorners> {
    let mut points: Vec<(Point<i32>, usize)> = Vec::new();
    for (index, stroke) in strokes.iter().enumerate() {
        for corner in stroke.rect.corners {
            if !points.iter().any(|(p, _)| *p == corner) {
                points.push((corner, index));
            }
        }
    }
    if points.len() < 4 {
        return None;
    }
    points.sort_by_key(|(p, _)| (p.x, Reverse(p.y)));

    let n = points.len();
    let lower = |a: usize, b: usize| if points[a].0.y >= points[b].0.y { a } else { b };
    let bottom_left = lower(0, 1);
    let bottom_right = lower(n - 2, n - 1);
    let (bottom_left, left) = points[bottom_left];
    let (bottom_right, right) = points[bottom_right];
    let (left, right) = (&strokes[left], &strokes[right]);

    let mut corners = PlateCorners {
        top_left: corner_above(left, bottom_left)?,
        top_right: corner_above(right, bottom_right)?,
        bottom_left,
        bottom_right,
    };
    resolve_rotation(&mut corners, left, right, options.max_angle_delta);

    let m = options.border_margin;
    corners.top_left = Point::new(corners.top_left.x - m, corners.top_left.y - m);
    corners.top_right = Point::new(corners.top_right.x + m, corners.top_right.y - m);
    corners.bottom_left = Point::new(corners.bottom_left.x - m, corners.bottom_left.y + m);
    corners.bottom_right = Point::new(corners.bottom_right.x + m, corners.bottom_right.y + m);
    Some(corners)
}

/// The corner of the same stroke standing over `bottom`: of the stroke's
/// corners above it, the one whose offset is closest to vertical. Its
/// other bottom corner may sit higher on a tilted plate but lies sideways.
fn corner_above(stroke: &Stroke, bottom: Point<i32>) -> Option<Point<i32>> {
    stroke
        .rect
        .corners
        .into_iter()
        .filter(|p| p.y < bottom.y)
        .min_by_key(|p| ((p.x - bottom.x).abs(), p.y))
}

/// A lone upright stroke can get a minimum rectangle at an arbitrary angle.
/// When the outer strokes disagree, the more rotated side uses the stroke's
/// axis-aligned box instead.
fn resolve_rotation(corners: &mut PlateCorners, left: &Stroke, right: &Stroke, max_delta: f32) {
    let (left_skew, right_skew) = (left.rect.skew(), right.rect.skew());
    if (left_skew - right_skew).abs() <= max_delta {
        return;
    }
    log::debug!("Stroke skews disagree: left {left_skew:.2}, right {right_skew:.2}");
    if left_skew.abs() > right_skew.abs() {
        let [top_left, _, bottom_left, _] = left.upright_corners();
        corners.top_left = top_left;
        corners.bottom_left = bottom_left;
    } else {
        let [_, top_right, _, bottom_right] = right.upright_corners();
        corners.top_right = top_right;
        corners.bottom_right = bottom_right;
    }
}

/// Projection taking each `source` point to the matching `target` point.
/// Corners with three of them on one line have none.
pub fn perspective_transform(
    source: &[(f32, f32); 4],
    target: &[(f32, f32); 4],
) -> Option<Projection> {
    let spread = |[a, b, c]: [(f32, f32); 3]| {
        ((b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)).abs()
    };
    let [p, q, r, s] = *source;
    if [[p, q, r], [p, q, s], [p, r, s], [q, r, s]]
        .into_iter()
        .any(|triangle| spread(triangle) < 1.0)
    {
        return None;
    }
    Projection::from_control_points(*source, *target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{segment::segment, SegmentOptions};

    fn tilt(plate: &GrayImage, degrees: f32) -> GrayImage {
        rotate_about_center(plate, degrees.to_radians(), Interpolation::Nearest, Luma([0]))
    }

    fn glyph_plate() -> GrayImage {
        GrayImage::from_fn(300, 100, |x, y| {
            let in_glyph = x >= 10 && (x - 10) % 50 < 30 && x < 290 && (25..75).contains(&y);
            if in_glyph {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    fn stroke(corners: [(i32, i32); 4], angle: f32, bounds: (i32, i32, u32, u32)) -> Stroke {
        Stroke {
            rect: RotatedRect {
                corners: corners.map(|(x, y)| Point::new(x, y)),
                angle,
            },
            bounds,
        }
    }

    #[test]
    fn empty_plate_is_unchanged() {
        let plate = GrayImage::new(120, 40);
        assert_eq!(deskew(&plate, &DeskewOptions::default()), plate);
        assert_eq!(deskew_lines(&plate, &LineDeskewOptions::default()), plate);
    }

    #[test]
    fn glyphs_are_recognised_as_strokes() {
        let strokes = find_strokes(&glyph_plate(), &DeskewOptions::default());
        assert_eq!(strokes.len(), 6);
    }

    #[test]
    fn upright_glyphs_give_their_outer_corners() {
        let options = DeskewOptions::default();
        let strokes = find_strokes(&glyph_plate(), &options);
        let corners = plate_corners(&strokes, &options).unwrap();
        assert_eq!(corners.top_left, Point::new(7, 22));
        assert_eq!(corners.bottom_left, Point::new(7, 77));
        assert_eq!(corners.top_right, Point::new(292, 22));
        assert_eq!(corners.bottom_right, Point::new(292, 77));
    }

    #[test]
    fn deskew_keeps_plate_dimensions() {
        let plate = glyph_plate();
        let straightened = deskew(&plate, &DeskewOptions::default());
        assert_eq!(straightened.dimensions(), plate.dimensions());
        assert!(straightened.pixels().any(|p| p[0] == 255));
    }

    #[test]
    fn rotated_outer_stroke_falls_back_to_upright_box() {
        let left = stroke([(12, 10), (30, 14), (26, 52), (8, 48)], 12.5, (8, 10, 23, 43));
        let right = stroke([(200, 10), (220, 10), (220, 50), (200, 50)], 0.0, (200, 10, 21, 41));
        let mut corners = PlateCorners {
            top_left: Point::new(12, 10),
            top_right: Point::new(220, 10),
            bottom_left: Point::new(8, 48),
            bottom_right: Point::new(220, 50),
        };
        resolve_rotation(&mut corners, &left, &right, 10.0);
        assert_eq!(corners.top_left, Point::new(8, 10));
        assert_eq!(corners.bottom_left, Point::new(8, 52));
        assert_eq!(corners.top_right, Point::new(220, 10));
    }

    #[test]
    fn similar_skews_are_kept() {
        let left = stroke([(0, 0); 4], 5.0, (0, 0, 1, 1));
        let right = stroke([(0, 0); 4], -3.0, (0, 0, 1, 1));
        let original = PlateCorners {
            top_left: Point::new(1, 1),
            top_right: Point::new(9, 1),
            bottom_left: Point::new(1, 5),
            bottom_right: Point::new(9, 5),
        };
        let mut corners = original;
        resolve_rotation(&mut corners, &left, &right, 10.0);
        assert_eq!(corners, original);
    }

    #[test]
    fn transform_maps_control_points() {
        let source = [(10.0, 90.0), (280.0, 95.0), (14.0, 8.0), (290.0, 2.0)];
        let target = [(0.0, 100.0), (300.0, 100.0), (0.0, 0.0), (300.0, 0.0)];
        let projection = perspective_transform(&source, &target).unwrap();
        for (point, (u, v)) in source.into_iter().zip(target) {
            let (x, y) = projection * point;
            assert!((x - u).abs() < 0.05, "{point:?} -> ({x}, {y})");
            assert!((y - v).abs() < 0.05, "{point:?} -> ({x}, {y})");
        }
    }

    #[test]
    fn collapsed_corners_have_no_transform() {
        let target = [(0.0, 10.0), (10.0, 10.0), (0.0, 0.0), (10.0, 0.0)];
        assert!(perspective_transform(&[(5.0, 5.0); 4], &target).is_none());
        let collinear = [(0.0, 0.0), (10.0, 0.0), (20.0, 0.0), (3.0, 8.0)];
        assert!(perspective_transform(&collinear, &target).is_none());
    }

    #[test]
    fn tilted_glyph_top_corners_stay_on_their_stroke() {
        let options = DeskewOptions::default();
        for degrees in [-6.0f32, 6.0] {
            let tilted = tilt(&glyph_plate(), degrees);
            let strokes = find_strokes(&tilted, &options);
            assert_eq!(strokes.len(), 6, "{degrees} deg");
            let corners = plate_corners(&strokes, &options).unwrap();
            assert!(
                corners.bottom_left.y - corners.top_left.y > 40,
                "{degrees} deg: {corners:?}"
            );
            assert!(
                corners.bottom_right.y - corners.top_right.y > 40,
                "{degrees} deg: {corners:?}"
            );
            assert!((corners.top_left.x - corners.bottom_left.x).abs() < 12);
            assert!((corners.top_right.x - corners.bottom_right.x).abs() < 12);
        }
    }

    #[test]
    fn tilted_plates_still_segment_into_six_characters() {
        let options = DeskewOptions::default();
        for degrees in [-6.0f32, -4.0, -2.0, 2.0, 4.0, 6.0] {
            let straight = deskew(&tilt(&glyph_plate(), degrees), &options);
            let segmentation = segment(&straight, &SegmentOptions::default());
            assert_eq!(segmentation.boxes.len(), 6, "{degrees} deg");
        }
    }

    #[test]
    fn stroke_top_corner_is_the_vertical_neighbour() {
        // A 30x50 glyph leaning right: its bottom-right corner sits higher
        // than the bottom-left one.
        let leaning = stroke([(15, 20), (45, 17), (40, -33), (10, -30)], -5.7, (10, -33, 36, 54));
        assert_eq!(corner_above(&leaning, Point::new(15, 20)), Some(Point::new(10, -30)));
        assert_eq!(corner_above(&leaning, Point::new(45, 17)), Some(Point::new(40, -33)));
        assert_eq!(corner_above(&leaning, Point::new(40, -33)), None);
    }
}
