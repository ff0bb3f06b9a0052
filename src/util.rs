use std::path::Path;

use geo::{Coord, LineString, MinimumRotatedRect, Polygon};
use image::{DynamicImage, GrayImage, Luma, Pixel, Rgb};
use imageproc::{
    definitions::Image,
    drawing::draw_polygon_mut,
    integral_image::{integral_image, sum_image_pixels},
    morphology::{grayscale_close, Mask},
    point::Point,
};
use ndarray::Array3;
use tracing::instrument;

use crate::{PlateError, Quad, Result};

#[instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
pub fn load_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
    let path = path.as_ref();
    image::open(path).map_err(|source| PlateError::Load {
        path: path.to_path_buf(),
        source,
    })
}

pub fn distance(a: Point<i32>, b: Point<i32>) -> f32 {
    ((a.x - b.x) as f32).hypot((a.y - b.y) as f32)
}

/// Width and height of the (possibly rotated) rectangle spanned by four
/// points given in any order.
///
/// The two leftmost points form one vertical side and the two rightmost the
/// other; each left point is paired with the right point on the closest row.
/// Degenerate input yields zero sides rather than an error.
pub fn rectangle_size(points: &[Point<i32>; 4]) -> (f32, f32) {
    let mut p = *points;
    p.sort_by_key(|it| (it.x, it.y));

    let height = distance(p[0], p[1]).max(distance(p[2], p[3]));

    let partner = |q: Point<i32>| {
        if (q.y - p[2].y).abs() < (q.y - p[3].y).abs() {
            p[2]
        } else {
            p[3]
        }
    };
    let width = distance(p[0], partner(p[0])).max(distance(p[1], partner(p[1])));

    (width, height)
}

pub(crate) fn to_geo_poly(points: &[Point<i32>]) -> Polygon<f32> {
    let points = points
        .iter()
        .map(|point| Coord {
            x: point.x as f32,
            y: point.y as f32,
        })
        .collect();
    Polygon::new(LineString::new(points), vec![])
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RotatedRect {
    pub corners: [Point<i32>; 4],
    /// Direction of the first edge in degrees.
    pub angle: f32,
}

impl RotatedRect {
    /// Deviation from the nearest axis, in `(-45, 45]` degrees.
    pub fn skew(&self) -> f32 {
        let angle = self.angle.rem_euclid(90.0);
        if angle > 45.0 {
            angle - 90.0
        } else {
            angle
        }
    }
}

pub(crate) fn rotated_rect(points: &[Point<i32>]) -> Option<RotatedRect> {
    let rect = to_geo_poly(points).minimum_rotated_rect()?;
    let coords = &rect.exterior().0;
    if coords.len() < 4 {
        return None;
    }
    let angle = (coords[1].y - coords[0].y)
        .atan2(coords[1].x - coords[0].x)
        .to_degrees();
    let corners = [
        round_coord(coords[0]),
        round_coord(coords[1]),
        round_coord(coords[2]),
        round_coord(coords[3]),
    ];
    Some(RotatedRect { corners, angle })
}

fn round_coord(coord: Coord<f32>) -> Point<i32> {
    Point::new(coord.x.round() as i32, coord.y.round() as i32)
}

/// Axis-aligned bounds `(x, y, width, height)` covering every point, sides
/// counted in pixels.
pub(crate) fn bounding_box(points: &[Point<i32>]) -> Option<(i32, i32, u32, u32)> {
    let first = points.first()?;
    let (min_x, min_y, max_x, max_y) = points.iter().fold(
        (first.x, first.y, first.x, first.y),
        |(min_x, min_y, max_x, max_y), p| {
            (min_x.min(p.x), min_y.min(p.y), max_x.max(p.x), max_y.max(p.y))
        },
    );
    Some((
        min_x,
        min_y,
        (max_x - min_x + 1) as u32,
        (max_y - min_y + 1) as u32,
    ))
}

/// Crops the bounding box of `quad` out of `image` as an owned copy.
pub(crate) fn part_image(image: &DynamicImage, quad: &Quad) -> Option<DynamicImage> {
    let (min_x, min_y, max_x, max_y) = quad.bounds();
    let x = min_x.clamp(0, image.width() as i32) as u32;
    let y = min_y.clamp(0, image.height() as i32) as u32;
    let right = (max_x + 1).clamp(0, image.width() as i32) as u32;
    let bottom = (max_y + 1).clamp(0, image.height() as i32) as u32;
    if right <= x || bottom <= y {
        return None;
    }
    log::trace!("Slicing subimage to ({x}, {y}) - ({right}, {bottom})");
    Some(image.crop_imm(x, y, right - x, bottom - y))
}

/// Inverse-binary adaptive threshold: a pixel becomes foreground when it is
/// at least `c` darker than the mean of its `(2r + 1)²` neighbourhood.
#[instrument(level = "trace", skip(image))]
pub(crate) fn adaptive_threshold_inv(image: &GrayImage, block_radius: u32, c: i32) -> GrayImage {
    let (width, height) = image.dimensions();
    let integral: Image<Luma<u64>> = integral_image::<_, u64>(image);

    GrayImage::from_fn(width, height, |x, y| {
        let left = x.saturating_sub(block_radius);
        let top = y.saturating_sub(block_radius);
        let right = (x + block_radius).min(width - 1);
        let bottom = (y + block_radius).min(height - 1);
        let count = ((right - left + 1) * (bottom - top + 1)) as u64;
        let [sum] = sum_image_pixels(&integral, left, top, right, bottom);
        let mean = (sum / count) as i32;
        if image.get_pixel(x, y)[0] as i32 <= mean - c {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Binary closing with a `width` x `height` rectangle anchored at its centre.
#[instrument(level = "trace", skip(image))]
pub(crate) fn close_rect(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    let (width, height) = (width.clamp(1, 511), height.clamp(1, 511));
    let element = GrayImage::from_pixel(width, height, Luma([255]));
    let mask = Mask::from_image(&element, (width / 2) as u8, (height / 2) as u8);
    grayscale_close(image, &mask)
}

/// Fills the region enclosed by a contour with background.
pub(crate) fn erase_contour(image: &mut GrayImage, points: &[Point<i32>]) {
    let mut poly = points.to_vec();
    poly.dedup();
    while poly.len() > 1 && poly.first() == poly.last() {
        poly.pop();
    }
    if poly.len() >= 3 {
        draw_polygon_mut(image, &poly, Luma([0]));
    }
    let (width, height) = image.dimensions();
    for p in points {
        if p.x >= 0 && p.y >= 0 && (p.x as u32) < width && (p.y as u32) < height {
            image.put_pixel(p.x as u32, p.y as u32, Luma([0]));
        }
    }
}

#[cfg(feature = "debug")]
pub(crate) fn save_debug(image: &GrayImage, name: &str) {
    let dir = Path::new("debug_images");
    let saved = std::fs::create_dir_all(dir)
        .map_err(image::ImageError::IoError)
        .and_then(|_| image.save(dir.join(format!("{name}.png"))));
    if let Err(err) = saved {
        log::warn!("Failed to save debug image {name}: {err}");
    }
}

#[instrument(level = "trace", skip(image))]
pub(crate) fn subtract_mean_normalize(
    image: &DynamicImage,
    mean_vals: &[f32; 3],
    norm_vals: &[f32; 3],
) -> Array3<f32> {
    let mut image = image.to_rgb32f();
    let norm = Rgb::<f32>(*norm_vals);
    let mean_vals = Rgb::<f32>(*mean_vals).map2(&norm, |c1, c2| c1 * c2);
    for pixel in image.pixels_mut() {
        *pixel = pixel
            .map2(&norm, |c1, c2| c1 * c2)
            .map2(&mean_vals, |c1, c2| c1 - c2);
    }
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| image.get_pixel(x as u32, y as u32).channels()[ch],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(points: [(i32, i32); 4]) -> [Point<i32>; 4] {
        points.map(|(x, y)| Point::new(x, y))
    }

    #[test]
    fn axis_aligned_rectangle_size() {
        let (w, h) = rectangle_size(&quad([(10, 10), (210, 10), (10, 52), (210, 52)]));
        assert_eq!(w, 200.0);
        assert_eq!(h, 42.0);
    }

    #[test]
    fn size_is_independent_of_point_order() {
        let points = [(3, 40), (100, 22), (7, 4), (95, 61)];
        let expected = rectangle_size(&quad(points));
        let orders = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
            [1, 0, 2, 3],
            [3, 1, 2, 0],
        ];
        for order in orders {
            let permuted = order.map(|i| points[i]);
            assert_eq!(rectangle_size(&quad(permuted)), expected);
        }
    }

    #[test]
    fn identical_points_have_no_size() {
        assert_eq!(rectangle_size(&quad([(5, 5); 4])), (0.0, 0.0));
    }

    #[test]
    fn skew_folds_to_nearest_axis() {
        let rect = |angle| RotatedRect {
            corners: [Point::new(0, 0); 4],
            angle,
        };
        assert_eq!(rect(90.0).skew(), 0.0);
        assert_eq!(rect(-5.0).skew(), -5.0);
        assert_eq!(rect(100.0).skew(), 10.0);
        assert_eq!(rect(30.0).skew(), 30.0);
    }

    #[test]
    fn adaptive_threshold_marks_dark_strokes() {
        let mut image = GrayImage::from_pixel(20, 20, Luma([200]));
        for y in 5..15 {
            image.put_pixel(10, y, Luma([20]));
        }
        let binary = adaptive_threshold_inv(&image, 3, 2);
        assert_eq!(binary.get_pixel(10, 10)[0], 255);
        assert_eq!(binary.get_pixel(2, 2)[0], 0);
    }

    #[test]
    fn adaptive_threshold_handles_image_corners() {
        let mut image = GrayImage::from_pixel(12, 12, Luma([200]));
        image.put_pixel(0, 0, Luma([10]));
        image.put_pixel(11, 11, Luma([10]));
        let binary = adaptive_threshold_inv(&image, 5, 2);
        assert_eq!(binary.get_pixel(0, 0)[0], 255);
        assert_eq!(binary.get_pixel(11, 11)[0], 255);
        assert_eq!(binary.pixels().filter(|p| p[0] == 255).count(), 2);
    }

    #[test]
    fn closing_bridges_horizontal_gaps() {
        let mut image = GrayImage::new(40, 9);
        for y in 3..6 {
            for x in (5..35).filter(|x| x % 4 != 0) {
                image.put_pixel(x, y, Luma([255]));
            }
        }
        let closed = close_rect(&image, 5, 3);
        assert_eq!(closed.get_pixel(8, 4)[0], 255);
        assert_eq!(closed.get_pixel(20, 4)[0], 255);
        assert_eq!(closed.get_pixel(20, 0)[0], 0);
    }

    #[test]
    fn closing_keeps_distant_blobs_apart() {
        let mut image = GrayImage::new(120, 9);
        for y in 3..6 {
            for x in (10..30).chain(70..90) {
                image.put_pixel(x, y, Luma([255]));
            }
        }
        let closed = close_rect(&image, 29, 3);
        assert_eq!(closed.get_pixel(50, 4)[0], 0);
        assert_eq!(closed.get_pixel(20, 4)[0], 255);
        assert_eq!(closed, close_rect(&closed, 29, 3));
    }

    #[test]
    fn erased_contour_leaves_background() {
        let mut image = GrayImage::new(10, 10);
        for y in 2..6 {
            for x in 3..7 {
                image.put_pixel(x, y, Luma([255]));
            }
        }
        let contours = imageproc::contours::find_contours::<i32>(&image);
        assert_eq!(contours.len(), 1);
        erase_contour(&mut image, &contours[0].points);
        assert!(image.pixels().all(|p| p[0] == 0));
    }
}
