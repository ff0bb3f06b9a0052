use geo::{Area, IsConvex};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::{
    contours::find_contours,
    contrast::{otsu_level, threshold, ThresholdType},
    edges::canny,
    filter::{bilateral_filter, gaussian_blur_f32},
    geometry::{approximate_polygon_dp, arc_length},
    gradients::horizontal_sobel,
    point::Point,
};
use tracing::instrument;

use crate::{
    util::{adaptive_threshold_inv, close_rect, rotated_rect, to_geo_poly},
    Candidate, CandidateValidator, PlateError, Quad, Result,
};

/// Plate localisation strategies. Each one builds a binary mask of the image
/// in its own way and turns the mask's contours into quadrilaterals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum Detector {
    /// Adaptive threshold over a blurred image, 4-vertex polygons.
    ThresholdBlur,
    /// Canny edges over an adaptive threshold, 4-vertex polygons.
    #[value(name = "edge")]
    EdgeBased,
    /// Horizontal gradient closed into blobs, rotated bounding rectangles.
    #[value(name = "morphology")]
    MorphologicalGradient,
}

impl Detector {
    pub const ALL: [Detector; 3] = [
        Detector::ThresholdBlur,
        Detector::EdgeBased,
        Detector::MorphologicalGradient,
    ];

    /// Finds every candidate the validator accepts. An image without plates
    /// gives an empty list.
    #[instrument(level = "debug", skip(image, options, validator))]
    pub fn find_candidates(
        &self,
        image: &DynamicImage,
        options: &DetectorOptions,
        validator: &CandidateValidator,
    ) -> Result<Vec<Candidate>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(PlateError::InvalidImage(format!(
                "image has no pixels ({}x{})",
                image.width(),
                image.height()
            )));
        }
        let gray = image.to_luma8();
        let mask = self.mask(&gray, options);
        #[cfg(feature = "debug")]
        crate::util::save_debug(&mask, &format!("{self:?}_mask"));

        let candidates = match self {
            Detector::ThresholdBlur => polygon_candidates(
                &mask,
                options.threshold_blur.min_contour_area,
                options.threshold_blur.approx_epsilon,
            ),
            Detector::EdgeBased => polygon_candidates(
                &mask,
                options.edge.min_contour_area,
                options.edge.approx_epsilon,
            ),
            Detector::MorphologicalGradient => rect_candidates(&mask),
        };
        log::debug!("{self:?} produced {} raw candidates", candidates.len());

        Ok(candidates
            .into_iter()
            .filter(|candidate| validator.accepts(candidate))
            .collect())
    }

    /// The binary mask contours are extracted from.
    pub fn mask(&self, gray: &GrayImage, options: &DetectorOptions) -> GrayImage {
        match self {
            Detector::ThresholdBlur => {
                let ThresholdBlurOptions {
                    blur,
                    block_radius,
                    threshold_offset,
                    ..
                } = options.threshold_blur;
                let blurred = blur.apply(gray);
                adaptive_threshold_inv(&blurred, block_radius, threshold_offset)
            }
            Detector::EdgeBased => {
                let EdgeOptions {
                    blur,
                    block_radius,
                    threshold_offset,
                    sigma,
                    canny_low,
                    canny_high,
                    ..
                } = options.edge;
                let blurred = blur.apply(gray);
                let binary = adaptive_threshold_inv(&blurred, block_radius, threshold_offset);
                let smoothed = gaussian_blur_f32(&binary, sigma);
                canny(&smoothed, canny_low, canny_high)
            }
            Detector::MorphologicalGradient => {
                let MorphologyOptions {
                    blur,
                    close_width,
                    close_height,
                } = options.morphology;
                let blurred = blur.apply(gray);
                let gradient = horizontal_sobel(&blurred);
                let gradient = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
                    Luma([gradient.get_pixel(x, y)[0].unsigned_abs().min(255) as u8])
                });
                let level = otsu_level(&gradient);
                let binary = threshold(&gradient, level, ThresholdType::Binary);
                close_rect(&binary, close_width, close_height)
            }
        }
    }
}

/// Edge-preserving smoothing applied before masking.
#[derive(Debug, Clone, Copy)]
pub struct BilateralOptions {
    /// Side of the square window, in pixels.
    pub window: u32,
    pub sigma_color: f32,
    pub sigma_spatial: f32,
}

impl BilateralOptions {
    pub fn apply(&self, gray: &GrayImage) -> GrayImage {
        bilateral_filter(gray, self.window, self.sigma_color, self.sigma_spatial)
    }
}

impl Default for BilateralOptions {
    fn default() -> Self {
        Self {
            window: 11,
            sigma_color: 20.0,
            sigma_spatial: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThresholdBlurOptions {
    pub blur: BilateralOptions,
    pub block_radius: u32,
    pub threshold_offset: i32,
    pub min_contour_area: f32,
    /// Polygon approximation tolerance as a fraction of the perimeter.
    pub approx_epsilon: f64,
}

impl Default for ThresholdBlurOptions {
    fn default() -> Self {
        Self {
            blur: BilateralOptions {
                window: 7,
                sigma_color: 20.0,
                sigma_spatial: 15.0,
            },
            block_radius: 5,
            threshold_offset: 2,
            min_contour_area: 200.0,
            approx_epsilon: 0.045,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeOptions {
    pub blur: BilateralOptions,
    pub block_radius: u32,
    pub threshold_offset: i32,
    pub sigma: f32,
    pub canny_low: f32,
    pub canny_high: f32,
    pub min_contour_area: f32,
    pub approx_epsilon: f64,
}

impl Default for EdgeOptions {
    fn default() -> Self {
        Self {
            blur: BilateralOptions::default(),
            block_radius: 8,
            threshold_offset: 2,
            sigma: 0.8,
            canny_low: 100.0,
            canny_high: 100.0,
            min_contour_area: 50.0,
            approx_epsilon: 0.02,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MorphologyOptions {
    pub blur: BilateralOptions,
    /// The closing element spans roughly one character row.
    pub close_width: u32,
    pub close_height: u32,
}

impl Default for MorphologyOptions {
    fn default() -> Self {
        Self {
            blur: BilateralOptions::default(),
            close_width: 29,
            close_height: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectorOptions {
    pub threshold_blur: ThresholdBlurOptions,
    pub edge: EdgeOptions,
    pub morphology: MorphologyOptions,
}

#[instrument(level = "trace", skip(mask))]
fn polygon_candidates(mask: &GrayImage, min_area: f32, epsilon: f64) -> Vec<Candidate> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|contour| contour.points.len() > 2)
        .filter(|contour| to_geo_poly(&contour.points).unsigned_area() > min_area)
        .filter_map(|contour| convex_quad(approximate_polygon(contour.points, epsilon)))
        .map(Candidate::new)
        .collect()
}

fn rect_candidates(mask: &GrayImage) -> Vec<Candidate> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|contour| contour.points.len() > 2)
        .filter_map(|contour| rotated_rect(&contour.points))
        .map(|rect| Candidate::new(Quad(rect.corners)))
        .collect()
}

/// Douglas-Peucker over a closed contour. The first point always survives
/// the approximation, so the contour is rotated to start at its top-left
/// extreme, and a second pass drops the start point if it is not a corner.
fn approximate_polygon(mut points: Vec<Point<i32>>, epsilon: f64) -> Vec<Point<i32>> {
    let epsilon = epsilon * arc_length(&points, true);
    if epsilon <= 0.0 {
        return points;
    }
    if let Some(start) = (0..points.len()).min_by_key(|&i| points[i].x + points[i].y) {
        points.rotate_left(start);
    }

    let mut approx = strip_closing(approximate_polygon_dp(&points, epsilon, true));
    if approx.len() > 4 {
        let middle = approx.len() / 2;
        approx.rotate_left(middle);
        approx = strip_closing(approximate_polygon_dp(&approx, epsilon, true));
    }
    approx
}

fn strip_closing(mut polygon: Vec<Point<i32>>) -> Vec<Point<i32>> {
    polygon.dedup();
    while polygon.len() > 1 && polygon.first() == polygon.last() {
        polygon.pop();
    }
    polygon
}

fn convex_quad(polygon: Vec<Point<i32>>) -> Option<Quad> {
    let corners: [Point<i32>; 4] = strip_closing(polygon).try_into().ok()?;
    if to_geo_poly(&corners).exterior().is_convex() {
        Some(Quad(corners))
    } else {
        None
    }
}
