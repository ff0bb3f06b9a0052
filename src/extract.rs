use image::{imageops, DynamicImage, GrayImage};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use tracing::instrument;

use crate::{util::part_image, zoom::Zoom, Candidate, Detector, PlateRegion};

#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    /// Crops with fewer pixels than this are upscaled 2x before use.
    pub legibility_area: u32,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            legibility_area: 4500,
        }
    }
}

/// Crops every candidate out of `image` and turns it into a white-on-black
/// binary plate, upscaling the ones too small to read.
#[instrument(level = "debug", skip(image, candidates, zoom, options))]
pub fn extract_regions(
    image: &DynamicImage,
    detector: Detector,
    candidates: &[Candidate],
    zoom: &mut impl Zoom,
    options: &ExtractOptions,
) -> Vec<PlateRegion> {
    candidates
        .iter()
        .filter_map(|candidate| {
            let Some(crop) = part_image(image, &candidate.quad) else {
                log::debug!("Dropping candidate outside the image: {:?}", candidate.quad);
                return None;
            };
            let binary = binarize_plate(&crop);

            let area = binary.width() * binary.height();
            let enhanced = area < options.legibility_area;
            let image = if enhanced {
                log::debug!("Plate area {area} below {}, zooming", options.legibility_area);
                zoom.upscale_2x(&DynamicImage::ImageLuma8(binary)).to_luma8()
            } else {
                binary
            };

            Some(PlateRegion {
                detector,
                candidate: *candidate,
                image,
                enhanced,
            })
        })
        .collect()
}

/// Dark characters on a light plate become white strokes on black.
fn binarize_plate(crop: &DynamicImage) -> GrayImage {
    let mut gray = crop.to_luma8();
    imageops::invert(&mut gray);
    let level = otsu_level(&gray);
    threshold(&gray, level, ThresholdType::Binary)
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma};
    use imageproc::point::Point;

    use super::*;
    use crate::Quad;

    #[derive(Default)]
    struct CountingZoom {
        calls: usize,
    }

    impl Zoom for CountingZoom {
        fn upscale_2x(&mut self, image: &DynamicImage) -> DynamicImage {
            self.calls += 1;
            image.resize_exact(
                image.width() * 2,
                image.height() * 2,
                imageops::FilterType::Nearest,
            )
        }
    }

    fn square(x: i32, y: i32, side: i32) -> Candidate {
        Candidate::new(Quad([
            Point::new(x, y),
            Point::new(x + side - 1, y),
            Point::new(x, y + side - 1),
            Point::new(x + side - 1, y + side - 1),
        ]))
    }

    fn photo() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(200, 200, |x, y| {
            if (x / 5 + y / 5) % 2 == 0 {
                Luma([220])
            } else {
                Luma([20])
            }
        }))
    }

    #[test]
    fn small_crop_is_zoomed_once() {
        let mut zoom = CountingZoom::default();
        let regions = extract_regions(
            &photo(),
            Detector::ThresholdBlur,
            &[square(10, 10, 60)],
            &mut zoom,
            &ExtractOptions::default(),
        );
        assert_eq!(zoom.calls, 1);
        assert_eq!(regions.len(), 1);
        assert!(regions[0].enhanced);
        assert_eq!(regions[0].image.dimensions(), (120, 120));
    }

    #[test]
    fn large_crop_is_left_alone() {
        let mut zoom = CountingZoom::default();
        let regions = extract_regions(
            &photo(),
            Detector::EdgeBased,
            &[square(0, 0, 100)],
            &mut zoom,
            &ExtractOptions::default(),
        );
        assert_eq!(zoom.calls, 0);
        assert!(!regions[0].enhanced);
        assert_eq!(regions[0].image.dimensions(), (100, 100));
    }

    #[test]
    fn crop_is_clamped_and_inverted() {
        let mut zoom = CountingZoom::default();
        let regions = extract_regions(
            &photo(),
            Detector::MorphologicalGradient,
            &[square(180, 180, 100), square(300, 300, 10)],
            &mut zoom,
            &ExtractOptions {
                legibility_area: 0,
            },
        );
        assert_eq!(regions.len(), 1);
        let plate = &regions[0].image;
        assert_eq!(plate.dimensions(), (20, 20));
        // (180, 180) is light in the photo, so it reads as background.
        assert_eq!(plate.get_pixel(0, 0)[0], 0);
        assert_eq!(plate.get_pixel(5, 0)[0], 255);
    }
}
