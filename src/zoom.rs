use std::collections::HashMap;

use image::{DynamicImage, Rgb, RgbImage};
use tracing::instrument;

/// Doubles the resolution of small plate crops before segmentation.
pub trait Zoom {
    fn upscale_2x(&mut self, image: &DynamicImage) -> DynamicImage;
}

/// Thresholds on the YUV components under which two colours count as equal.
const Y_THRESHOLD: i32 = 48;
const U_THRESHOLD: i32 = 7;
const V_THRESHOLD: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Yuv {
    y: i32,
    u: i32,
    v: i32,
}

impl Yuv {
    fn similar(self, other: Yuv) -> bool {
        (self.y - other.y).abs() <= Y_THRESHOLD
            && (self.u - other.u).abs() <= U_THRESHOLD
            && (self.v - other.v).abs() <= V_THRESHOLD
    }
}

/// Memoized RGB to YUV conversions. Lives as long as the zoom that owns it.
#[derive(Debug, Default)]
pub struct YuvCache {
    colors: HashMap<[u8; 3], Yuv>,
}

impl YuvCache {
    fn get(&mut self, rgb: Rgb<u8>) -> Yuv {
        *self.colors.entry(rgb.0).or_insert_with(|| {
            let [r, g, b] = rgb.0.map(i32::from);
            Yuv {
                y: (r + g + b) >> 2,
                u: 128 + ((r - b) >> 2),
                v: 128 + ((-r + g * 2 - b) >> 3),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

/// Pixel-art 2x magnification (EPX / Scale2x) with a tolerant colour
/// comparison, so near-identical shades still form a continuous edge. Only
/// existing colours are copied, never blended, which keeps binary plates
/// binary.
#[derive(Debug, Default)]
pub struct Scale2x {
    cache: YuvCache,
}

impl Scale2x {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &YuvCache {
        &self.cache
    }

    fn same(&mut self, a: Rgb<u8>, b: Rgb<u8>) -> bool {
        a == b || self.cache.get(a).similar(self.cache.get(b))
    }
}

impl Zoom for Scale2x {
    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    fn upscale_2x(&mut self, image: &DynamicImage) -> DynamicImage {
        let source = image.to_rgb8();
        let (width, height) = source.dimensions();
        let mut output = RgbImage::new(width * 2, height * 2);
        let at = |x: i64, y: i64| {
            let x = x.clamp(0, width as i64 - 1) as u32;
            let y = y.clamp(0, height as i64 - 1) as u32;
            *source.get_pixel(x, y)
        };

        for y in 0..height {
            for x in 0..width {
                let (xi, yi) = (x as i64, y as i64);
                let center = at(xi, yi);
                let up = at(xi, yi - 1);
                let left = at(xi - 1, yi);
                let right = at(xi + 1, yi);
                let down = at(xi, yi + 1);

                let mut block = [center; 4];
                if self.same(left, up) && !self.same(left, down) && !self.same(up, right) {
                    block[0] = up;
                }
                if self.same(up, right) && !self.same(up, left) && !self.same(right, down) {
                    block[1] = right;
                }
                if self.same(down, left) && !self.same(down, right) && !self.same(left, up) {
                    block[2] = left;
                }
                if self.same(right, down) && !self.same(right, up) && !self.same(down, left) {
                    block[3] = down;
                }

                output.put_pixel(x * 2, y * 2, block[0]);
                output.put_pixel(x * 2 + 1, y * 2, block[1]);
                output.put_pixel(x * 2, y * 2 + 1, block[2]);
                output.put_pixel(x * 2 + 1, y * 2 + 1, block[3]);
            }
        }

        DynamicImage::ImageRgb8(output)
    }
}
