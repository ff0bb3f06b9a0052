use std::path::PathBuf;

use float_ord::FloatOrd;
use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, Luma};
use ndarray::{ArrayView2, Axis, Ix2};
use ort::{inputs, GraphOptimizationLevel, Session};
use tracing::instrument;

use crate::{util::subtract_mean_normalize, PlateError, Recognition, Recognizer, Result};

const MEAN_VALUES: [f32; 3] = [0.5, 0.5, 0.5];
const NORM_VALUES: [f32; 3] = [2.0, 2.0, 2.0];
const INPUT_HEIGHT: u32 = 48;
/// White margin around each glyph; recognizers struggle with ink touching
/// the image edge.
const BORDER: u32 = 20;
/// Characters that can appear on a plate.
pub const PLATE_CHARACTERS: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// CTC text recognizer running an ONNX CRNN model over single glyphs.
pub struct CrnnNet {
    session: Session,
    keys: Vec<String>,
    allowed: Vec<bool>,
}

impl CrnnNet {
    #[instrument(level = "debug")]
    pub fn init(model_path: PathBuf, keys_path: PathBuf, num_threads: usize) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_inter_threads(num_threads)?
            .with_intra_threads(num_threads)?
            .commit_from_file(&model_path)?;

        let keys = std::fs::read_to_string(&keys_path).map_err(|source| PlateError::Io {
            path: keys_path,
            source,
        })?;
        let keys = ["#".to_string()]
            .into_iter()
            .chain(keys.lines().map(|line| line.to_string()))
            .chain([" ".to_string()])
            .collect::<Vec<_>>();
        let allowed = allowed_keys(&keys);

        log::debug!("CRNN Inputs: {:?}", session.inputs);
        log::debug!("CRNN Outputs: {:?}", session.outputs);
        log::debug!(
            "{} keys, {} usable on plates",
            keys.len(),
            allowed.iter().filter(|it| **it).count()
        );

        Ok(Self {
            session,
            keys,
            allowed,
        })
    }
}

impl Recognizer for CrnnNet {
    #[instrument(level = "trace", skip(self, glyph))]
    fn recognize(&self, glyph: &GrayImage) -> Result<Recognition> {
        let image = DynamicImage::ImageLuma8(pad(glyph));
        let scale = INPUT_HEIGHT as f32 / image.height() as f32;
        let dest_width = ((image.width() as f32 * scale) as u32).clamp(1, u16::MAX as u32);
        let image = image.resize_exact(dest_width, INPUT_HEIGHT, FilterType::Nearest);

        let tensor_values =
            subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self.session.run(inputs!["x" => tensor_values]?)?;
        let output_tensor = outputs
            .first_key_value()
            .ok_or_else(|| PlateError::Recognition("model produced no outputs".into()))?
            .1
            .try_extract_tensor::<f32>()?;

        log::trace!("Output tensor size: {:?}", output_tensor.shape());
        if output_tensor.ndim() != 3 {
            return Err(PlateError::Recognition(format!(
                "expected a 3D score tensor, got shape {:?}",
                output_tensor.shape()
            )));
        }
        let scores = output_tensor
            .remove_axis(Axis(0))
            .into_dimensionality::<Ix2>()
            .map_err(|err| PlateError::Recognition(err.to_string()))?;

        Ok(decode(scores, &self.keys, &self.allowed))
    }
}

fn pad(glyph: &GrayImage) -> GrayImage {
    let mut padded = GrayImage::from_pixel(
        glyph.width() + BORDER * 2,
        glyph.height() + BORDER * 2,
        Luma([255]),
    );
    imageops::replace(&mut padded, glyph, BORDER as i64, BORDER as i64);
    padded
}

fn allowed_keys(keys: &[String]) -> Vec<bool> {
    keys.iter()
        .map(|key| {
            let mut chars = key.chars();
            matches!((chars.next(), chars.next()), (Some(c), None) if PLATE_CHARACTERS.contains(c))
        })
        .collect()
}

/// Greedy CTC decoding: best class per time step, blanks and repeats
/// collapsed, classes outside the plate alphabet dropped. The confidence is
/// the mean score of the kept steps.
fn decode(scores: ArrayView2<f32>, keys: &[String], allowed: &[bool]) -> Recognition {
    let mut previous = None;
    let mut kept = Vec::new();
    for step in scores.outer_iter() {
        let best = step
            .indexed_iter()
            .max_by_key(|(_, score)| FloatOrd(**score))
            .map(|(i, score)| (i, *score));
        let Some((index, score)) = best else {
            continue;
        };
        if previous != Some(index) && index > 0 && allowed.get(index).copied().unwrap_or(false) {
            kept.push((keys[index].as_str(), score));
        }
        previous = Some(index);
    }

    let text = kept.iter().map(|(key, _)| *key).collect::<String>();
    let confidence = if kept.is_empty() {
        0.0
    } else {
        kept.iter().map(|(_, score)| score).sum::<f32>() / kept.len() as f32
    };
    Recognition { text, confidence }
}
