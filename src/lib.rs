use std::collections::BTreeSet;

use image::{imageops, DynamicImage, GrayImage};
use tracing::instrument;

mod crnn_net;
pub mod deskew;
pub mod detector;
mod error;
pub mod extract;
mod result;
pub mod segment;
pub mod util;
pub mod validator;
pub mod zoom;

pub use crnn_net::{CrnnNet, PLATE_CHARACTERS};
pub use deskew::{deskew, deskew_lines, DeskewMethod, DeskewOptions, LineDeskewOptions};
pub use detector::{BilateralOptions, Detector, DetectorOptions};
pub use error::{PlateError, Result};
pub use extract::{extract_regions, ExtractOptions};
pub use result::*;
pub use segment::{segment, segment_characters, SegmentOptions};
pub use validator::{CandidateValidator, PlateGeometry};
pub use zoom::{Scale2x, Zoom};

pub use ort as runtime;

/// Reads the text of one character image, dark glyph on a light background.
pub trait Recognizer {
    fn recognize(&self, glyph: &GrayImage) -> Result<Recognition>;
}

pub struct PlateReaderBuilder {
    detectors: Vec<Detector>,
    geometry: PlateGeometry,
    detector_options: DetectorOptions,
    extract_options: ExtractOptions,
    deskew_method: DeskewMethod,
    deskew_options: DeskewOptions,
    line_deskew_options: LineDeskewOptions,
    segment_options: SegmentOptions,
}

impl PlateReaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detectors to run, in order. An empty list falls back to all of them.
    pub fn detectors(mut self, detectors: impl IntoIterator<Item = Detector>) -> Self {
        self.detectors = detectors.into_iter().collect();
        self
    }

    pub fn geometry(mut self, geometry: PlateGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn detector_options(mut self, options: DetectorOptions) -> Self {
        self.detector_options = options;
        self
    }

    pub fn extract_options(mut self, options: ExtractOptions) -> Self {
        self.extract_options = options;
        self
    }

    pub fn deskew_method(mut self, method: DeskewMethod) -> Self {
        self.deskew_method = method;
        self
    }

    pub fn deskew_options(mut self, options: DeskewOptions) -> Self {
        self.deskew_options = options;
        self
    }

    pub fn line_deskew_options(mut self, options: LineDeskewOptions) -> Self {
        self.line_deskew_options = options;
        self
    }

    pub fn segment_options(mut self, options: SegmentOptions) -> Self {
        self.segment_options = options;
        self
    }

    pub fn build(self) -> PlateReader {
        self.build_with_zoom(Scale2x::new())
    }

    #[instrument(skip(self, zoom), level = "debug")]
    pub fn build_with_zoom<Z: Zoom>(mut self, zoom: Z) -> PlateReader<Z> {
        if self.detectors.is_empty() {
            self.detectors = Detector::ALL.to_vec();
        }
        log::debug!("Detectors: {:?}", self.detectors);
        PlateReader {
            detectors: self.detectors,
            validator: CandidateValidator::new(self.geometry),
            detector_options: self.detector_options,
            extract_options: self.extract_options,
            deskew_method: self.deskew_method,
            deskew_options: self.deskew_options,
            line_deskew_options: self.line_deskew_options,
            segment_options: self.segment_options,
            zoom,
        }
    }
}

impl Default for PlateReaderBuilder {
    fn default() -> Self {
        Self {
            detectors: Detector::ALL.to_vec(),
            geometry: PlateGeometry::default(),
            detector_options: DetectorOptions::default(),
            extract_options: ExtractOptions::default(),
            deskew_method: DeskewMethod::default(),
            deskew_options: DeskewOptions::default(),
            line_deskew_options: LineDeskewOptions::default(),
            segment_options: SegmentOptions::default(),
        }
    }
}

/// Runs detection, deskewing and segmentation for every configured detector.
/// Holds the zoom, whose colour cache carries over between images.
pub struct PlateReader<Z: Zoom = Scale2x> {
    detectors: Vec<Detector>,
    validator: CandidateValidator,
    detector_options: DetectorOptions,
    extract_options: ExtractOptions,
    deskew_method: DeskewMethod,
    deskew_options: DeskewOptions,
    line_deskew_options: LineDeskewOptions,
    segment_options: SegmentOptions,
    zoom: Z,
}

impl<Z: Zoom> PlateReader<Z> {
    pub fn zoom(&self) -> &Z {
        &self.zoom
    }

    pub fn detectors(&self) -> &[Detector] {
        &self.detectors
    }

    /// Every plate region found in `image`, each with its segmented
    /// characters. Detectors run independently, so the same plate may come
    /// back once per detector.
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub fn locate(&mut self, image: &DynamicImage) -> Result<Vec<(PlateRegion, Segmentation)>> {
        let mut plates = Vec::new();
        for &detector in &self.detectors {
            let candidates =
                detector.find_candidates(image, &self.detector_options, &self.validator)?;
            log::debug!("{detector:?}: {} candidates accepted", candidates.len());

            let regions = extract_regions(
                image,
                detector,
                &candidates,
                &mut self.zoom,
                &self.extract_options,
            );
            for region in regions {
                let straight = match self.deskew_method {
                    DeskewMethod::Text => deskew(&region.image, &self.deskew_options),
                    DeskewMethod::Lines => deskew_lines(&region.image, &self.line_deskew_options),
                };
                let segmentation = segment(&straight, &self.segment_options);
                #[cfg(feature = "debug")]
                self.save_debug(detector, plates.len(), &straight, &segmentation);
                plates.push((region, segmentation));
            }
        }
        Ok(plates)
    }

    /// Locates plates and reads them character by character. Regions that
    /// yield no characters are left out.
    #[instrument(skip(self, image, recognizer))]
    pub fn read(
        &mut self,
        image: &DynamicImage,
        recognizer: &impl Recognizer,
    ) -> Result<Vec<PlateReading>> {
        let mut readings = Vec::new();
        for (region, segmentation) in self.locate(image)? {
            if segmentation.characters.is_empty() {
                log::debug!("No characters in {:?} region", region.detector);
                continue;
            }
            let characters = segmentation
                .characters
                .iter()
                .map(|glyph| {
                    let mut glyph = glyph.clone();
                    imageops::invert(&mut glyph);
                    recognizer.recognize(&glyph)
                })
                .collect::<Result<Vec<_>>>()?;

            let text = characters.iter().map(|it| it.text.as_str()).collect::<String>();
            let confidence =
                characters.iter().map(|it| it.confidence).sum::<f32>() / characters.len() as f32;
            log::debug!("{:?} read {text:?} ({confidence:.3})", region.detector);
            readings.push(PlateReading {
                detector: region.detector,
                candidate: region.candidate,
                characters,
                text,
                confidence,
            });
        }
        Ok(readings)
    }

    #[cfg(feature = "debug")]
    fn save_debug(
        &self,
        detector: Detector,
        index: usize,
        straight: &GrayImage,
        segmentation: &Segmentation,
    ) {
        util::save_debug(straight, &format!("{detector:?}_{index}_deskewed"));
        util::save_debug(
            &segmentation.cleaned,
            &format!("{detector:?}_{index}_cleaned"),
        );
        for (i, character) in segmentation.characters.iter().enumerate() {
            util::save_debug(character, &format!("{detector:?}_{index}_char_{i}"));
        }
    }
}

/// The distinct non-empty plate strings among `readings`, sorted.
pub fn distinct_plates(readings: &[PlateReading]) -> Vec<String> {
    readings
        .iter()
        .map(|it| it.text.trim())
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
