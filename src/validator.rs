use crate::{Candidate, Quad};

/// Physical proportions of the target plate and the tolerances around them.
#[derive(Debug, Clone, Copy)]
pub struct PlateGeometry {
    /// Long side over short side of the real plate.
    pub aspect_ratio: f32,
    pub error_min: f32,
    pub error_max: f32,
    pub min_area: f32,
    pub max_area: f32,
}

impl PlateGeometry {
    pub fn ratio_band(&self) -> (f32, f32) {
        let ratio = self.aspect_ratio;
        (
            ratio - ratio * self.error_min,
            ratio + ratio * self.error_max,
        )
    }
}

impl Default for PlateGeometry {
    fn default() -> Self {
        // Macedonian plates are 52x11 cm.
        let aspect_ratio = 52.0 / 11.0;
        Self {
            aspect_ratio,
            error_min: 0.17,
            error_max: 0.32,
            min_area: 15.0 * aspect_ratio * 15.0,
            max_area: 112.0 * aspect_ratio * 112.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateValidator {
    geometry: PlateGeometry,
}

impl CandidateValidator {
    pub fn new(geometry: PlateGeometry) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> &PlateGeometry {
        &self.geometry
    }

    pub fn validate(&self, quad: &Quad) -> bool {
        self.accepts(&Candidate::new(*quad))
    }

    pub fn accepts(&self, candidate: &Candidate) -> bool {
        let Candidate {
            width,
            height,
            area,
            aspect_ratio,
            ..
        } = *candidate;
        if width == 0.0 || height == 0.0 {
            log::debug!("Rejecting degenerate candidate {:?}", candidate.quad);
            return false;
        }

        let (min_ratio, max_ratio) = self.geometry.ratio_band();
        let passed = (self.geometry.min_area..=self.geometry.max_area).contains(&area)
            && (min_ratio..=max_ratio).contains(&aspect_ratio);
        log::debug!(
            "Candidate width: {width:.3}, height: {height:.3}, area: {area:.3}, ratio: {aspect_ratio:.3}, passed: {passed}"
        );
        passed
    }
}
