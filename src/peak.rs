//! Define a detector peak: one observed Bragg reflection on a flat detector.
//! Peaks are the output of the peak-finding step and the input of indexing.
//!

use crate::Vector2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Position along the detector x-axis, in meters.
    /// Origin is the point where the direct beam hits the detector.
    pub x: f64,
    /// Position along the detector y-axis, in meters.
    pub y: f64,
    /// Integrated intensity (arbitrary units, brighter = higher).
    /// Only used to decide which peaks to drop when there are too many.
    pub intensity: f64,
}

impl Peak {
    pub fn new(x: f64, y: f64, intensity: f64) -> Self {
        Self { x, y, intensity }
    }

    /// Detector position in meters.
    pub fn position(&self) -> Vector2 {
        Vector2::new(self.x, self.y)
    }
}
