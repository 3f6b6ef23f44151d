//! Forward model: which reflections of a lattice appear on the detector.
//!
//! With a pink beam every reciprocal-lattice point inside the thick Ewald
//! shell between the spheres of radius `1/λ_long` and `1/λ_short` diffracts.
//! The prediction enumerates Miller indices inside the resolution sphere and
//! keeps those that land on the detector and are consistent with the ULS of
//! their own detector position.

use nalgebra::Vector3 as NVector3;

use super::Backprojection;
use crate::experiment_settings::ExperimentSettings;
use crate::lattice::Lattice;
use crate::{Vector2, Vector3};

/// Predicted detector pattern of one lattice.
#[derive(Debug, Clone, Default)]
pub struct PredictedPattern {
    /// Detector positions in meters, relative to the beam center.
    pub positions: Vec<Vector2>,
    pub miller_indices: Vec<NVector3<i32>>,
    /// Unit reciprocal-space directions of the predicted reflections.
    pub projection_directions: Vec<Vector3>,
}

impl PredictedPattern {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SimpleDiffractionPatternPrediction {
    backprojection: Backprojection,
}

impl SimpleDiffractionPatternPrediction {
    pub fn new(settings: &ExperimentSettings) -> Self {
        Self {
            backprojection: Backprojection::new(settings),
        }
    }

    /// Reciprocal points of `lattice` (reciprocal basis, 1/Å) that diffract
    /// onto the detector.
    pub fn peaks_on_ewald_sphere(&self, lattice: &Lattice) -> Vec<Vector3> {
        self.visible_reflections(lattice)
            .into_iter()
            .map(|reflection| reflection.q)
            .collect()
    }

    /// Detector positions, Miller indices and directions of all reflections of
    /// `lattice` (reciprocal basis, 1/Å) that reach the detector.
    pub fn predict_pattern(&self, lattice: &Lattice) -> PredictedPattern {
        let mut pattern = PredictedPattern::default();
        for reflection in self.visible_reflections(lattice) {
            pattern.positions.push(reflection.position);
            pattern.miller_indices.push(reflection.hkl);
            pattern.projection_directions.push(reflection.q.normalize());
        }
        pattern
    }

    fn visible_reflections(&self, lattice: &Lattice) -> Vec<VisibleReflection> {
        let bp = &self.backprojection;
        let max_norm = bp.max_resolution_1_per_a();
        let Some(inverse) = lattice.basis().try_inverse() else {
            return Vec::new();
        };

        // |h_i| = |row_i(B⁻¹)·q| ≤ |row_i(B⁻¹)|·|q|
        let limits: [i32; 3] =
            std::array::from_fn(|i| (inverse.row(i).norm() * max_norm).ceil() as i32);

        let mut reflections = Vec::new();
        for h in -limits[0]..=limits[0] {
            for k in -limits[1]..=limits[1] {
                for l in -limits[2]..=limits[2] {
                    if (h, k, l) == (0, 0, 0) {
                        continue;
                    }
                    let q = lattice.basis() * Vector3::new(h as f64, k as f64, l as f64);
                    let norm = q.norm();
                    if norm > max_norm {
                        continue;
                    }
                    let Some(position) = bp.project(&q) else {
                        continue;
                    };
                    if position.norm() > bp.detector_radius_m() {
                        continue;
                    }
                    let uls = bp.back_project_position(&position);
                    if norm < uls.near || norm > uls.far {
                        continue;
                    }
                    reflections.push(VisibleReflection {
                        q,
                        hkl: NVector3::new(h, k, l),
                        position,
                    });
                }
            }
        }
        reflections
    }
}

struct VisibleReflection {
    q: Vector3,
    hkl: NVector3<i32>,
    position: Vector2,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment_settings::{BeamParameters, KnownLattice, ReflectionRadius};
    use crate::Matrix3;

    fn settings() -> ExperimentSettings {
        let beam = BeamParameters {
            beam_energy_ev: 10876.0,
            divergence_angle_deg: 0.05,
            non_monochromaticity: 0.25,
            reflection_radius: ReflectionRadius::Fixed(5e-4),
        };
        let reciprocal = Lattice::new(Matrix3::from_diagonal(&Vector3::new(0.125, 0.1, 1.0 / 12.0)));
        ExperimentSettings::new(
            0.25,
            0.11518,
            &beam,
            Some(KnownLattice {
                reciprocal_lattice: reciprocal,
                tolerance: 0.02,
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_predicted_peaks_are_consistent() {
        let settings = settings();
        let prediction = SimpleDiffractionPatternPrediction::new(&settings);
        let lattice = settings.reciprocal_lattice().unwrap().clone();
        let pattern = prediction.predict_pattern(&lattice);
        assert!(!pattern.is_empty());

        let bp = Backprojection::new(&settings);
        for i in 0..pattern.len() {
            let position = pattern.positions[i];
            assert!(position.norm() <= settings.detector_radius_m());

            let hkl = pattern.miller_indices[i].map(|x| x as f64);
            let q = lattice.basis() * hkl;
            let uls = bp.back_project_position(&position);
            assert!((uls.direction - q.normalize()).norm() < 1e-9);
            assert!((pattern.projection_directions[i] - q.normalize()).norm() < 1e-12);

            let lambda = bp.diffraction_wavelength_a(&q).unwrap();
            assert!(lambda > settings.lambda_short_a() * 0.99);
            assert!(lambda < settings.lambda_long_a() * 1.01);
        }
    }

    #[test]
    fn test_ewald_points_match_pattern() {
        let settings = settings();
        let prediction = SimpleDiffractionPatternPrediction::new(&settings);
        let lattice = settings.reciprocal_lattice().unwrap().clone();
        let points = prediction.peaks_on_ewald_sphere(&lattice);
        let pattern = prediction.predict_pattern(&lattice);
        assert_eq!(points.len(), pattern.len());
        for q in &points {
            assert!(q.norm() <= settings.max_resolution_1_per_a());
            assert!(q.z < 0.0);
        }
    }
}
