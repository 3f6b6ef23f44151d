//! Detector ↔ reciprocal-space geometry.
//!
//! Conventions: the beam travels along +z, the detector is the plane `z = D`
//! and detector coordinates are meters relative to the beam center. A peak at
//! `p` defines the unit scattering direction `d = normalize(pₓ, p_y, D)`; its
//! reciprocal vector for wavelength λ is `(d − e_z)/λ`. Because λ is only known
//! to lie in a band, a peak maps to an *uncertain line segment* (ULS): a ray
//! direction together with a range of distances along the ray.

pub mod prediction;

use crate::experiment_settings::ExperimentSettings;
use crate::peak::Peak;
use crate::{Vector2, Vector3};

/// Uncertain line segment: the part of a reciprocal-space ray on which the
/// reciprocal vector of one peak must lie.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Uls {
    /// Unit direction in reciprocal space.
    pub direction: Vector3,
    /// Distance of the near end from the origin, in 1/Å.
    pub near: f64,
    /// Distance of the far end from the origin, in 1/Å.
    pub far: f64,
}

impl Uls {
    /// Point at the middle of the segment.
    pub fn center(&self) -> Vector3 {
        self.direction * (0.5 * (self.near + self.far))
    }
}

/// Maps detector positions to ULS and reciprocal points back onto the detector.
#[derive(Debug, Clone)]
pub struct Backprojection {
    detector_distance_m: f64,
    detector_radius_m: f64,
    lambda_a: f64,
    lambda_short_a: f64,
    lambda_long_a: f64,
    reflection_radius_1_per_a: f64,
    max_resolution_1_per_a: f64,
}

impl Backprojection {
    pub fn new(settings: &ExperimentSettings) -> Self {
        Self {
            detector_distance_m: settings.detector_distance_m(),
            detector_radius_m: settings.detector_radius_m(),
            lambda_a: settings.lambda_a(),
            lambda_short_a: settings.lambda_short_a(),
            lambda_long_a: settings.lambda_long_a(),
            reflection_radius_1_per_a: settings.reflection_radius_1_per_a(),
            max_resolution_1_per_a: settings.max_resolution_1_per_a(),
        }
    }

    pub fn detector_distance_m(&self) -> f64 {
        self.detector_distance_m
    }

    pub fn detector_radius_m(&self) -> f64 {
        self.detector_radius_m
    }

    pub fn max_resolution_1_per_a(&self) -> f64 {
        self.max_resolution_1_per_a
    }

    /// ULS of a single detector position (meters, relative to the beam center).
    pub fn back_project_position(&self, position: &Vector2) -> Uls {
        let scattered =
            Vector3::new(position.x, position.y, self.detector_distance_m).normalize();
        let difference = scattered - Vector3::z();
        // |d − e_z| = 2 sin θ
        let two_sin_theta = difference.norm();
        let direction = if two_sin_theta > 0.0 {
            difference / two_sin_theta
        } else {
            -Vector3::z()
        };

        let near = (two_sin_theta / self.lambda_long_a - self.reflection_radius_1_per_a).max(0.0);
        let far = two_sin_theta / self.lambda_short_a + self.reflection_radius_1_per_a;
        Uls {
            direction,
            near,
            far,
        }
    }

    /// ULS of every peak, with `center_shift` (meters) subtracted from the positions.
    pub fn back_project(&self, peaks: &[Peak], center_shift: &Vector2) -> Vec<Uls> {
        peaks
            .iter()
            .map(|peak| self.back_project_position(&(peak.position() - center_shift)))
            .collect()
    }

    /// Detector position at which the reciprocal point `q` diffracts.
    ///
    /// `q` selects its own wavelength `λ = −2q_z/|q|²`; points with `q_z ≥ 0`
    /// never satisfy the Bragg condition and yield `None`, as do rays that
    /// leave the detector plane (`k_z ≤ 0`). The result is not clipped to the
    /// detector radius.
    pub fn project(&self, q: &Vector3) -> Option<Vector2> {
        if q.z >= 0.0 {
            return None;
        }
        let inverse_lambda = -q.norm_squared() / (2.0 * q.z);
        let outgoing = q + Vector3::z() * inverse_lambda;
        if outgoing.z <= 0.0 {
            return None;
        }
        Some(Vector2::new(outgoing.x, outgoing.y) * (self.detector_distance_m / outgoing.z))
    }

    /// Wavelength (Å) at which `q` is in diffraction condition, if any.
    pub fn diffraction_wavelength_a(&self, q: &Vector3) -> Option<f64> {
        (q.z < 0.0).then(|| -2.0 * q.z / q.norm_squared())
    }

    /// Detector positions of reciprocal peaks computed at the nominal wavelength.
    ///
    /// A mean reciprocal peak `q` corresponds to the scattering direction
    /// `d = e_z + λq`. `None` for directions that do not reach the detector plane.
    pub fn project_reciprocal_peaks(&self, mean_reciprocal_peaks: &[Vector3]) -> Vec<Option<Vector2>> {
        mean_reciprocal_peaks
            .iter()
            .map(|q| {
                let scattered = Vector3::z() + q * self.lambda_a;
                (scattered.z > 0.0).then(|| {
                    Vector2::new(scattered.x, scattered.y) * (self.detector_distance_m / scattered.z)
                })
            })
            .collect()
    }
}
