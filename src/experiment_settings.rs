//! Experiment geometry and beam description, with everything derived from it.
//!
//! [`ExperimentSettings`] is built once per detector/beam/crystal setup and is
//! immutable afterwards. It holds the wavelength band of the pink beam, the
//! detector distance and radius, the resolution limit, the reflection radius,
//! and (when a reference cell is supplied) the tolerance bands on lattice
//! vector lengths and cell volume used by the indexer.

use anyhow::{anyhow, ensure, Result};
use tracing::debug;

use crate::lattice::Lattice;
use crate::Vector3;

/// Planck constant in eV·s.
pub const PLANCK_EV_S: f64 = 4.135667662e-15;
/// Speed of light in m/s.
pub const SPEED_OF_LIGHT_M_S: f64 = 299_792_458.0;

/// Sorted lengths whose ratio (shorter/longer) exceeds this are treated as one
/// pseudo-degenerate length.
const PSEUDO_DEGENERACY_RATIO: f64 = 0.96;

/// `Auto` reflection radius, as a fraction of the shortest reciprocal basis vector.
const AUTO_REFLECTION_RADIUS_FRACTION: f64 = 0.02;

// ── Parameter structs ───────────────────────────────────────────────────────

/// Radius of the reciprocal-space "blob" a reflection occupies.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ReflectionRadius {
    /// 2% of the shortest reciprocal basis vector. Requires a known lattice.
    #[default]
    Auto,
    /// Explicit radius in 1/Å.
    Fixed(f64),
}

/// Beam description.
#[derive(Debug, Clone)]
pub struct BeamParameters {
    /// Photon energy at the center of the spectrum, in eV.
    pub beam_energy_ev: f64,
    /// Full beam divergence in degrees.
    pub divergence_angle_deg: f64,
    /// Relative spectral width Δλ/λ.
    /// The band spans `λ·(1 ∓ non_monochromaticity/2)`.
    pub non_monochromaticity: f64,
    pub reflection_radius: ReflectionRadius,
}

impl Default for BeamParameters {
    fn default() -> Self {
        Self {
            beam_energy_ev: 8000.0,
            divergence_angle_deg: 0.01,
            non_monochromaticity: 0.01,
            reflection_radius: ReflectionRadius::Auto,
        }
    }
}

/// Raw detector geometry as found in detector description files.
#[derive(Debug, Clone)]
pub struct DetectorGeometry {
    /// Additional camera offset in meters.
    pub coffset_m: f64,
    /// Camera length in millimeters.
    pub clen_mm: f64,
    /// Pixel edge length in meters.
    pub pixel_length_m: f64,
    /// Distance from the beam center to the farthest usable pixel, in pixels.
    pub detector_radius_pixel: f64,
}

impl DetectorGeometry {
    pub fn detector_distance_m(&self) -> f64 {
        self.clen_mm * 1e-3 + self.coffset_m
    }

    pub fn detector_radius_m(&self) -> f64 {
        self.detector_radius_pixel * self.pixel_length_m
    }
}

/// Reference cell of the crystal and the tolerance on its parameters.
#[derive(Debug, Clone)]
pub struct KnownLattice {
    /// Reciprocal basis in 1/Å.
    pub reciprocal_lattice: Lattice,
    /// Relative tolerance on lattice vector lengths, e.g. 0.02 for ±2%.
    pub tolerance: f64,
}

// ── Derived settings ────────────────────────────────────────────────────────

/// Tolerance bands derived from a known lattice.
#[derive(Debug, Clone)]
struct LatticeBounds {
    tolerance: f64,
    reciprocal_lattice: Lattice,
    real_lattice: Lattice,

    real_lengths_a: Vector3,
    real_angles_deg: Vector3,
    reciprocal_lengths_1_per_a: Vector3,
    reciprocal_angles_deg: Vector3,

    min_real_lengths_a: Vector3,
    max_real_lengths_a: Vector3,
    min_reciprocal_lengths_1_per_a: Vector3,
    max_reciprocal_lengths_1_per_a: Vector3,

    min_real_determinant: f64,
    max_real_determinant: f64,
    min_reciprocal_determinant: f64,
    max_reciprocal_determinant: f64,

    different_real_lengths_a: Vec<f64>,
    different_reciprocal_lengths_1_per_a: Vec<f64>,
    reciprocal_length_degeneracy_tolerance: f64,
}

impl LatticeBounds {
    fn new(known: &KnownLattice) -> Result<Self> {
        ensure!(
            known.tolerance >= 0.0 && known.tolerance < 1.0,
            "lattice tolerance must be in [0, 1), got {}",
            known.tolerance
        );
        ensure!(
            !known.reciprocal_lattice.is_singular(),
            "reference reciprocal lattice is singular"
        );

        let reciprocal_lattice = known.reciprocal_lattice.minimized();
        let real_lattice = reciprocal_lattice
            .reciprocal_lattice()
            .ok_or_else(|| anyhow!("reference reciprocal lattice is singular"))?;

        let tolerance = known.tolerance;
        let real_lengths_a = real_lattice.basis_vector_norms();
        let reciprocal_lengths_1_per_a = reciprocal_lattice.basis_vector_norms();
        let real_det = real_lattice.det().abs();
        let reciprocal_det = reciprocal_lattice.det().abs();

        let (different_real_lengths_a, _) = collapse_similar_lengths(&real_lengths_a);
        let (different_reciprocal_lengths_1_per_a, reciprocal_length_degeneracy_tolerance) =
            collapse_similar_lengths(&reciprocal_lengths_1_per_a);

        Ok(Self {
            tolerance,
            real_angles_deg: real_lattice.basis_vector_angles_deg(),
            reciprocal_angles_deg: reciprocal_lattice.basis_vector_angles_deg(),
            min_real_lengths_a: real_lengths_a * (1.0 - tolerance),
            max_real_lengths_a: real_lengths_a * (1.0 + tolerance),
            min_reciprocal_lengths_1_per_a: reciprocal_lengths_1_per_a * (1.0 - tolerance),
            max_reciprocal_lengths_1_per_a: reciprocal_lengths_1_per_a * (1.0 + tolerance),
            min_real_determinant: real_det * (1.0 - tolerance).powi(3),
            max_real_determinant: real_det * (1.0 + tolerance).powi(3),
            min_reciprocal_determinant: reciprocal_det * (1.0 - tolerance).powi(3),
            max_reciprocal_determinant: reciprocal_det * (1.0 + tolerance).powi(3),
            real_lengths_a,
            reciprocal_lengths_1_per_a,
            different_real_lengths_a,
            different_reciprocal_lengths_1_per_a,
            reciprocal_length_degeneracy_tolerance,
            reciprocal_lattice,
            real_lattice,
        })
    }
}

/// Immutable description of one experiment.
#[derive(Debug, Clone)]
pub struct ExperimentSettings {
    beam_energy_ev: f64,
    lambda_a: f64,
    lambda_short_a: f64,
    lambda_long_a: f64,
    non_monochromaticity: f64,
    divergence_angle_deg: f64,

    detector_distance_m: f64,
    detector_radius_m: f64,
    max_resolution_angle_rad: f64,
    max_resolution_1_per_a: f64,

    reflection_radius_1_per_a: f64,
    lattice: Option<LatticeBounds>,
}

impl ExperimentSettings {
    /// Settings from an already-resolved detector distance and radius (meters).
    ///
    /// Fails on non-physical input, and for [`ReflectionRadius::Auto`] without
    /// a known lattice.
    pub fn new(
        detector_distance_m: f64,
        detector_radius_m: f64,
        beam: &BeamParameters,
        known_lattice: Option<KnownLattice>,
    ) -> Result<Self> {
        ensure!(
            beam.beam_energy_ev > 0.0,
            "beam energy must be positive, got {} eV",
            beam.beam_energy_ev
        );
        ensure!(
            detector_distance_m > 0.0 && detector_radius_m > 0.0,
            "detector distance and radius must be positive (got {} m, {} m)",
            detector_distance_m,
            detector_radius_m
        );
        ensure!(
            (0.0..2.0).contains(&beam.non_monochromaticity),
            "non-monochromaticity must be in [0, 2), got {}",
            beam.non_monochromaticity
        );

        let lambda_a = PLANCK_EV_S * SPEED_OF_LIGHT_M_S / beam.beam_energy_ev * 1e10;
        let lambda_short_a = lambda_a * (1.0 - beam.non_monochromaticity / 2.0);
        let lambda_long_a = lambda_a * (1.0 + beam.non_monochromaticity / 2.0);

        let max_resolution_angle_rad = (detector_radius_m / detector_distance_m).atan();
        let max_resolution_1_per_a = 2.0 * (max_resolution_angle_rad / 2.0).sin() / lambda_short_a;

        let lattice = known_lattice.as_ref().map(LatticeBounds::new).transpose()?;

        let reflection_radius_1_per_a = match beam.reflection_radius {
            ReflectionRadius::Fixed(radius) => {
                ensure!(radius >= 0.0, "reflection radius must be non-negative, got {radius}");
                radius
            }
            ReflectionRadius::Auto => {
                let bounds = lattice.as_ref().ok_or_else(|| {
                    anyhow!("automatic reflection radius requires a known lattice")
                })?;
                bounds.reciprocal_lengths_1_per_a.min() * AUTO_REFLECTION_RADIUS_FRACTION
            }
        };

        debug!(
            "Experiment: λ = {:.5} Å ({:.5}..{:.5}), D = {:.4} m, R = {:.4} m, max resolution {:.4} 1/Å",
            lambda_a, lambda_short_a, lambda_long_a, detector_distance_m, detector_radius_m, max_resolution_1_per_a
        );

        Ok(Self {
            beam_energy_ev: beam.beam_energy_ev,
            lambda_a,
            lambda_short_a,
            lambda_long_a,
            non_monochromaticity: beam.non_monochromaticity,
            divergence_angle_deg: beam.divergence_angle_deg,
            detector_distance_m,
            detector_radius_m,
            max_resolution_angle_rad,
            max_resolution_1_per_a,
            reflection_radius_1_per_a,
            lattice,
        })
    }

    /// Settings from raw detector geometry (camera length, offset and pixel size).
    pub fn from_detector_geometry(
        geometry: &DetectorGeometry,
        beam: &BeamParameters,
        known_lattice: Option<KnownLattice>,
    ) -> Result<Self> {
        Self::new(
            geometry.detector_distance_m(),
            geometry.detector_radius_m(),
            beam,
            known_lattice,
        )
    }

    // ── Beam and detector ───────────────────────────────────────────────────

    pub fn beam_energy_ev(&self) -> f64 {
        self.beam_energy_ev
    }

    /// Nominal wavelength in Å.
    pub fn lambda_a(&self) -> f64 {
        self.lambda_a
    }

    /// Short end of the wavelength band in Å.
    pub fn lambda_short_a(&self) -> f64 {
        self.lambda_short_a
    }

    /// Long end of the wavelength band in Å.
    pub fn lambda_long_a(&self) -> f64 {
        self.lambda_long_a
    }

    pub fn non_monochromaticity(&self) -> f64 {
        self.non_monochromaticity
    }

    pub fn divergence_angle_deg(&self) -> f64 {
        self.divergence_angle_deg
    }

    pub fn detector_distance_m(&self) -> f64 {
        self.detector_distance_m
    }

    pub fn detector_radius_m(&self) -> f64 {
        self.detector_radius_m
    }

    /// Largest scattering angle 2θ reaching the detector, in radians.
    pub fn max_resolution_angle_rad(&self) -> f64 {
        self.max_resolution_angle_rad
    }

    /// Largest reciprocal-vector norm that can reach the detector: `2 sin θmax / λ_short`.
    pub fn max_resolution_1_per_a(&self) -> f64 {
        self.max_resolution_1_per_a
    }

    pub fn reflection_radius_1_per_a(&self) -> f64 {
        self.reflection_radius_1_per_a
    }

    // ── Known lattice ───────────────────────────────────────────────────────

    pub fn has_known_lattice(&self) -> bool {
        self.lattice.is_some()
    }

    fn bounds(&self) -> Result<&LatticeBounds> {
        self.lattice
            .as_ref()
            .ok_or_else(|| anyhow!("no known lattice in experiment settings"))
    }

    pub fn tolerance(&self) -> Result<f64> {
        Ok(self.bounds()?.tolerance)
    }

    /// Reduced reciprocal basis of the reference cell.
    pub fn reciprocal_lattice(&self) -> Result<&Lattice> {
        Ok(&self.bounds()?.reciprocal_lattice)
    }

    pub fn real_lattice(&self) -> Result<&Lattice> {
        Ok(&self.bounds()?.real_lattice)
    }

    pub fn real_lattice_vector_lengths_a(&self) -> Result<Vector3> {
        Ok(self.bounds()?.real_lengths_a)
    }

    pub fn real_lattice_vector_angles_deg(&self) -> Result<Vector3> {
        Ok(self.bounds()?.real_angles_deg)
    }

    pub fn reciprocal_lattice_vector_lengths_1_per_a(&self) -> Result<Vector3> {
        Ok(self.bounds()?.reciprocal_lengths_1_per_a)
    }

    pub fn reciprocal_lattice_vector_angles_deg(&self) -> Result<Vector3> {
        Ok(self.bounds()?.reciprocal_angles_deg)
    }

    /// Shortest real lattice vector length allowed by the tolerance.
    pub fn min_real_lattice_vector_length_a(&self) -> Result<f64> {
        Ok(self.bounds()?.min_real_lengths_a.min())
    }

    /// Longest real lattice vector length allowed by the tolerance.
    pub fn max_real_lattice_vector_length_a(&self) -> Result<f64> {
        Ok(self.bounds()?.max_real_lengths_a.max())
    }

    pub fn min_reciprocal_lattice_vector_length_1_per_a(&self) -> Result<f64> {
        Ok(self.bounds()?.min_reciprocal_lengths_1_per_a.min())
    }

    pub fn max_reciprocal_lattice_vector_length_1_per_a(&self) -> Result<f64> {
        Ok(self.bounds()?.max_reciprocal_lengths_1_per_a.max())
    }

    pub fn min_real_lattice_determinant(&self) -> Result<f64> {
        Ok(self.bounds()?.min_real_determinant)
    }

    pub fn max_real_lattice_determinant(&self) -> Result<f64> {
        Ok(self.bounds()?.max_real_determinant)
    }

    pub fn min_reciprocal_lattice_determinant(&self) -> Result<f64> {
        Ok(self.bounds()?.min_reciprocal_determinant)
    }

    pub fn max_reciprocal_lattice_determinant(&self) -> Result<f64> {
        Ok(self.bounds()?.max_reciprocal_determinant)
    }

    /// Real lattice vector lengths with pseudo-degenerate lengths merged, ascending.
    pub fn different_real_lattice_vector_lengths_a(&self) -> Result<&[f64]> {
        Ok(&self.bounds()?.different_real_lengths_a)
    }

    /// Reciprocal lattice vector lengths with pseudo-degenerate lengths merged, ascending.
    pub fn different_reciprocal_lattice_vector_lengths_1_per_a(&self) -> Result<&[f64]> {
        Ok(&self.bounds()?.different_reciprocal_lengths_1_per_a)
    }

    /// Largest relative distance between a reciprocal length and the length
    /// that represents it after merging. 0 when nothing was merged.
    pub fn reciprocal_length_degeneracy_tolerance(&self) -> Result<f64> {
        Ok(self.bounds()?.reciprocal_length_degeneracy_tolerance)
    }
}

/// Merge lengths that are nearly equal.
///
/// Returns the ascending representatives (group means) and the largest
/// relative deviation of a member from its representative.
fn collapse_similar_lengths(lengths: &Vector3) -> (Vec<f64>, f64) {
    let mut sorted = [lengths.x, lengths.y, lengths.z];
    sorted.sort_by(f64::total_cmp);

    let mut groups: Vec<Vec<f64>> = Vec::with_capacity(3);
    for length in sorted {
        match groups.last_mut() {
            Some(group) if group[group.len() - 1] / length > PSEUDO_DEGENERACY_RATIO => {
                group.push(length)
            }
            _ => groups.push(vec![length]),
        }
    }

    let mut spread: f64 = 0.0;
    let representatives = groups
        .iter()
        .map(|group| {
            let mean = group.iter().sum::<f64>() / group.len() as f64;
            for length in group {
                spread = spread.max((length / mean - 1.0).abs());
            }
            mean
        })
        .collect();
    (representatives, spread)
}
