//! # pinkindexer
//!
//! Auto-indexing of diffraction patterns recorded with a **polychromatic
//! ("pink") beam**.
//!
//! Given detector peak positions and the unit cell of the crystal, `pinkindexer`
//! recovers the orientation of the crystal lattice (a 3×3 reciprocal basis),
//! optionally refines the lattice parameters and the detector center, and reports
//! which peaks are explained by the result.
//!
//! ## Example
//!
//! ```no_run
//! use nalgebra::Matrix3;
//! use pinkindexer::{
//!     BeamParameters, ConcurrencyStrategy, ExperimentSettings, IndexerConfig, KnownLattice,
//!     Lattice, Peak, PinkIndexer,
//! };
//!
//! // Prototype cell, given as a reciprocal basis in 1/Å
//! let reciprocal = Lattice::new(Matrix3::from_diagonal(&nalgebra::Vector3::new(0.1, 0.1, 0.05)));
//!
//! let beam = BeamParameters {
//!     beam_energy_ev: 10_876.0,
//!     non_monochromaticity: 0.25,
//!     ..Default::default()
//! };
//! let settings = ExperimentSettings::new(
//!     0.25,    // detector distance, m
//!     0.11518, // detector radius, m
//!     &beam,
//!     Some(KnownLattice { reciprocal_lattice: reciprocal, tolerance: 0.02 }),
//! )
//! .unwrap();
//!
//! let mut indexer = PinkIndexer::new(settings, IndexerConfig::default()).unwrap();
//!
//! // Peak positions in meters, relative to the beam center on the detector
//! let peaks = vec![
//!     Peak::new(0.012, -0.031, 120.0),
//!     Peak::new(-0.044, 0.007, 80.0),
//!     // ... more peaks ...
//! ];
//!
//! let result = indexer
//!     .index_pattern(&peaks, ConcurrencyStrategy::from_thread_count(8))
//!     .unwrap();
//! println!("{} of {} peaks indexed", result.fitted_peaks_count, peaks.len());
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Backprojection**: every detector peak becomes an *uncertain line
//!    segment* (ULS) in reciprocal space: a direction plus a near/far distance
//!    range that reflects the wavelength band of the beam.
//! 2. **Peak reduction**: the number of peaks is capped to bound the cost of
//!    the next step.
//! 3. **Sinogram**: every pairing of an observed direction with a prototype
//!    reflection of compatible length votes for the one-parameter family of
//!    rotations that maps one onto the other. The best-supported rotation wins.
//! 4. **Refinement**: gradient descent on a fractional-coordinate defect
//!    metric, first for the rotation only, then for the full basis (optionally
//!    with many random restarts and a detector-center search).
//! 5. **Reporting**: the lattice is reduced, reordered like the prototype, and
//!    scored against all input peaks.

pub mod experiment_settings;
pub mod indexer;
pub mod lattice;
mod peak;
pub mod progress;
pub mod projection;
pub mod reflections;
pub mod refinement;
pub mod sinogram;

pub use experiment_settings::{
    BeamParameters, DetectorGeometry, ExperimentSettings, KnownLattice, ReflectionRadius,
};
pub use indexer::{
    AngleResolution, ConsideredPeaksCount, IndexerConfig, IndexingResult, PinkIndexer,
    RefinementType,
};
pub use lattice::Lattice;
pub use peak::*;
pub use progress::{NoProgress, ProgressSink, TracingProgress};
pub use projection::prediction::{PredictedPattern, SimpleDiffractionPatternPrediction};
pub use projection::{Backprojection, Uls};
pub use reflections::ReflectionsInRangeFinder;
pub use refinement::{Refinement, RefinementTrace, StopReason};
pub use sinogram::{ConcurrencyStrategy, Sinogram};

// Commonly used types.
// Everything is 64-bit: the defect metric compares fractional coordinates of
// reflections far out in reciprocal space, where 32-bit rounding is visible.
pub type Vector2 = nalgebra::Vector2<f64>;
pub type Vector3 = nalgebra::Vector3<f64>;
pub type Matrix3 = nalgebra::Matrix3<f64>;
