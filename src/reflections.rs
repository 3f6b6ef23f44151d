//! Prototype reflections sorted by length, for fast range queries.
//!
//! The sinogram pairs every observed ULS with every prototype reflection whose
//! length could lie on that ULS. Reflections are enumerated once up to a
//! maximum norm and kept sorted by norm so each query is two binary searches.

use tracing::debug;

use crate::lattice::Lattice;
use crate::Vector3;

#[derive(Debug, Clone)]
pub struct ReflectionsInRangeFinder {
    /// Norms in ascending order.
    norms: Vec<f64>,
    /// Unit directions, same order as `norms`.
    directions: Vec<Vector3>,
    relative_tolerance: f64,
}

impl ReflectionsInRangeFinder {
    /// Enumerate all nonzero points of `reciprocal_lattice` with norm up to
    /// `max_norm`.
    ///
    /// `relative_tolerance` widens every query range by `(1 ∓ tolerance)`; use
    /// the pseudo-degeneracy spread of the lattice lengths, or 0.
    pub fn new(reciprocal_lattice: &Lattice, max_norm: f64, relative_tolerance: f64) -> Self {
        let mut reflections: Vec<(f64, Vector3)> = Vec::new();

        if let Some(inverse) = reciprocal_lattice.basis().try_inverse() {
            let reach = max_norm * (1.0 + relative_tolerance);
            let limits: [i64; 3] =
                std::array::from_fn(|i| (inverse.row(i).norm() * reach).ceil() as i64);

            for h in -limits[0]..=limits[0] {
                for k in -limits[1]..=limits[1] {
                    for l in -limits[2]..=limits[2] {
                        if (h, k, l) == (0, 0, 0) {
                            continue;
                        }
                        let q = reciprocal_lattice.basis()
                            * Vector3::new(h as f64, k as f64, l as f64);
                        let norm = q.norm();
                        if norm <= reach {
                            reflections.push((norm, q / norm));
                        }
                    }
                }
            }
        }

        reflections.sort_by(|a, b| a.0.total_cmp(&b.0));
        debug!(
            "Enumerated {} prototype reflections up to {:.4} 1/Å",
            reflections.len(),
            max_norm
        );

        let (norms, directions) = reflections.into_iter().unzip();
        Self {
            norms,
            directions,
            relative_tolerance,
        }
    }

    /// Unit directions of all reflections with norm in
    /// `[near·(1 − τ), far·(1 + τ)]`.
    pub fn reflections_in_range(&self, near: f64, far: f64) -> &[Vector3] {
        let low = near * (1.0 - self.relative_tolerance);
        let high = far * (1.0 + self.relative_tolerance);
        let start = self.norms.partition_point(|&norm| norm < low);
        let end = self.norms.partition_point(|&norm| norm <= high);
        if start >= end {
            return &[];
        }
        &self.directions[start..end]
    }

    pub fn len(&self) -> usize {
        self.norms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.norms.is_empty()
    }

    pub fn relative_tolerance(&self) -> f64 {
        self.relative_tolerance
    }
}
