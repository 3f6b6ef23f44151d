//! Multi-seed refinement: random restarts and the rule that picks the winner.
//!
//! Local refinement can stall in a poor minimum. Restarting from slightly
//! perturbed starting points and keeping the best outcome makes the result
//! far less sensitive to the sinogram's discretization.

use nalgebra::{Rotation3, Unit};
use rand::rngs::StdRng;
use rand::Rng;

use crate::{Matrix3, Vector2, Vector3};

/// A candidate with more peaks may cost at most this much relative defect
/// increase per unit of relative peak gain.
const DEFECT_COST_PER_PEAK_GAIN: f64 = 2.0;

/// Peak-count ratio above which a candidate wins regardless of defect.
const DECISIVE_PEAK_RATIO: f64 = 1.2;

/// Outcome of one restart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartScore {
    pub fitted_peaks: usize,
    pub mean_defect: f64,
}

/// Whether `candidate` should replace `incumbent` as the best restart so far.
///
/// - Anything beats no incumbent; a zero-peak incumbent loses to any candidate
///   with peaks or with a lower defect.
/// - Over 20% more fitted peaks wins outright.
/// - More fitted peaks wins unless the defect grows by more than twice the
///   relative peak gain.
/// - Equal peak counts are decided by the lower defect.
/// - Fewer fitted peaks never wins.
pub fn prefers(candidate: &RestartScore, incumbent: Option<&RestartScore>) -> bool {
    let Some(incumbent) = incumbent else {
        return true;
    };
    if incumbent.fitted_peaks == 0 {
        return candidate.fitted_peaks > 0 || candidate.mean_defect < incumbent.mean_defect;
    }

    let peak_ratio = candidate.fitted_peaks as f64 / incumbent.fitted_peaks as f64;
    if peak_ratio > DECISIVE_PEAK_RATIO {
        return true;
    }
    match candidate.fitted_peaks.cmp(&incumbent.fitted_peaks) {
        std::cmp::Ordering::Greater => {
            // A perfect incumbent tolerates no defect growth at all.
            if incumbent.mean_defect <= 0.0 {
                return candidate.mean_defect <= incumbent.mean_defect;
            }
            let defect_growth = candidate.mean_defect / incumbent.mean_defect - 1.0;
            defect_growth <= (peak_ratio - 1.0) * DEFECT_COST_PER_PEAK_GAIN
        }
        std::cmp::Ordering::Equal => candidate.mean_defect < incumbent.mean_defect,
        std::cmp::Ordering::Less => false,
    }
}

/// Index of the winning restart, applying [`prefers`] in index order.
pub fn select_best(scores: &[RestartScore]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, score) in scores.iter().enumerate() {
        if prefers(score, best.map(|b| &scores[b])) {
            best = Some(i);
        }
    }
    best
}

/// Randomly rotate `basis` by up to `max_angle_rad` and scale each basis
/// vector by up to `±max_relative_stretch`.
pub fn perturb_basis(
    basis: &Matrix3,
    rng: &mut StdRng,
    max_angle_rad: f64,
    max_relative_stretch: f64,
) -> Matrix3 {
    let axis = loop {
        let v = Vector3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        let n = v.norm();
        if n > 1e-3 && n <= 1.0 {
            break Unit::new_unchecked(v / n);
        }
    };
    let angle = rng.gen_range(-max_angle_rad..=max_angle_rad);
    let rotation = Rotation3::from_axis_angle(&axis, angle);

    let mut perturbed = rotation.matrix() * basis;
    for mut column in perturbed.column_iter_mut() {
        column *= 1.0 + rng.gen_range(-max_relative_stretch..=max_relative_stretch);
    }
    perturbed
}

/// Uniform random detector-center shift in the square `±max_shift_m`.
pub fn perturb_center(rng: &mut StdRng, max_shift_m: f64) -> Vector2 {
    if max_shift_m <= 0.0 {
        return Vector2::zeros();
    }
    Vector2::new(
        rng.gen_range(-max_shift_m..=max_shift_m),
        rng.gen_range(-max_shift_m..=max_shift_m),
    )
}
