//! Local refinement of a lattice against observed ULS.
//!
//! The fit quality of a basis is measured per peak by its *defect*: among the
//! lattice points whose length is compatible with the peak's ULS, the one
//! closest to the ULS ray, measured as the largest fractional-coordinate
//! component of its perpendicular residual. A perfectly indexed peak has
//! defect 0; a peak with no compatible lattice point gets the sentinel 1.
//!
//! Refinement minimizes the trimmed mean of the per-peak defects by
//! finite-difference gradient descent with an adaptive step:
//! - uphill steps are rejected and shrink the step by 0.9,
//! - once the last 4 accepted values agree within 1%, the step shrinks by 0.2,
//! - the stage ends at the step floor, the iteration cap, or a zero gradient.

pub mod restarts;

use std::collections::VecDeque;

use nalgebra::Rotation3;
use tracing::debug;

use crate::lattice::Lattice;
use crate::peak::Peak;
use crate::projection::{Backprojection, Uls};
use crate::{Matrix3, Vector2, Vector3};

/// Defect of a peak that no lattice point can explain.
pub const UNPREDICTABLE_DEFECT: f64 = 1.0;

/// Share of the best peaks averaged by [`Refinement::mean_defect`].
const TRIMMED_MEAN_FRACTION: f64 = 0.9;

const MAX_ITERATIONS: usize = 200;
const CENTER_MAX_ITERATIONS: usize = 35;
/// The lattice-with-center stage refines the center every this many iterations.
const CENTER_REFINEMENT_PERIOD: usize = 6;

const UPHILL_SHRINK: f64 = 0.9;
const SETTLED_SHRINK: f64 = 0.2;
const SETTLE_WINDOW: usize = 4;
const SETTLED_RELATIVE_SPREAD: f64 = 0.01;

const ROTATION_DELTA_RAD: f64 = 1e-6;
const ROTATION_INITIAL_STEP_DEG: f64 = 0.2;
const ROTATION_MIN_STEP_DEG: f64 = 1e-5;

// Relative to the largest basis vector norm.
const BASIS_DELTA: f64 = 1e-6;
const BASIS_INITIAL_STEP: f64 = 0.005;
const BASIS_MIN_STEP: f64 = 1e-6;

// Relative to the detector radius.
const CENTER_DELTA: f64 = 1e-8;
const CENTER_INITIAL_STEP: f64 = 1e-4;
const CENTER_MIN_STEP: f64 = 1e-7;

/// Miller boxes larger than this only arise from degenerate bases.
const MAX_MILLER_BOX: i64 = 1_000_000;

/// Why a refinement stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    IterationCap,
    StepFloor,
    ZeroGradient,
    /// The starting point explains no peak at all.
    Unpredictable,
}

/// Record of one refinement stage.
#[derive(Debug, Clone)]
pub struct RefinementTrace {
    pub initial_mean_defect: f64,
    /// Mean defect after every accepted step.
    pub accepted_mean_defects: Vec<f64>,
    pub iterations: usize,
    pub stop_reason: StopReason,
}

impl RefinementTrace {
    fn new(initial_mean_defect: f64) -> Self {
        Self {
            initial_mean_defect,
            accepted_mean_defects: Vec::new(),
            iterations: 0,
            stop_reason: StopReason::IterationCap,
        }
    }

    pub fn final_mean_defect(&self) -> f64 {
        self.accepted_mean_defects
            .last()
            .copied()
            .unwrap_or(self.initial_mean_defect)
    }
}

/// Defect evaluation and lattice refinement at a given tolerance.
///
/// Peaks with a defect at or above the tolerance count as not fitted.
#[derive(Debug, Clone)]
pub struct Refinement {
    tolerance: f64,
}

impl Refinement {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn set_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    // ── Defects ─────────────────────────────────────────────────────────────

    /// Per-peak defects of `basis` (reciprocal basis in columns).
    pub fn defects(&self, basis: &Matrix3, uls: &[Uls]) -> Vec<f64> {
        let Some(inverse) = basis.try_inverse() else {
            return vec![UNPREDICTABLE_DEFECT; uls.len()];
        };
        uls.iter().map(|u| peak_defect(basis, &inverse, u)).collect()
    }

    /// Mean of the best 90% of the defects below tolerance.
    /// [`UNPREDICTABLE_DEFECT`] if no peak is below tolerance.
    pub fn mean_defect(&self, basis: &Matrix3, uls: &[Uls]) -> f64 {
        let mut fitted: Vec<f64> = self
            .defects(basis, uls)
            .into_iter()
            .filter(|&defect| self.is_fitted(defect))
            .collect();
        if fitted.is_empty() {
            return UNPREDICTABLE_DEFECT;
        }
        fitted.sort_by(f64::total_cmp);
        let count = ((fitted.len() as f64 * TRIMMED_MEAN_FRACTION).ceil() as usize).max(1);
        fitted[..count].iter().sum::<f64>() / count as f64
    }

    pub fn fitted_peaks(&self, basis: &Matrix3, uls: &[Uls]) -> Vec<bool> {
        self.defects(basis, uls)
            .into_iter()
            .map(|defect| self.is_fitted(defect))
            .collect()
    }

    pub fn fitted_peaks_count(&self, basis: &Matrix3, uls: &[Uls]) -> usize {
        self.defects(basis, uls)
            .into_iter()
            .filter(|&defect| self.is_fitted(defect))
            .count()
    }

    fn is_fitted(&self, defect: f64) -> bool {
        defect < self.tolerance
    }

    // ── Refinement stages ───────────────────────────────────────────────────

    /// Rotate the lattice as a rigid body to minimize the mean defect.
    pub fn refine_fixed_lattice(&self, lattice: &mut Lattice, uls: &[Uls]) -> RefinementTrace {
        let problem = FixedLatticeProblem {
            refinement: self,
            uls,
        };
        let mut basis = *lattice.basis();
        let trace = run_descent(
            &problem,
            &mut basis,
            ROTATION_INITIAL_STEP_DEG.to_radians(),
            ROTATION_MIN_STEP_DEG.to_radians(),
            MAX_ITERATIONS,
        );
        debug!(
            "Fixed-lattice refinement: {:.4} -> {:.4} after {} iterations ({:?})",
            trace.initial_mean_defect,
            trace.final_mean_defect(),
            trace.iterations,
            trace.stop_reason
        );
        *lattice = Lattice::new(basis);
        trace
    }

    /// Adjust all 9 basis components to minimize the mean defect.
    pub fn refine_variable_lattice(&self, lattice: &mut Lattice, uls: &[Uls]) -> RefinementTrace {
        let mut basis = *lattice.basis();
        let scale = largest_norm(&basis);
        let problem = VariableLatticeProblem {
            refinement: self,
            uls,
            delta: BASIS_DELTA * scale,
        };
        let trace = run_descent(
            &problem,
            &mut basis,
            BASIS_INITIAL_STEP * scale,
            BASIS_MIN_STEP * scale,
            MAX_ITERATIONS,
        );
        debug!(
            "Variable-lattice refinement: {:.4} -> {:.4} after {} iterations ({:?})",
            trace.initial_mean_defect,
            trace.final_mean_defect(),
            trace.iterations,
            trace.stop_reason
        );
        *lattice = Lattice::new(basis);
        trace
    }

    /// Variable-lattice refinement interleaved with a detector-center search
    /// every few iterations. ULS are recomputed whenever the center moves.
    pub fn refine_variable_lattice_with_center(
        &self,
        lattice: &mut Lattice,
        center_shift: &mut Vector2,
        peaks: &[Peak],
        backprojection: &Backprojection,
    ) -> RefinementTrace {
        let mut basis = *lattice.basis();
        let mut uls = backprojection.back_project(peaks, center_shift);
        let mut value = self.mean_defect(&basis, &uls);
        let mut trace = RefinementTrace::new(value);
        if value >= UNPREDICTABLE_DEFECT {
            trace.stop_reason = StopReason::Unpredictable;
            return trace;
        }

        let scale = largest_norm(&basis);
        let mut stepper = AdaptiveStep::new(BASIS_INITIAL_STEP * scale, BASIS_MIN_STEP * scale);
        for iteration in 0..MAX_ITERATIONS {
            if iteration > 0 && iteration % CENTER_REFINEMENT_PERIOD == 0 {
                let previous = *center_shift;
                self.refine_center(&basis, center_shift, peaks, backprojection);
                if *center_shift != previous {
                    uls = backprojection.back_project(peaks, center_shift);
                    value = self.mean_defect(&basis, &uls);
                }
            }

            let problem = VariableLatticeProblem {
                refinement: self,
                uls: &uls,
                delta: BASIS_DELTA * scale,
            };
            trace.iterations += 1;
            match stepper.iterate(&problem, &mut basis, &mut value) {
                Iteration::Accepted => trace.accepted_mean_defects.push(value),
                Iteration::Rejected => {}
                Iteration::Stopped(reason) => {
                    trace.stop_reason = reason;
                    break;
                }
            }
        }

        debug!(
            "Lattice+center refinement: {:.4} -> {:.4}, center shift ({:.2e}, {:.2e}) m",
            trace.initial_mean_defect,
            value,
            center_shift.x,
            center_shift.y
        );
        *lattice = Lattice::new(basis);
        trace
    }

    /// Move the detector center (meters) to minimize the mean defect of a
    /// fixed basis.
    pub fn refine_center(
        &self,
        basis: &Matrix3,
        center_shift: &mut Vector2,
        peaks: &[Peak],
        backprojection: &Backprojection,
    ) -> RefinementTrace {
        let radius = backprojection.detector_radius_m();
        let problem = CenterProblem {
            refinement: self,
            basis,
            peaks,
            backprojection,
            delta: CENTER_DELTA * radius,
        };
        let initial = problem.objective(center_shift);
        if initial >= UNPREDICTABLE_DEFECT {
            let mut trace = RefinementTrace::new(initial);
            trace.stop_reason = StopReason::Unpredictable;
            return trace;
        }
        run_descent(
            &problem,
            center_shift,
            CENTER_INITIAL_STEP * radius,
            CENTER_MIN_STEP * radius,
            CENTER_MAX_ITERATIONS,
        )
    }
}

/// Tolerances of a multi-stage refinement, loosest first, ending at `final_tolerance`.
pub fn tolerance_schedule(final_tolerance: f64) -> Vec<f64> {
    let mut schedule: Vec<f64> = [0.12, 0.08]
        .into_iter()
        .filter(|&t| t >= final_tolerance)
        .collect();
    schedule.push(final_tolerance);
    schedule
}

fn largest_norm(basis: &Matrix3) -> f64 {
    basis
        .column_iter()
        .map(|column| column.norm())
        .fold(0.0, f64::max)
}

/// Defect of a single ULS, see the module documentation.
fn peak_defect(basis: &Matrix3, inverse: &Matrix3, uls: &Uls) -> f64 {
    let near = inverse * (uls.direction * uls.near);
    let far = inverse * (uls.direction * uls.far);

    // Near end truncated toward zero, far end rounded away from zero.
    let mut low = [0i64; 3];
    let mut high = [0i64; 3];
    let mut box_size: i64 = 1;
    for i in 0..3 {
        let truncated = near[i].trunc() as i64;
        let expanded = (if far[i] >= 0.0 { far[i].ceil() } else { far[i].floor() }) as i64;
        low[i] = truncated.min(expanded);
        high[i] = truncated.max(expanded);
        box_size = box_size.saturating_mul(high[i] - low[i] + 1);
    }
    if box_size > MAX_MILLER_BOX {
        return UNPREDICTABLE_DEFECT;
    }

    let mut best = UNPREDICTABLE_DEFECT;
    for h in low[0]..=high[0] {
        for k in low[1]..=high[1] {
            for l in low[2]..=high[2] {
                if (h, k, l) == (0, 0, 0) {
                    continue;
                }
                let point = basis * Vector3::new(h as f64, k as f64, l as f64);
                let norm = point.norm();
                if norm < uls.near || norm > uls.far {
                    continue;
                }
                let on_ray = uls.direction * uls.direction.dot(&point);
                let defect = (inverse * (on_ray - point)).amax();
                best = best.min(defect);
            }
        }
    }
    best
}

// ── Adaptive gradient descent ───────────────────────────────────────────────

trait DescentProblem {
    type Params: Clone;
    type Direction;

    fn objective(&self, params: &Self::Params) -> f64;

    /// Unit-length downhill direction at `params`, `None` for a zero gradient.
    fn descent_direction(&self, params: &Self::Params, value: f64) -> Option<Self::Direction>;

    fn advance(&self, params: &Self::Params, direction: &Self::Direction, step: f64) -> Self::Params;
}

enum Iteration {
    Accepted,
    Rejected,
    Stopped(StopReason),
}

struct AdaptiveStep {
    step: f64,
    min_step: f64,
    recent: VecDeque<f64>,
}

impl AdaptiveStep {
    fn new(step: f64, min_step: f64) -> Self {
        Self {
            step,
            min_step,
            recent: VecDeque::with_capacity(SETTLE_WINDOW),
        }
    }

    fn iterate<P: DescentProblem>(
        &mut self,
        problem: &P,
        params: &mut P::Params,
        value: &mut f64,
    ) -> Iteration {
        if self.step < self.min_step {
            return Iteration::Stopped(StopReason::StepFloor);
        }
        let Some(direction) = problem.descent_direction(params, *value) else {
            return Iteration::Stopped(StopReason::ZeroGradient);
        };

        let candidate = problem.advance(params, &direction, self.step);
        let candidate_value = problem.objective(&candidate);
        if candidate_value > *value {
            self.step *= UPHILL_SHRINK;
            return Iteration::Rejected;
        }

        *params = candidate;
        *value = candidate_value;
        self.recent.push_back(candidate_value);
        if self.recent.len() > SETTLE_WINDOW {
            self.recent.pop_front();
        }
        if self.recent.len() == SETTLE_WINDOW && self.settled() {
            self.step *= SETTLED_SHRINK;
            self.recent.clear();
        }
        Iteration::Accepted
    }

    fn settled(&self) -> bool {
        let max = self.recent.iter().copied().fold(f64::MIN, f64::max);
        let min = self.recent.iter().copied().fold(f64::MAX, f64::min);
        max <= 0.0 || (max - min) / max < SETTLED_RELATIVE_SPREAD
    }
}

fn run_descent<P: DescentProblem>(
    problem: &P,
    params: &mut P::Params,
    initial_step: f64,
    min_step: f64,
    max_iterations: usize,
) -> RefinementTrace {
    let mut value = problem.objective(params);
    let mut trace = RefinementTrace::new(value);
    let mut stepper = AdaptiveStep::new(initial_step, min_step);
    for _ in 0..max_iterations {
        trace.iterations += 1;
        match stepper.iterate(problem, params, &mut value) {
            Iteration::Accepted => trace.accepted_mean_defects.push(value),
            Iteration::Rejected => {}
            Iteration::Stopped(reason) => {
                trace.stop_reason = reason;
                break;
            }
        }
    }
    trace
}

struct FixedLatticeProblem<'a> {
    refinement: &'a Refinement,
    uls: &'a [Uls],
}

impl DescentProblem for FixedLatticeProblem<'_> {
    type Params = Matrix3;
    /// Unit rotation axis; advancing rotates about it by `-step`.
    type Direction = Vector3;

    fn objective(&self, basis: &Matrix3) -> f64 {
        self.refinement.mean_defect(basis, self.uls)
    }

    fn descent_direction(&self, basis: &Matrix3, value: f64) -> Option<Vector3> {
        let mut gradient = Vector3::zeros();
        for axis in 0..3 {
            let rotation = Rotation3::new(Vector3::ith(axis, ROTATION_DELTA_RAD));
            gradient[axis] = (self.objective(&(rotation.matrix() * basis)) - value) / ROTATION_DELTA_RAD;
        }
        let norm = gradient.norm();
        (norm > 0.0).then(|| gradient / norm)
    }

    fn advance(&self, basis: &Matrix3, direction: &Vector3, step: f64) -> Matrix3 {
        Rotation3::new(-direction * step).matrix() * basis
    }
}

struct VariableLatticeProblem<'a> {
    refinement: &'a Refinement,
    uls: &'a [Uls],
    delta: f64,
}

impl DescentProblem for VariableLatticeProblem<'_> {
    type Params = Matrix3;
    type Direction = Matrix3;

    fn objective(&self, basis: &Matrix3) -> f64 {
        self.refinement.mean_defect(basis, self.uls)
    }

    fn descent_direction(&self, basis: &Matrix3, value: f64) -> Option<Matrix3> {
        let mut gradient = Matrix3::zeros();
        for row in 0..3 {
            for col in 0..3 {
                let mut shifted = *basis;
                shifted[(row, col)] += self.delta;
                gradient[(row, col)] = (self.objective(&shifted) - value) / self.delta;
            }
        }
        let norm = gradient.norm();
        (norm > 0.0).then(|| gradient / norm)
    }

    fn advance(&self, basis: &Matrix3, direction: &Matrix3, step: f64) -> Matrix3 {
        basis - direction * step
    }
}

struct CenterProblem<'a> {
    refinement: &'a Refinement,
    basis: &'a Matrix3,
    peaks: &'a [Peak],
    backprojection: &'a Backprojection,
    delta: f64,
}

impl DescentProblem for CenterProblem<'_> {
    type Params = Vector2;
    type Direction = Vector2;

    fn objective(&self, center_shift: &Vector2) -> f64 {
        let uls = self.backprojection.back_project(self.peaks, center_shift);
        self.refinement.mean_defect(self.basis, &uls)
    }

    fn descent_direction(&self, center_shift: &Vector2, value: f64) -> Option<Vector2> {
        let mut gradient = Vector2::zeros();
        for axis in 0..2 {
            let shifted = center_shift + Vector2::ith(axis, self.delta);
            gradient[axis] = (self.objective(&shifted) - value) / self.delta;
        }
        let norm = gradient.norm();
        (norm > 0.0).then(|| gradient / norm)
    }

    fn advance(&self, center_shift: &Vector2, direction: &Vector2, step: f64) -> Vector2 {
        center_shift - direction * step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment_settings::{BeamParameters, ExperimentSettings, ReflectionRadius};
    use crate::projection::prediction::SimpleDiffractionPatternPrediction;
    use nalgebra::Unit;

    fn cell() -> Matrix3 {
        Matrix3::from_diagonal(&Vector3::new(0.125, 0.1, 1.0 / 12.0))
    }

    fn settings() -> ExperimentSettings {
        let beam = BeamParameters {
            beam_energy_ev: 10876.0,
            divergence_angle_deg: 0.05,
            non_monochromaticity: 0.25,
            reflection_radius: ReflectionRadius::Fixed(5e-4),
        };
        ExperimentSettings::new(0.12, 0.11518, &beam, None).unwrap()
    }

    fn backprojection() -> Backprojection {
        Backprojection::new(&settings())
    }

    /// ULS through exact lattice points of `basis`.
    fn exact_uls(basis: &Matrix3) -> Vec<Uls> {
        [
            (1, 2, -3),
            (-2, 1, -1),
            (0, 3, -2),
            (2, -1, -4),
            (1, 1, -1),
            (-1, -2, -2),
            (3, 0, -1),
            (0, -1, -3),
        ]
        .iter()
        .map(|&(h, k, l)| {
            let q = basis * Vector3::new(h as f64, k as f64, l as f64);
            Uls {
                direction: q.normalize(),
                near: q.norm() * 0.85,
                far: q.norm() * 1.15,
            }
        })
        .collect()
    }

    fn predicted_peaks(basis: &Matrix3) -> Vec<Peak> {
        SimpleDiffractionPatternPrediction::new(&settings())
            .predict_pattern(&Lattice::new(*basis))
            .positions
            .iter()
            .map(|p| Peak::new(p.x, p.y, 1.0))
            .collect()
    }

    #[test]
    fn test_exact_lattice_has_zero_defect() {
        let refinement = Refinement::new(0.1);
        let uls = exact_uls(&cell());
        let defects = refinement.defects(&cell(), &uls);
        assert!(defects.iter().all(|&d| d < 1e-12), "{defects:?}");
        assert_eq!(refinement.fitted_peaks_count(&cell(), &uls), uls.len());
        assert!(refinement.mean_defect(&cell(), &uls) < 1e-12);
    }

    #[test]
    fn test_unreachable_peak_has_sentinel_defect() {
        let refinement = Refinement::new(0.1);
        let uls = [Uls {
            direction: Vector3::new(1.0, 0.0, 0.0),
            near: 0.01,
            far: 0.02,
        }];
        assert_eq!(refinement.defects(&cell(), &uls), vec![UNPREDICTABLE_DEFECT]);
        assert_eq!(refinement.mean_defect(&cell(), &uls), UNPREDICTABLE_DEFECT);
        assert_eq!(refinement.fitted_peaks(&cell(), &uls), vec![false]);
    }

    #[test]
    fn test_singular_basis_predicts_nothing() {
        let refinement = Refinement::new(0.1);
        let uls = exact_uls(&cell());
        let defects = refinement.defects(&Matrix3::zeros(), &uls);
        assert!(defects.iter().all(|&d| d == UNPREDICTABLE_DEFECT));
    }

    #[test]
    fn test_defect_grows_with_misorientation() {
        let refinement = Refinement::new(0.5);
        let uls = exact_uls(&cell());
        let small = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.5f64.to_radians());
        let large = Rotation3::from_axis_angle(&Vector3::x_axis(), 2.0f64.to_radians());
        let d_small = refinement.mean_defect(&(small.matrix() * cell()), &uls);
        let d_large = refinement.mean_defect(&(large.matrix() * cell()), &uls);
        assert!(0.0 < d_small && d_small < d_large);
    }

    #[test]
    fn test_fixed_lattice_refinement_is_monotone_and_improves() {
        let refinement = Refinement::new(0.15);
        let uls = exact_uls(&cell());
        let rotation = Rotation3::from_axis_angle(
            &Unit::new_normalize(Vector3::new(1.0, -1.0, 0.5)),
            0.8f64.to_radians(),
        );
        let mut lattice = Lattice::new(rotation.matrix() * cell());
        let trace = refinement.refine_fixed_lattice(&mut lattice, &uls);

        assert!(trace
            .accepted_mean_defects
            .windows(2)
            .all(|w| w[1] <= w[0]));
        assert!(trace.final_mean_defect() < trace.initial_mean_defect);
        assert!(trace.final_mean_defect() < 0.3 * trace.initial_mean_defect);
        // Rigid rotation keeps the cell.
        let norms = lattice.basis_vector_norms();
        assert!((norms - Vector3::new(0.125, 0.1, 1.0 / 12.0)).norm() < 1e-9);
    }

    #[test]
    fn test_variable_lattice_refinement_is_monotone_and_improves() {
        let refinement = Refinement::new(0.15);
        let uls = exact_uls(&cell());
        let stretched = cell() * Matrix3::from_diagonal(&Vector3::new(1.01, 0.99, 1.0));
        let mut lattice = Lattice::new(stretched);
        let trace = refinement.refine_variable_lattice(&mut lattice, &uls);

        assert!(trace
            .accepted_mean_defects
            .windows(2)
            .all(|w| w[1] <= w[0]));
        assert!(trace.final_mean_defect() < trace.initial_mean_defect);
        assert!(trace.iterations <= MAX_ITERATIONS);
    }

    #[test]
    fn test_center_refinement_moves_toward_true_center() {
        let bp = backprojection();
        let refinement = Refinement::new(0.15);
        let true_shift = Vector2::new(1e-4, -5e-5);
        let peaks: Vec<Peak> = predicted_peaks(&cell())
            .into_iter()
            .map(|p| Peak::new(p.x + true_shift.x, p.y + true_shift.y, p.intensity))
            .collect();

        let mut shift = Vector2::zeros();
        let before = refinement.mean_defect(&cell(), &bp.back_project(&peaks, &shift));
        let trace = refinement.refine_center(&cell(), &mut shift, &peaks, &bp);
        let after = refinement.mean_defect(&cell(), &bp.back_project(&peaks, &shift));

        assert!(peaks.len() > 10);
        assert!(trace.iterations <= CENTER_MAX_ITERATIONS);
        assert!(after <= before);
        assert!((shift - true_shift).norm() < true_shift.norm());
    }

    #[test]
    fn test_center_refinement_short_circuits_on_sentinel() {
        let bp = backprojection();
        let refinement = Refinement::new(0.15);
        let peaks = [Peak::new(1e-6, 0.0, 1.0)];
        let mut shift = Vector2::zeros();
        let trace = refinement.refine_center(&cell(), &mut shift, &peaks, &bp);
        assert_eq!(trace.stop_reason, StopReason::Unpredictable);
        assert_eq!(shift, Vector2::zeros());
    }

    #[test]
    fn test_tolerance_schedule() {
        assert_eq!(tolerance_schedule(0.06), vec![0.12, 0.08, 0.06]);
        assert_eq!(tolerance_schedule(0.1), vec![0.12, 0.1]);
        assert_eq!(tolerance_schedule(0.2), vec![0.2]);
    }

    #[test]
    fn test_trimmed_mean_drops_worst_tenth() {
        // 8 fitted peaks: ceil(7.2) = 8, so only a defect at or above tolerance is left out.
        let refinement = Refinement::new(0.5);
        let uls = exact_uls(&cell());
        let basis = Rotation3::from_axis_angle(&Vector3::y_axis(), 1.0f64.to_radians()).matrix() * cell();
        let mut defects = refinement.defects(&basis, &uls);
        defects.retain(|&d| d < 0.5);
        defects.sort_by(f64::total_cmp);
        let count = (defects.len() as f64 * 0.9).ceil() as usize;
        let expected = defects[..count].iter().sum::<f64>() / count as f64;
        assert!((refinement.mean_defect(&basis, &uls) - expected).abs() < 1e-15);
    }
}
