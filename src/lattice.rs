//! Crystal lattice basis: reduction, derived parameters and reciprocal space.
//!
//! A [`Lattice`] stores three basis vectors as the columns of a 3×3 matrix. The
//! same type is used for real-space (Å) and reciprocal-space (1/Å) bases.
//! [`Lattice::reciprocal_lattice`] converts between the two with the
//! crystallographic convention `B* = (B⁻¹)ᵀ`, i.e. `|a*| = 1/d` without a 2π
//! factor, consistent with an Ewald sphere of radius `1/λ`.

use nalgebra::Rotation3;

use crate::{Matrix3, Vector3};

/// Relative |det| below which a basis is treated as singular.
const SINGULAR_BASIS_THRESHOLD: f64 = 1e-12;

/// Relative margin a candidate must beat to count as "strictly shorter".
/// Keeps reduction from cycling between equal-length vectors.
const STRICT_DECREASE_MARGIN: f64 = 1e-12;

/// The 6 column permutations tried by [`Lattice::reorder`].
const PERMUTATIONS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

#[derive(Debug, Clone, PartialEq)]
pub struct Lattice {
    basis: Matrix3,
}

impl Lattice {
    /// Create a lattice from a basis whose columns are the basis vectors.
    pub fn new(basis: Matrix3) -> Self {
        Self { basis }
    }

    pub fn from_vectors(a: Vector3, b: Vector3, c: Vector3) -> Self {
        Self::new(Matrix3::from_columns(&[a, b, c]))
    }

    /// Build a basis from cell parameters in the standard setting:
    /// `a` along x, `b` in the xy plane, `c` completing a right-handed cell.
    ///
    /// Angles are in degrees: `alpha` = ∠(b,c), `beta` = ∠(a,c), `gamma` = ∠(a,b).
    pub fn from_parameters(
        a: f64,
        b: f64,
        c: f64,
        alpha_deg: f64,
        beta_deg: f64,
        gamma_deg: f64,
    ) -> Self {
        let (cos_alpha, cos_beta) = (alpha_deg.to_radians().cos(), beta_deg.to_radians().cos());
        let (sin_gamma, cos_gamma) = gamma_deg.to_radians().sin_cos();

        let cy = (cos_alpha - cos_beta * cos_gamma) / sin_gamma;
        let cz = (1.0 - cos_beta * cos_beta - cy * cy).max(0.0).sqrt();

        Self::from_vectors(
            Vector3::new(a, 0.0, 0.0),
            Vector3::new(b * cos_gamma, b * sin_gamma, 0.0),
            Vector3::new(c * cos_beta, c * cy, c * cz),
        )
    }

    pub fn basis(&self) -> &Matrix3 {
        &self.basis
    }

    pub fn det(&self) -> f64 {
        self.basis.determinant()
    }

    /// True if |det| is negligible relative to the product of the column norms.
    pub fn is_singular(&self) -> bool {
        let norms = self.basis_vector_norms();
        let scale = norms.x * norms.y * norms.z;
        !(self.det().abs() > SINGULAR_BASIS_THRESHOLD * scale)
    }

    /// Column norms `(|a|, |b|, |c|)`.
    pub fn basis_vector_norms(&self) -> Vector3 {
        Vector3::new(
            self.basis.column(0).norm(),
            self.basis.column(1).norm(),
            self.basis.column(2).norm(),
        )
    }

    /// Angles `(∠(b,c), ∠(a,c), ∠(a,b))` in degrees, each in `[0, 180]`.
    pub fn basis_vector_angles_deg(&self) -> Vector3 {
        let (a, b, c) = self.columns();
        Vector3::new(angle_deg(&b, &c), angle_deg(&a, &c), angle_deg(&a, &b))
    }

    /// Same as [`basis_vector_angles_deg`](Self::basis_vector_angles_deg) but
    /// folded into `[0, 90]`, i.e. independent of basis vector signs.
    pub fn basis_vector_angles_normalized_deg(&self) -> Vector3 {
        self.basis_vector_angles_deg().map(fold_angle_deg)
    }

    /// Reciprocal basis `(B⁻¹)ᵀ`. `None` for a singular basis.
    ///
    /// Real → reciprocal → real reproduces the original basis.
    pub fn reciprocal_lattice(&self) -> Option<Lattice> {
        self.basis
            .try_inverse()
            .map(|inverse| Lattice::new(inverse.transpose()))
    }

    /// The lattice rotated as a rigid body.
    pub fn rotated(&self, rotation: &Rotation3<f64>) -> Lattice {
        Lattice::new(rotation.matrix() * self.basis)
    }

    // ── Reduction ───────────────────────────────────────────────────────────

    /// Reduce the basis in place to a minimal-length representative of the
    /// same lattice, sorted ascending by norm.
    ///
    /// Greedy reduction: Lagrange–Gauss on the two shortest vectors, then the
    /// third vector is replaced by the shortest vector of its coset
    /// `c + ℤa + ℤb` as long as that is strictly shorter. Idempotent.
    ///
    /// # Panics
    /// On a singular basis.
    pub fn minimize(&mut self) -> &mut Self {
        assert!(
            !self.is_singular(),
            "cannot reduce a singular lattice basis (det = {})",
            self.det()
        );

        loop {
            self.sort_by_norm();
            let (mut a, mut b, c) = self.columns();
            reduce_two_dimensional(&mut a, &mut b);
            match shorter_coset_vector(&a, &b, &c) {
                Some(shorter) => self.basis = Matrix3::from_columns(&[a, b, shorter]),
                None => {
                    self.basis = Matrix3::from_columns(&[a, b, c]);
                    break;
                }
            }
        }
        self.sort_by_norm();
        self
    }

    /// Reduced copy, see [`minimize`](Self::minimize).
    pub fn minimized(&self) -> Lattice {
        let mut reduced = self.clone();
        reduced.minimize();
        reduced
    }

    // ── Reordering ──────────────────────────────────────────────────────────

    /// Permute and sign-flip the columns so the basis looks most like
    /// `prototype`. Describes the same lattice before and after.
    ///
    /// Each candidate `C` is related to the prototype by `T = C·P⁻¹`. The
    /// candidate whose `T` is closest to a proper rotation (smallest
    /// `‖TᵀT − I‖_F`, `det T > 0`) wins; ties go to the smaller rotation.
    pub fn reorder(&mut self, prototype: &Lattice) -> &mut Self {
        let Some(prototype_inverse) = prototype.basis.try_inverse() else {
            return self;
        };
        let identity = Matrix3::identity();

        let mut best: Option<(f64, f64, Matrix3)> = None;
        for candidate in self.signed_permutations() {
            let relation = candidate * prototype_inverse;
            if relation.determinant() <= 0.0 {
                continue;
            }
            let distortion = (relation.transpose() * relation - identity).norm();
            let rotation_size = (relation - identity).norm();

            let better = match &best {
                None => true,
                Some((best_distortion, best_rotation, _)) => {
                    distortion < best_distortion - 1e-9
                        || (distortion < best_distortion + 1e-9 && rotation_size < *best_rotation)
                }
            };
            if better {
                best = Some((distortion, rotation_size, candidate));
            }
        }

        if let Some((_, _, basis)) = best {
            self.basis = basis;
        }
        self
    }

    /// Permute and sign-flip the columns so that the cell parameters match
    /// `lengths` and `angles_deg` (order `(∠(b,c), ∠(a,c), ∠(a,b))`) as well as
    /// possible.
    ///
    /// The permutation is chosen on sign-independent quantities (lengths and
    /// folded angles, worst relative deviation); the signs are then chosen to
    /// match the raw angles.
    pub fn reorder_to_parameters(&mut self, lengths: &Vector3, angles_deg: &Vector3) -> &mut Self {
        let target_folded = angles_deg.map(fold_angle_deg);
        let (a, b, c) = self.columns();
        let columns = [a, b, c];

        let mut best_permutation = PERMUTATIONS[0];
        let mut best_deviation = f64::INFINITY;
        for permutation in PERMUTATIONS {
            let candidate = Lattice::from_vectors(
                columns[permutation[0]],
                columns[permutation[1]],
                columns[permutation[2]],
            );
            let norms = candidate.basis_vector_norms();
            let folded = candidate.basis_vector_angles_normalized_deg();

            let mut deviation: f64 = 0.0;
            for i in 0..3 {
                deviation = deviation.max(((norms[i] - lengths[i]) / lengths[i]).abs());
                // A 0° target would make the relative deviation meaningless.
                let angle_scale = target_folded[i].max(1.0);
                deviation = deviation.max(((folded[i] - target_folded[i]) / angle_scale).abs());
            }
            if deviation < best_deviation {
                best_deviation = deviation;
                best_permutation = permutation;
            }
        }

        let permuted = [
            columns[best_permutation[0]],
            columns[best_permutation[1]],
            columns[best_permutation[2]],
        ];
        let mut best_basis = Matrix3::from_columns(&permuted);
        let mut best_cost = f64::INFINITY;
        for signs in sign_combinations() {
            let candidate = Lattice::from_vectors(
                permuted[0] * signs[0],
                permuted[1] * signs[1],
                permuted[2] * signs[2],
            );
            let cost = (candidate.basis_vector_angles_deg() - angles_deg).abs().sum();
            if cost < best_cost {
                best_cost = cost;
                best_basis = candidate.basis;
            }
        }

        self.basis = best_basis;
        self
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn columns(&self) -> (Vector3, Vector3, Vector3) {
        (
            self.basis.column(0).into_owned(),
            self.basis.column(1).into_owned(),
            self.basis.column(2).into_owned(),
        )
    }

    fn sort_by_norm(&mut self) {
        let (a, b, c) = self.columns();
        let mut columns = [a, b, c];
        columns.sort_by(|x, y| x.norm_squared().total_cmp(&y.norm_squared()));
        self.basis = Matrix3::from_columns(&columns);
    }

    fn signed_permutations(&self) -> impl Iterator<Item = Matrix3> + '_ {
        let (a, b, c) = self.columns();
        let columns = [a, b, c];
        PERMUTATIONS.into_iter().flat_map(move |permutation| {
            sign_combinations().map(move |signs| {
                Matrix3::from_columns(&[
                    columns[permutation[0]] * signs[0],
                    columns[permutation[1]] * signs[1],
                    columns[permutation[2]] * signs[2],
                ])
            })
        })
    }
}

fn sign_combinations() -> impl Iterator<Item = [f64; 3]> {
    (0..8u8).map(|bits| {
        let sign = |bit: u8| if bits & (1 << bit) == 0 { 1.0 } else { -1.0 };
        [sign(0), sign(1), sign(2)]
    })
}

fn angle_deg(u: &Vector3, v: &Vector3) -> f64 {
    u.cross(v).norm().atan2(u.dot(v)).to_degrees()
}

fn fold_angle_deg(angle: f64) -> f64 {
    angle.min(180.0 - angle)
}

/// Lagrange–Gauss reduction of a 2-D basis. On return `|a| ≤ |b|` and no
/// integer multiple of `a` shortens `b`.
fn reduce_two_dimensional(a: &mut Vector3, b: &mut Vector3) {
    loop {
        if b.norm_squared() < a.norm_squared() {
            std::mem::swap(a, b);
        }
        let multiple = (a.dot(b) / a.norm_squared()).round();
        if multiple == 0.0 {
            break;
        }
        let reduced = *b - *a * multiple;
        if reduced.norm_squared() >= b.norm_squared() * (1.0 - STRICT_DECREASE_MARGIN) {
            break;
        }
        *b = reduced;
    }
}

/// Shortest vector of `c + λa + μb` (λ, μ integer) if it is strictly shorter
/// than `c`.
///
/// The real-valued minimizer follows from the Gram system
/// `[a·a a·b; a·b b·b]·[λ; μ] = −[a·c; b·c]`; the integer optimum of a reduced
/// 2-D basis lies within one step of its rounding.
fn shorter_coset_vector(a: &Vector3, b: &Vector3, c: &Vector3) -> Option<Vector3> {
    let (aa, bb, ab) = (a.norm_squared(), b.norm_squared(), a.dot(b));
    let (ac, bc) = (a.dot(c), b.dot(c));
    let gram_det = aa * bb - ab * ab;
    if gram_det <= 0.0 {
        return None;
    }
    let lambda = ((-ac * bb + bc * ab) / gram_det).round();
    let mu = ((-bc * aa + ac * ab) / gram_det).round();

    let threshold = c.norm_squared() * (1.0 - STRICT_DECREASE_MARGIN);
    let mut best: Option<(f64, Vector3)> = None;
    for i in -1..=1 {
        for j in -1..=1 {
            let candidate = c + a * (lambda + i as f64) + b * (mu + j as f64);
            let norm_squared = candidate.norm_squared();
            if norm_squared < threshold && best.map_or(true, |(n, _)| norm_squared < n) {
                best = Some((norm_squared, candidate));
            }
        }
    }
    best.map(|(_, v)| v)
}
