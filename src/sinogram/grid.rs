//! Discretization of rotation space.
//!
//! Rotations are addressed by modified Rodrigues parameters (MRP)
//! `σ = v/(1 + w)` of the unit quaternion `(w, v)` with `w ≥ 0`. This maps
//! every rotation into the unit ball with `|σ| = tan(θ/4)`, so a cube of side
//! `2S + 1` covers all rotations up to 180°. A rotation step δ at the identity
//! moves σ by δ/4, hence `S = ⌈4/δ⌉` voxels per unit radius.
//!
//! An 8-voxel overscan on every face lets the 27-point voting stencil and the
//! 5×5×5 center-of-mass window run without bounds checks.

use anyhow::{ensure, Result};
use nalgebra::{Quaternion, UnitQuaternion};

use crate::Vector3;

/// Extra voxels on each side of the ±180° cube.
pub const OVERSCAN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    /// Voxels per unit MRP radius.
    scale: usize,
    /// Edge length of the cube, always odd.
    side: usize,
}

impl GridGeometry {
    pub fn new(angle_resolution_deg: f64) -> Result<Self> {
        ensure!(
            angle_resolution_deg > 0.0 && angle_resolution_deg.is_finite(),
            "angle resolution must be positive, got {angle_resolution_deg}°"
        );
        let scale = (4.0 / angle_resolution_deg.to_radians()).ceil() as usize;
        let side = 2 * scale + 1 + 2 * OVERSCAN;
        let voxels = (side as u64).pow(3);
        ensure!(
            voxels <= u32::MAX as u64,
            "sinogram of {side}³ voxels exceeds the addressable size; use a coarser angle resolution"
        );
        Ok(Self { scale, side })
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn voxel_count(&self) -> usize {
        self.side * self.side * self.side
    }

    fn center(&self) -> f64 {
        ((self.side - 1) / 2) as f64
    }

    /// Number of samples along a rotation family so that consecutive samples
    /// land at most ~1.4 voxels apart.
    pub fn angles_count(&self) -> usize {
        (2.0 * std::f64::consts::PI * self.scale as f64).ceil() as usize
    }

    /// Linear index of the voxel containing the MRP vector `sigma`.
    #[inline]
    pub fn linear_index(&self, sigma: &Vector3) -> u32 {
        let center = self.center();
        let scale = self.scale as f64;
        let x = (sigma.x * scale + center).round() as usize;
        let y = (sigma.y * scale + center).round() as usize;
        let z = (sigma.z * scale + center).round() as usize;
        (x + self.side * (y + self.side * z)) as u32
    }

    pub fn coordinates(&self, index: usize) -> [usize; 3] {
        let x = index % self.side;
        let y = (index / self.side) % self.side;
        let z = index / (self.side * self.side);
        [x, y, z]
    }

    pub fn index_of(&self, [x, y, z]: [usize; 3]) -> usize {
        x + self.side * (y + self.side * z)
    }

    /// Linear offsets of the 3×3×3 neighborhood.
    pub fn stencil(&self) -> [i64; 27] {
        let side = self.side as i64;
        let mut offsets = [0i64; 27];
        let mut n = 0;
        for dz in -1..=1 {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    offsets[n] = dx + side * (dy + side * dz);
                    n += 1;
                }
            }
        }
        offsets
    }

    /// Rotation at fractional voxel coordinates (inverse MRP).
    pub fn rotation_at(&self, coordinates: &Vector3) -> UnitQuaternion<f64> {
        let sigma = (coordinates - Vector3::repeat(self.center())) / self.scale as f64;
        let sigma_sq = sigma.norm_squared();
        let w = (1.0 - sigma_sq) / (1.0 + sigma_sq);
        let v = sigma * (2.0 / (1.0 + sigma_sq));
        UnitQuaternion::from_quaternion(Quaternion::new(w, v.x, v.y, v.z))
    }
}

/// MRP vector of a quaternion, taking the representative with `w ≥ 0`.
pub fn mrp(w: f64, v: &Vector3) -> Vector3 {
    if w < 0.0 {
        -v / (1.0 - w)
    } else {
        v / (1.0 + w)
    }
}
