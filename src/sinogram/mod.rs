//! Rotation search by voting in a discretized rotation space.
//!
//! For an observed direction `q` and a prototype reflection direction `h`,
//! the rotations taking `h` onto `q` form a one-parameter family. Every
//! (observed ULS, compatible prototype reflection) pair votes once for every
//! voxel its family passes through, dilated by a 3×3×3 stencil. Each peak
//! contributes at most one vote per voxel, so the count in a voxel is the
//! number of peaks explained by that rotation. The rotation with most votes is
//! refined by a local center of mass.
//!
//! The family is parameterized with the bisector `m = (h + q)/|h + q|`:
//! `p(φ) = (c·cos(φ/2), cos(φ/2)·(h×m) + sin(φ/2)·m)` with `c = h·m`, which
//! satisfies `p·h·p* = q` for every φ.

pub mod grid;

use anyhow::{anyhow, Result};
use nalgebra::UnitQuaternion;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::debug;

use crate::progress::ProgressSink;
use crate::projection::Uls;
use crate::reflections::ReflectionsInRangeFinder;
use crate::Vector3;

use self::grid::{mrp, GridGeometry};

/// Rounds of center-of-mass refinement around the best voxel.
const CENTER_OF_MASS_ITERATIONS: usize = 5;
/// Half-width of the center-of-mass window (5×5×5).
const CENTER_OF_MASS_RADIUS: i64 = 2;
/// Fraction of window cells, by vote count, that enter the center of mass.
const CENTER_OF_MASS_TOP_FRACTION: f64 = 0.3;
/// `|h + q|` below which the bisector is undefined.
const ANTIPARALLEL_THRESHOLD: f64 = 1e-9;

// ── Concurrency ─────────────────────────────────────────────────────────────

/// How the vote accumulation is spread over threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyStrategy {
    Serial,
    /// Each peak's candidates are split over `threads` workers; the merge runs
    /// after all workers finished.
    ParallelPerPeak { threads: usize },
    /// Like `ParallelPerPeak`, but merging peak i−1 overlaps with computing peak i.
    DoubleBuffered { threads: usize },
}

impl ConcurrencyStrategy {
    /// Serial for one thread, per-peak parallelism below 32 threads, double
    /// buffering above, where the merge becomes the bottleneck.
    pub fn from_thread_count(threads: usize) -> Self {
        match threads {
            0 | 1 => Self::Serial,
            2..=31 => Self::ParallelPerPeak { threads },
            _ => Self::DoubleBuffered { threads },
        }
    }

    pub fn thread_count(&self) -> usize {
        match *self {
            Self::Serial => 1,
            Self::ParallelPerPeak { threads } | Self::DoubleBuffered { threads } => threads.max(1),
        }
    }
}

// ── Tables and buffers ──────────────────────────────────────────────────────

/// Read-only data needed to trace rotation families through the grid.
#[derive(Debug, Clone)]
struct SweepTables {
    geometry: GridGeometry,
    /// `(sin φ/2, cos φ/2)` for φ sampled uniformly in [−4π, 0).
    angle_samples: Vec<(f64, f64)>,
    stencil: [i64; 27],
}

impl SweepTables {
    fn new(geometry: GridGeometry) -> Self {
        let count = geometry.angles_count();
        let step = 4.0 * std::f64::consts::PI / count as f64;
        let angle_samples = (0..count)
            .map(|i| {
                let phi = -4.0 * std::f64::consts::PI + step * i as f64;
                (phi / 2.0).sin_cos()
            })
            .collect();
        Self {
            stencil: geometry.stencil(),
            geometry,
            angle_samples,
        }
    }

    /// Emit every voxel touched by the family of rotations taking `h` onto `q`.
    /// Voxels may be emitted more than once.
    fn sweep_pair(&self, q: &Vector3, h: &Vector3, emit: &mut impl FnMut(u32)) {
        let sum = h + q;
        let sum_norm = sum.norm();
        if sum_norm < ANTIPARALLEL_THRESHOLD {
            return;
        }
        let m = sum / sum_norm;
        let c = h.dot(&m);
        let h_cross_m = h.cross(&m);

        let mut previous = u32::MAX;
        for &(sin_half, cos_half) in &self.angle_samples {
            let w = c * cos_half;
            let v = h_cross_m * cos_half + m * sin_half;
            let center = self.geometry.linear_index(&mrp(w, &v));
            if center == previous {
                continue;
            }
            previous = center;
            for offset in self.stencil {
                emit((center as i64 + offset) as u32);
            }
        }
    }

    /// Voxels touched by all candidates paired with `q`, in candidate order.
    fn sweep_candidates(&self, q: &Vector3, candidates: &[Vector3]) -> Vec<u32> {
        let mut voxels = Vec::new();
        for h in candidates {
            self.sweep_pair(q, h, &mut |index| voxels.push(index));
        }
        voxels
    }
}

/// Vote tensor plus the per-peak deduplication state.
#[derive(Debug, Clone, Default)]
struct VoteBuffers {
    votes: Vec<u8>,
    scratch: Vec<u8>,
    touched: Vec<u32>,
}

impl VoteBuffers {
    fn allocate(&mut self, voxels: usize) {
        self.votes = vec![0; voxels];
        self.scratch = vec![0; voxels];
        self.touched.clear();
    }

    fn reset(&mut self) {
        self.votes.fill(0);
        self.scratch.fill(0);
        self.touched.clear();
    }

    #[inline]
    fn mark(&mut self, index: u32) {
        let cell = &mut self.scratch[index as usize];
        if *cell == 0 {
            *cell = 1;
            self.touched.push(index);
        }
    }

    /// Add one vote to every cell marked since the last commit.
    fn commit_peak(&mut self) {
        for &index in &self.touched {
            let index = index as usize;
            self.scratch[index] = 0;
            self.votes[index] = self.votes[index].saturating_add(1);
        }
        self.touched.clear();
    }

    fn merge_peak(&mut self, worker_voxels: &[Vec<u32>]) {
        for voxels in worker_voxels {
            for &index in voxels {
                self.mark(index);
            }
        }
        self.commit_peak();
    }
}

// ── Sinogram ────────────────────────────────────────────────────────────────

/// Rotation-space vote accumulator.
///
/// Unconfigured until [`set_angle_resolution`](Self::set_angle_resolution) is
/// called; every `compute_*` call starts from an empty tensor.
#[derive(Debug, Clone)]
pub struct Sinogram {
    finder: ReflectionsInRangeFinder,
    angle_resolution_deg: Option<f64>,
    tables: Option<SweepTables>,
    buffers: VoteBuffers,
}

impl Sinogram {
    pub fn new(finder: ReflectionsInRangeFinder) -> Self {
        Self {
            finder,
            angle_resolution_deg: None,
            tables: None,
            buffers: VoteBuffers::default(),
        }
    }

    /// Size the grid for rotation steps of `angle_resolution_deg` and allocate
    /// the vote tensor. A no-op if the resolution is unchanged.
    pub fn set_angle_resolution(&mut self, angle_resolution_deg: f64) -> Result<()> {
        if self.angle_resolution_deg == Some(angle_resolution_deg) {
            return Ok(());
        }
        let geometry = GridGeometry::new(angle_resolution_deg)?;
        debug!(
            "Sinogram: {}³ voxels ({} per unit radius), {} samples per family",
            geometry.side(),
            geometry.scale(),
            geometry.angles_count()
        );
        self.buffers.allocate(geometry.voxel_count());
        self.tables = Some(SweepTables::new(geometry));
        self.angle_resolution_deg = Some(angle_resolution_deg);
        Ok(())
    }

    pub fn angle_resolution_deg(&self) -> Option<f64> {
        self.angle_resolution_deg
    }

    pub fn finder(&self) -> &ReflectionsInRangeFinder {
        &self.finder
    }

    pub fn side_length(&self) -> Option<usize> {
        self.tables.as_ref().map(|t| t.geometry.side())
    }

    pub fn scale(&self) -> Option<usize> {
        self.tables.as_ref().map(|t| t.geometry.scale())
    }

    /// The full vote tensor, x fastest.
    pub fn votes(&self) -> &[u8] {
        &self.buffers.votes
    }

    pub fn votes_at(&self, [x, y, z]: [usize; 3]) -> Option<u8> {
        let tables = self.tables.as_ref()?;
        let side = tables.geometry.side();
        if x >= side || y >= side || z >= side {
            return None;
        }
        Some(self.buffers.votes[tables.geometry.index_of([x, y, z])])
    }

    pub fn max_votes(&self) -> u8 {
        self.buffers.votes.iter().copied().max().unwrap_or(0)
    }

    /// Accumulate votes with the given strategy.
    pub fn compute(
        &mut self,
        uls: &[Uls],
        strategy: ConcurrencyStrategy,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        match strategy {
            ConcurrencyStrategy::Serial => self.compute_sinogram(uls, progress),
            ConcurrencyStrategy::ParallelPerPeak { threads } => {
                self.compute_sinogram_parallel(uls, threads, progress)
            }
            ConcurrencyStrategy::DoubleBuffered { threads } => {
                self.compute_sinogram_parallel_double_buffered(uls, threads, progress)
            }
        }
    }

    /// Single-threaded accumulation.
    pub fn compute_sinogram(&mut self, uls: &[Uls], progress: &dyn ProgressSink) -> Result<()> {
        let tables = self.tables.as_ref().ok_or_else(unconfigured)?;
        let buffers = &mut self.buffers;
        buffers.reset();

        for (i, segment) in uls.iter().enumerate() {
            let candidates = self.finder.reflections_in_range(segment.near, segment.far);
            for h in candidates {
                tables.sweep_pair(&segment.direction, h, &mut |index| buffers.mark(index));
            }
            buffers.commit_peak();
            progress.report("sinogram", (i + 1) as f64 / uls.len() as f64);
        }
        Ok(())
    }

    /// Each peak's candidates are traced by `threads` workers into owned voxel
    /// lists, which are then merged on the calling thread.
    pub fn compute_sinogram_parallel(
        &mut self,
        uls: &[Uls],
        threads: usize,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let tables = self.tables.as_ref().ok_or_else(unconfigured)?;
        let pool = ThreadPoolBuilder::new().num_threads(threads.max(1)).build()?;
        let buffers = &mut self.buffers;
        let finder = &self.finder;
        buffers.reset();

        for (i, segment) in uls.iter().enumerate() {
            let candidates = finder.reflections_in_range(segment.near, segment.far);
            let worker_voxels =
                pool.install(|| trace_in_parallel(tables, &segment.direction, candidates, threads));
            buffers.merge_peak(&worker_voxels);
            progress.report("sinogram", (i + 1) as f64 / uls.len() as f64);
        }
        Ok(())
    }

    /// Like [`compute_sinogram_parallel`](Self::compute_sinogram_parallel),
    /// with the merge of peak i−1 running concurrently with the tracing of
    /// peak i.
    pub fn compute_sinogram_parallel_double_buffered(
        &mut self,
        uls: &[Uls],
        threads: usize,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let tables = self.tables.as_ref().ok_or_else(unconfigured)?;
        let pool = ThreadPoolBuilder::new().num_threads(threads.max(1)).build()?;
        let buffers = &mut self.buffers;
        let finder = &self.finder;
        buffers.reset();

        pool.install(|| {
            let mut pending: Vec<Vec<u32>> = Vec::new();
            for (i, segment) in uls.iter().enumerate() {
                let candidates = finder.reflections_in_range(segment.near, segment.far);
                let previous = std::mem::take(&mut pending);
                let ((), current) = rayon::join(
                    || buffers.merge_peak(&previous),
                    || trace_in_parallel(tables, &segment.direction, candidates, threads),
                );
                pending = current;
                progress.report("sinogram", (i + 1) as f64 / uls.len() as f64);
            }
            buffers.merge_peak(&pending);
        });
        Ok(())
    }

    /// Rotation with most votes, refined by a local center of mass.
    ///
    /// The returned rotation `R` satisfies `R·h ≈ q` for the matched pairs, so
    /// it is applied to the prototype basis as `R·B`. `None` if unconfigured or
    /// nothing was voted for.
    pub fn best_rotation(&self) -> Option<UnitQuaternion<f64>> {
        let tables = self.tables.as_ref()?;
        let geometry = &tables.geometry;
        let votes = &self.buffers.votes;

        let (best_index, best_votes) = votes
            .iter()
            .enumerate()
            .fold((0, 0u8), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        if best_votes == 0 {
            return None;
        }

        let side = geometry.side() as i64;
        let mut center = geometry.coordinates(best_index).map(|c| c as i64);
        let mut center_of_mass = Vector3::new(center[0] as f64, center[1] as f64, center[2] as f64);

        for _ in 0..CENTER_OF_MASS_ITERATIONS {
            let mut window: Vec<([i64; 3], u8)> = Vec::with_capacity(125);
            for dz in -CENTER_OF_MASS_RADIUS..=CENTER_OF_MASS_RADIUS {
                for dy in -CENTER_OF_MASS_RADIUS..=CENTER_OF_MASS_RADIUS {
                    for dx in -CENTER_OF_MASS_RADIUS..=CENTER_OF_MASS_RADIUS {
                        let cell = [center[0] + dx, center[1] + dy, center[2] + dz];
                        if cell.iter().any(|&c| c < 0 || c >= side) {
                            continue;
                        }
                        let index = geometry.index_of(cell.map(|c| c as usize));
                        window.push((cell, votes[index]));
                    }
                }
            }

            let mut counts: Vec<u8> = window.iter().map(|&(_, v)| v).collect();
            counts.sort_unstable_by(|a, b| b.cmp(a));
            let keep = ((counts.len() as f64 * CENTER_OF_MASS_TOP_FRACTION).ceil() as usize).max(1);
            let threshold = counts[keep - 1].max(1);

            let mut weighted = Vector3::zeros();
            let mut total = 0.0;
            for (cell, v) in window {
                if v >= threshold {
                    let weight = v as f64;
                    weighted += Vector3::new(cell[0] as f64, cell[1] as f64, cell[2] as f64) * weight;
                    total += weight;
                }
            }
            if total == 0.0 {
                break;
            }
            center_of_mass = weighted / total;

            let rounded = center_of_mass.map(|c| c.round() as i64);
            let rounded = [rounded.x, rounded.y, rounded.z];
            if rounded == center {
                break;
            }
            center = rounded;
        }

        debug!(
            "Sinogram: best voxel has {} votes, center of mass at {:.2?}",
            best_votes,
            center_of_mass.as_slice()
        );
        Some(geometry.rotation_at(&center_of_mass))
    }
}

fn unconfigured() -> anyhow::Error {
    anyhow!("sinogram angle resolution has not been set")
}

/// Split `candidates` into one contiguous chunk per worker and trace each.
fn trace_in_parallel(
    tables: &SweepTables,
    q: &Vector3,
    candidates: &[Vector3],
    threads: usize,
) -> Vec<Vec<u32>> {
    if candidates.is_empty() {
        return Vec::new();
    }
    let chunk = candidates.len().div_ceil(threads.max(1));
    candidates
        .par_chunks(chunk)
        .map(|chunk| tables.sweep_candidates(q, chunk))
        .collect()
}
