//! Pattern indexing: from detector peaks to an oriented, refined lattice.
//!
//! [`PinkIndexer`] owns everything that depends only on the experiment and the
//! configuration (backprojection, prototype reflections, the sinogram grid),
//! so indexing a stream of patterns reuses the large allocations.

pub mod config;
pub mod peak_reduction;

pub use config::{AngleResolution, ConsideredPeaksCount, IndexerConfig, RefinementType};

use anyhow::{anyhow, ensure, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::{debug, info};

use crate::experiment_settings::ExperimentSettings;
use crate::lattice::Lattice;
use crate::peak::Peak;
use crate::progress::{ProgressSink, TracingProgress};
use crate::projection::{Backprojection, Uls};
use crate::reflections::ReflectionsInRangeFinder;
use crate::refinement::restarts::{perturb_basis, perturb_center, select_best, RestartScore};
use crate::refinement::{tolerance_schedule, Refinement};
use crate::sinogram::{ConcurrencyStrategy, Sinogram};
use crate::{Vector2, Vector3};

use self::peak_reduction::reduce_peak_count;

/// Result of indexing one pattern.
#[derive(Debug, Clone)]
pub struct IndexingResult {
    /// Indexed reciprocal basis (1/Å), reduced and ordered like the prototype.
    pub lattice: Lattice,
    /// Detector center correction in meters, subtracted from peak positions.
    pub center_shift_m: Vector2,
    /// Per input peak: explained by `lattice` within the refinement tolerance.
    pub fitted_peaks: Vec<bool>,
    pub fitted_peaks_count: usize,
}

impl IndexingResult {
    fn unindexed(prototype: &Lattice, peak_count: usize) -> Self {
        Self {
            lattice: prototype.clone(),
            center_shift_m: Vector2::zeros(),
            fitted_peaks: vec![false; peak_count],
            fitted_peaks_count: 0,
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.fitted_peaks_count > 0
    }

    /// Real-space basis (Å) of the indexed lattice.
    pub fn real_lattice(&self) -> Option<Lattice> {
        self.lattice.reciprocal_lattice()
    }
}

/// Longest ULS end among peaks that may enter the sinogram.
///
/// A peak is kept while `near = 2sinθ/λ_long − r` stays within the indexing
/// cutoff `M`, so its `far = 2sinθ/λ_short + r` reaches `(M + r)·band + r`.
fn finder_max_norm(settings: &ExperimentSettings, config: &IndexerConfig) -> f64 {
    let band = settings.lambda_long_a() / settings.lambda_short_a();
    let r = settings.reflection_radius_1_per_a();
    (settings.max_resolution_1_per_a() + r)
        .min((config.max_resolution_for_indexing_1_per_a + r) * band + r)
}

/// One multi-seed restart after refinement.
struct RestartOutcome {
    lattice: Lattice,
    center_shift: Vector2,
    score: RestartScore,
}

pub struct PinkIndexer {
    settings: ExperimentSettings,
    config: IndexerConfig,
    backprojection: Backprojection,
    /// Reduced reciprocal basis of the reference cell.
    prototype: Lattice,
    sinogram: Sinogram,
    refinement: Refinement,
    progress: Box<dyn ProgressSink + Send>,
}

impl PinkIndexer {
    /// Prepare an indexer. `settings` must carry a known lattice.
    pub fn new(settings: ExperimentSettings, config: IndexerConfig) -> Result<Self> {
        let prototype = settings.reciprocal_lattice()?.clone();
        ensure!(
            config.refinement_tolerance > 0.0 && config.refinement_tolerance < 1.0,
            "refinement tolerance must be in (0, 1), got {}",
            config.refinement_tolerance
        );

        let backprojection = Backprojection::new(&settings);

        let finder = ReflectionsInRangeFinder::new(
            &prototype,
            finder_max_norm(&settings, &config),
            settings.reciprocal_length_degeneracy_tolerance()?,
        );

        let mut sinogram = Sinogram::new(finder);
        sinogram.set_angle_resolution(config.angle_resolution.degrees())?;

        info!(
            "Indexer ready: {} prototype reflections, {:.1}° rotation grid, {:?}",
            sinogram.finder().len(),
            config.angle_resolution.degrees(),
            config.refinement_type
        );

        Ok(Self {
            refinement: Refinement::new(config.refinement_tolerance),
            settings,
            config,
            backprojection,
            prototype,
            sinogram,
            progress: Box::new(TracingProgress::default()),
        })
    }

    /// Replace the progress sink (default: [`TracingProgress`]).
    pub fn with_progress(mut self, progress: impl ProgressSink + Send + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    pub fn settings(&self) -> &ExperimentSettings {
        &self.settings
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Reduced reciprocal basis of the reference cell.
    pub fn prototype(&self) -> &Lattice {
        &self.prototype
    }

    pub fn backprojection(&self) -> &Backprojection {
        &self.backprojection
    }

    /// Index one pattern. Peak positions are meters relative to the beam center.
    ///
    /// Fewer than 2 usable peaks give an unindexed result, not an error.
    pub fn index_pattern(
        &mut self,
        peaks: &[Peak],
        concurrency: ConcurrencyStrategy,
    ) -> Result<IndexingResult> {
        if peaks.len() < 2 {
            debug!("Not indexing a pattern with {} peak(s)", peaks.len());
            return Ok(IndexingResult::unindexed(&self.prototype, peaks.len()));
        }

        // ── Peak selection ──
        let all_uls = self.backprojection.back_project(peaks, &Vector2::zeros());
        let intensities: Vec<f64> = peaks.iter().map(|p| p.intensity).collect();
        let selected = reduce_peak_count(
            &all_uls,
            &intensities,
            self.config.considered_peaks_count.peak_count(),
            self.config.max_resolution_for_indexing_1_per_a,
        );
        if selected.len() < 2 {
            debug!("Only {} peak(s) within the indexing resolution", selected.len());
            return Ok(IndexingResult::unindexed(&self.prototype, peaks.len()));
        }
        let selected_uls: Vec<Uls> = selected.iter().map(|&i| all_uls[i]).collect();
        let selected_peaks: Vec<Peak> = selected.iter().map(|&i| peaks[i]).collect();
        debug!("Using {} of {} peaks for the rotation search", selected.len(), peaks.len());

        // ── Rotation search ──
        self.sinogram
            .compute(&selected_uls, concurrency, self.progress.as_ref())?;
        let Some(rotation) = self.sinogram.best_rotation() else {
            debug!("Sinogram holds no votes");
            return Ok(IndexingResult::unindexed(&self.prototype, peaks.len()));
        };
        debug!(
            "Best rotation: {:.2}° about {:?}, {} votes",
            rotation.angle().to_degrees(),
            rotation.axis().map(|a| a.into_inner()),
            self.sinogram.max_votes()
        );
        let mut lattice = self.prototype.rotated(&rotation.to_rotation_matrix());

        // ── Refinement ──
        let mut center_shift = Vector2::zeros();
        self.refine(
            &mut lattice,
            &mut center_shift,
            &selected_uls,
            &selected_peaks,
            concurrency,
        )?;
        ensure!(
            !lattice.is_singular(),
            "refinement produced a singular lattice basis"
        );
        lattice.minimize();
        lattice.reorder(&self.prototype);

        // ── Scoring on all peaks ──
        let final_uls = self.backprojection.back_project(peaks, &center_shift);
        self.refinement.set_tolerance(self.config.refinement_tolerance);
        let fitted_peaks = self.refinement.fitted_peaks(lattice.basis(), &final_uls);
        let fitted_peaks_count = fitted_peaks.iter().filter(|&&f| f).count();

        info!(
            "Indexed {}/{} peaks, mean defect {:.4}",
            fitted_peaks_count,
            peaks.len(),
            self.refinement.mean_defect(lattice.basis(), &final_uls)
        );

        Ok(IndexingResult {
            lattice,
            center_shift_m: center_shift,
            fitted_peaks,
            fitted_peaks_count,
        })
    }

    /// Index peaks given as reciprocal vectors computed at the nominal
    /// wavelength. They are mapped onto the detector plane and indexed like
    /// detector peaks.
    pub fn index_reciprocal_peaks(
        &mut self,
        mean_reciprocal_peaks: &[Vector3],
        intensities: &[f64],
        concurrency: ConcurrencyStrategy,
    ) -> Result<IndexingResult> {
        ensure!(
            mean_reciprocal_peaks.len() == intensities.len(),
            "{} reciprocal peaks but {} intensities",
            mean_reciprocal_peaks.len(),
            intensities.len()
        );
        let peaks = self
            .backprojection
            .project_reciprocal_peaks(mean_reciprocal_peaks)
            .into_iter()
            .zip(intensities)
            .enumerate()
            .map(|(i, (position, &intensity))| {
                position
                    .map(|p| Peak::new(p.x, p.y, intensity))
                    .ok_or_else(|| anyhow!("reciprocal peak {i} does not reach the detector plane"))
            })
            .collect::<Result<Vec<_>>>()?;
        self.index_pattern(&peaks, concurrency)
    }

    fn refine(
        &mut self,
        lattice: &mut Lattice,
        center_shift: &mut Vector2,
        uls: &[Uls],
        peaks: &[Peak],
        concurrency: ConcurrencyStrategy,
    ) -> Result<()> {
        let schedule = tolerance_schedule(self.config.refinement_tolerance);
        let refinement_type = self.config.refinement_type;

        let fixed_stage = matches!(
            refinement_type,
            RefinementType::FixedLatticeParameters
                | RefinementType::FirstFixedThenVariableLatticeParameters
                | RefinementType::FirstFixedThenVariableLatticeParametersMultiSeed
                | RefinementType::FirstFixedThenVariableLatticeParametersCenterAdjustmentMultiSeed
        );
        let variable_stage = matches!(
            refinement_type,
            RefinementType::VariableLatticeParameters
                | RefinementType::FirstFixedThenVariableLatticeParameters
        );

        for &tolerance in &schedule {
            self.refinement.set_tolerance(tolerance);
            if fixed_stage {
                self.refinement.refine_fixed_lattice(lattice, uls);
            }
            if variable_stage {
                self.refinement.refine_variable_lattice(lattice, uls);
            }
        }

        if refinement_type.is_multi_seed() {
            let best = self.refine_multi_seed(lattice, uls, peaks, &schedule, concurrency)?;
            *lattice = best.lattice;
            *center_shift = best.center_shift;
        }
        Ok(())
    }

    /// Variable-lattice refinement from many perturbed starting points; the
    /// first restart starts unperturbed.
    fn refine_multi_seed(
        &self,
        start: &Lattice,
        uls: &[Uls],
        peaks: &[Peak],
        schedule: &[f64],
        concurrency: ConcurrencyStrategy,
    ) -> Result<RestartOutcome> {
        let restarts = self.config.restart_count();
        let adjust_center = self.config.refinement_type.adjusts_center();
        let max_angle = self.config.angle_resolution.degrees().to_radians();
        let max_stretch = self.settings.tolerance()?;
        let final_tolerance = self.config.refinement_tolerance;

        let run = |i: usize| -> RestartOutcome {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(i as u64));
            let (basis, mut center_shift) = if i == 0 {
                (*start.basis(), Vector2::zeros())
            } else {
                let basis = perturb_basis(start.basis(), &mut rng, max_angle, max_stretch);
                let center = if adjust_center {
                    perturb_center(&mut rng, self.config.max_center_shift_m)
                } else {
                    Vector2::zeros()
                };
                (basis, center)
            };

            let mut lattice = Lattice::new(basis);
            let mut refinement = Refinement::new(final_tolerance);
            for &tolerance in schedule {
                refinement.set_tolerance(tolerance);
                if adjust_center {
                    refinement.refine_variable_lattice_with_center(
                        &mut lattice,
                        &mut center_shift,
                        peaks,
                        &self.backprojection,
                    );
                } else {
                    refinement.refine_variable_lattice(&mut lattice, uls);
                }
            }

            refinement.set_tolerance(final_tolerance);
            let shifted_uls;
            let scored_uls = if adjust_center {
                shifted_uls = self.backprojection.back_project(peaks, &center_shift);
                &shifted_uls[..]
            } else {
                uls
            };
            let score = RestartScore {
                fitted_peaks: refinement.fitted_peaks_count(lattice.basis(), scored_uls),
                mean_defect: refinement.mean_defect(lattice.basis(), scored_uls),
            };
            self.progress.report("multi-seed refinement", (i + 1) as f64 / restarts as f64);
            RestartOutcome {
                lattice,
                center_shift,
                score,
            }
        };

        let mut outcomes: Vec<RestartOutcome> = match concurrency {
            ConcurrencyStrategy::Serial => (0..restarts).map(&run).collect(),
            _ => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(concurrency.thread_count())
                    .build()?;
                pool.install(|| (0..restarts).into_par_iter().map(&run).collect())
            }
        };

        let scores: Vec<RestartScore> = outcomes.iter().map(|o| o.score).collect();
        let best = select_best(&scores).ok_or_else(|| anyhow!("no refinement restarts ran"))?;
        debug!(
            "Multi-seed refinement: restart {} of {} wins with {} peaks, mean defect {:.4}",
            best,
            restarts,
            scores[best].fitted_peaks,
            scores[best].mean_defect
        );
        Ok(outcomes.swap_remove(best))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment_settings::{BeamParameters, KnownLattice, ReflectionRadius};
    use crate::Matrix3;

    fn indexer(config: IndexerConfig) -> PinkIndexer {
        indexer_with_radius(config, 5e-4)
    }

    fn indexer_with_radius(config: IndexerConfig, reflection_radius: f64) -> PinkIndexer {
        let beam = BeamParameters {
            beam_energy_ev: 10876.0,
            divergence_angle_deg: 0.05,
            non_monochromaticity: 0.25,
            reflection_radius: ReflectionRadius::Fixed(reflection_radius),
        };
        let reciprocal = Lattice::new(Matrix3::from_diagonal(&Vector3::new(0.125, 0.1, 1.0 / 12.0)));
        let settings = ExperimentSettings::new(
            0.25,
            0.11518,
            &beam,
            Some(KnownLattice {
                reciprocal_lattice: reciprocal,
                tolerance: 0.02,
            }),
        )
        .unwrap();
        PinkIndexer::new(settings, config).unwrap()
    }

    fn loose_config() -> IndexerConfig {
        IndexerConfig {
            angle_resolution: AngleResolution::ExtremelyLoose,
            considered_peaks_count: ConsideredPeaksCount::VeryFew,
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_known_lattice() {
        let beam = BeamParameters {
            reflection_radius: ReflectionRadius::Fixed(1e-3),
            ..Default::default()
        };
        let settings = ExperimentSettings::new(0.1, 0.05, &beam, None).unwrap();
        assert!(PinkIndexer::new(settings, IndexerConfig::default()).is_err());
    }

    #[test]
    fn test_too_few_peaks_is_not_an_error() {
        let mut indexer = indexer(loose_config());
        for peaks in [vec![], vec![Peak::new(0.01, 0.02, 5.0)]] {
            let result = indexer
                .index_pattern(&peaks, ConcurrencyStrategy::Serial)
                .unwrap();
            assert_eq!(result.fitted_peaks_count, 0);
            assert_eq!(result.fitted_peaks.len(), peaks.len());
            assert!(!result.is_indexed());
        }
    }

    #[test]
    fn test_peaks_beyond_indexing_resolution_are_skipped() {
        let mut config = loose_config();
        config.max_resolution_for_indexing_1_per_a = 0.01;
        let mut indexer = indexer(config);
        let peaks = [Peak::new(0.05, 0.0, 1.0), Peak::new(0.0, 0.05, 1.0)];
        let result = indexer
            .index_pattern(&peaks, ConcurrencyStrategy::Serial)
            .unwrap();
        assert_eq!(result.fitted_peaks_count, 0);
    }

    #[test]
    fn test_finder_covers_uls_at_indexing_cutoff() {
        let mut config = loose_config();
        config.max_resolution_for_indexing_1_per_a = 0.3;
        let indexer = indexer_with_radius(config, 0.01);
        let settings = indexer.settings();
        let r = settings.reflection_radius_1_per_a();

        // A peak whose near end sits exactly on the cutoff still enters the sinogram.
        let two_sin_theta = (0.3 + r) * settings.lambda_long_a();
        let near = two_sin_theta / settings.lambda_long_a() - r;
        let far = two_sin_theta / settings.lambda_short_a() + r;
        assert!((near - 0.3).abs() < 1e-12);
        assert!(far < settings.max_resolution_1_per_a());

        let tolerance = indexer.sinogram.finder().relative_tolerance();
        let exhaustive = ReflectionsInRangeFinder::new(indexer.prototype(), 2.0, tolerance);
        let expected = exhaustive.reflections_in_range(near, far).len();
        assert!(expected > 0);
        assert_eq!(
            indexer.sinogram.finder().reflections_in_range(near, far).len(),
            expected
        );
    }

    #[test]
    fn test_mismatched_intensities_are_rejected() {
        let mut indexer = indexer(loose_config());
        let q = [Vector3::new(0.1, 0.0, -0.01)];
        assert!(indexer
            .index_reciprocal_peaks(&q, &[], ConcurrencyStrategy::Serial)
            .is_err());
    }
}
