//! Indexer configuration.

use anyhow::{bail, Error};

/// How many peaks enter the sinogram. More peaks give a sharper maximum at a
/// proportionally higher cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsideredPeaksCount {
    VeryFew,
    Few,
    #[default]
    Standard,
    Many,
    ManyMany,
}

impl ConsideredPeaksCount {
    pub fn peak_count(&self) -> usize {
        match self {
            Self::VeryFew => 30,
            Self::Few => 70,
            Self::Standard => 127,
            Self::Many => 190,
            Self::ManyMany => 255,
        }
    }
}

impl TryFrom<i32> for ConsideredPeaksCount {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::VeryFew,
            1 => Self::Few,
            2 => Self::Standard,
            3 => Self::Many,
            4 => Self::ManyMany,
            _ => bail!("unknown considered-peaks-count code {code}"),
        })
    }
}

/// Rotation step of the sinogram grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AngleResolution {
    ExtremelyLoose,
    Loose,
    #[default]
    Standard,
    Dense,
    ExtremelyDense,
}

impl AngleResolution {
    pub fn degrees(&self) -> f64 {
        match self {
            Self::ExtremelyLoose => 1.5,
            Self::Loose => 1.1,
            Self::Standard => 0.8,
            Self::Dense => 0.5,
            Self::ExtremelyDense => 0.3,
        }
    }
}

impl TryFrom<i32> for AngleResolution {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::ExtremelyLoose,
            1 => Self::Loose,
            2 => Self::Standard,
            3 => Self::Dense,
            4 => Self::ExtremelyDense,
            _ => bail!("unknown angle-resolution code {code}"),
        })
    }
}

/// What is refined after the sinogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefinementType {
    None,
    FixedLatticeParameters,
    VariableLatticeParameters,
    #[default]
    FirstFixedThenVariableLatticeParameters,
    FirstFixedThenVariableLatticeParametersMultiSeed,
    FirstFixedThenVariableLatticeParametersCenterAdjustmentMultiSeed,
}

impl RefinementType {
    pub fn is_multi_seed(&self) -> bool {
        matches!(
            self,
            Self::FirstFixedThenVariableLatticeParametersMultiSeed
                | Self::FirstFixedThenVariableLatticeParametersCenterAdjustmentMultiSeed
        )
    }

    pub fn adjusts_center(&self) -> bool {
        matches!(
            self,
            Self::FirstFixedThenVariableLatticeParametersCenterAdjustmentMultiSeed
        )
    }

    /// Number of restarts the multi-seed variants run by default.
    pub fn default_restart_count(&self) -> usize {
        match self {
            Self::FirstFixedThenVariableLatticeParametersMultiSeed => 1000,
            Self::FirstFixedThenVariableLatticeParametersCenterAdjustmentMultiSeed => 2000,
            _ => 1,
        }
    }
}

impl TryFrom<i32> for RefinementType {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::None,
            1 => Self::FixedLatticeParameters,
            2 => Self::VariableLatticeParameters,
            3 => Self::FirstFixedThenVariableLatticeParameters,
            4 => Self::FirstFixedThenVariableLatticeParametersMultiSeed,
            5 => Self::FirstFixedThenVariableLatticeParametersCenterAdjustmentMultiSeed,
            _ => bail!("unknown refinement-type code {code}"),
        })
    }
}

/// Configuration for [`PinkIndexer`](super::PinkIndexer).
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub considered_peaks_count: ConsideredPeaksCount,
    pub angle_resolution: AngleResolution,
    pub refinement_type: RefinementType,
    /// Peaks whose ULS starts beyond this reciprocal distance (1/Å) are ignored
    /// for the rotation search. Default: no limit beyond the detector's.
    pub max_resolution_for_indexing_1_per_a: f64,
    /// Defect below which a peak counts as indexed.
    pub refinement_tolerance: f64,
    /// Half-width (meters) of the square in which the center-adjusting
    /// refinement draws random starting centers.
    pub max_center_shift_m: f64,
    /// Overrides the restart count of the multi-seed refinements.
    pub multi_seed_restarts: Option<usize>,
    /// Base seed of the restart RNGs; restart `i` uses `seed + i`.
    pub seed: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            considered_peaks_count: ConsideredPeaksCount::default(),
            angle_resolution: AngleResolution::default(),
            refinement_type: RefinementType::default(),
            max_resolution_for_indexing_1_per_a: f64::INFINITY,
            refinement_tolerance: 0.06,
            max_center_shift_m: 1e-4,
            multi_seed_restarts: None,
            seed: 0,
        }
    }
}

impl IndexerConfig {
    pub fn restart_count(&self) -> usize {
        if !self.refinement_type.is_multi_seed() {
            return 1;
        }
        self.multi_seed_restarts
            .unwrap_or_else(|| self.refinement_type.default_restart_count())
            .max(1)
    }
}
