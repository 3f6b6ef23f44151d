//! Choose which peaks enter the sinogram.
//!
//! The sinogram cost grows linearly with the number of peaks, so patterns with
//! many peaks are cut down to a target count. Peaks are first dropped by
//! resolution (a few of the lowest-resolution ones, which carry little
//! orientation information, and more of the highest-resolution ones, whose
//! ULS are long and ambiguous), then by intensity.

use crate::projection::Uls;

/// Share of the excess removed by resolution; the rest goes by intensity.
const RESOLUTION_DROP_FRACTION: f64 = 0.3;
/// Share of the resolution drops taken from the low-resolution end.
const LOW_RESOLUTION_SHARE: f64 = 0.1;

/// Indices (ascending) of the peaks to keep.
///
/// Peaks whose ULS starts beyond `max_resolution_1_per_a` are always dropped.
pub fn reduce_peak_count(
    uls: &[Uls],
    intensities: &[f64],
    target_count: usize,
    max_resolution_1_per_a: f64,
) -> Vec<usize> {
    let mut kept: Vec<usize> = (0..uls.len())
        .filter(|&i| uls[i].near <= max_resolution_1_per_a)
        .collect();
    if kept.len() <= target_count {
        return kept;
    }

    let excess = kept.len() - target_count;
    let by_resolution = (excess as f64 * RESOLUTION_DROP_FRACTION) as usize;
    let low_resolution = (by_resolution as f64 * LOW_RESOLUTION_SHARE).round() as usize;
    let high_resolution = by_resolution - low_resolution;

    let resolution = |i: usize| 0.5 * (uls[i].near + uls[i].far);
    kept.sort_by(|&a, &b| resolution(a).total_cmp(&resolution(b)));
    kept.drain(..low_resolution);
    kept.truncate(kept.len() - high_resolution);

    // Brightest first; ties keep the lower index.
    let intensity = |i: usize| intensities.get(i).copied().unwrap_or(0.0);
    kept.sort_by(|&a, &b| intensity(b).total_cmp(&intensity(a)).then(a.cmp(&b)));
    kept.truncate(target_count);

    kept.sort_unstable();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vector3;

    fn uls_at(norm: f64) -> Uls {
        Uls {
            direction: Vector3::new(0.0, 0.0, -1.0),
            near: norm * 0.9,
            far: norm * 1.1,
        }
    }

    #[test]
    fn test_under_target_keeps_everything_in_range() {
        let uls = vec![uls_at(0.1), uls_at(0.5), uls_at(0.2)];
        let kept = reduce_peak_count(&uls, &[1.0, 1.0, 1.0], 10, 0.4);
        assert_eq!(kept, vec![0, 2]);
    }

    #[test]
    fn test_reduction_hits_target() {
        // 100 peaks, target 50: 15 by resolution (2 low, 13 high), 35 by intensity.
        let uls: Vec<Uls> = (0..100).map(|i| uls_at(0.01 * (i + 1) as f64)).collect();
        let intensities: Vec<f64> = (0..100).map(|i| ((i * 37) % 100) as f64).collect();
        let kept = reduce_peak_count(&uls, &intensities, 50, f64::INFINITY);

        assert_eq!(kept.len(), 50);
        assert!(kept.windows(2).all(|w| w[0] < w[1]));
        // Lowest-resolution two and highest-resolution thirteen are gone.
        assert!(!kept.contains(&0) && !kept.contains(&1));
        assert!(kept.iter().all(|&i| i < 87));

        // Every dropped mid-resolution peak is dimmer than every kept one.
        let dimmest_kept = kept.iter().map(|&i| intensities[i]).fold(f64::MAX, f64::min);
        for i in 2..87 {
            if !kept.contains(&i) {
                assert!(intensities[i] <= dimmest_kept);
            }
        }
    }
}
