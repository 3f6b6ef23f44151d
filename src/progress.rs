//! Progress reporting for long-running stages.
//!
//! The sinogram accumulation and the multi-seed refinement can take seconds to
//! minutes on large cells. Instead of printing, the indexer reports progress to
//! an injected [`ProgressSink`]. [`TracingProgress`] forwards to `tracing`;
//! [`NoProgress`] discards everything. Any `Fn(&str, f64) + Sync` closure is a
//! sink as well, which is handy in tests.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

/// Receiver of progress updates.
///
/// `fraction_done` is in `[0, 1]`. Implementations must be cheap: the sinogram
/// reports once per observed peak.
pub trait ProgressSink: Sync {
    fn report(&self, stage: &str, fraction_done: f64);
}

/// Logs `"<stage>: computed X%"` at debug level, once per 10% step reached.
///
/// A report below the last logged step starts a new run.
#[derive(Debug)]
pub struct TracingProgress {
    last_step: AtomicU32,
}

const NOTHING_LOGGED: u32 = u32::MAX;

impl Default for TracingProgress {
    fn default() -> Self {
        Self {
            last_step: AtomicU32::new(NOTHING_LOGGED),
        }
    }
}

impl TracingProgress {
    /// The 10% step to log for `fraction_done`, if it was not logged yet.
    fn next_step(&self, fraction_done: f64) -> Option<u32> {
        let step = (fraction_done.clamp(0.0, 1.0) * 10.0 + 1e-9).floor() as u32;
        let previous = self.last_step.swap(step, Ordering::Relaxed);
        (previous != step).then_some(step)
    }
}

impl ProgressSink for TracingProgress {
    fn report(&self, stage: &str, fraction_done: f64) {
        if let Some(step) = self.next_step(fraction_done) {
            debug!("{}: computed {}%", stage, step * 10);
        }
    }
}

/// Silent sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _stage: &str, _fraction_done: f64) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&str, f64) + Sync,
{
    fn report(&self, stage: &str, fraction_done: f64) {
        self(stage, fraction_done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_closure_is_a_sink() {
        let calls = AtomicUsize::new(0);
        let sink = |_stage: &str, fraction: f64| {
            assert!((0.0..=1.0).contains(&fraction));
            calls.fetch_add(1, Ordering::Relaxed);
        };
        let dyn_sink: &dyn ProgressSink = &sink;
        dyn_sink.report("sinogram", 0.5);
        dyn_sink.report("sinogram", 1.0);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_each_step_is_logged_once() {
        for count in [3, 7, 13, 30, 101] {
            let progress = TracingProgress::default();
            let logged: Vec<u32> = (1..=count)
                .filter_map(|i| progress.next_step(i as f64 / count as f64))
                .collect();
            assert!(logged.windows(2).all(|w| w[0] < w[1]), "{count} reports: {logged:?}");
            assert_eq!(logged.last(), Some(&10));
            if count >= 10 {
                let reached: Vec<u32> = logged.iter().copied().filter(|&s| s > 0).collect();
                assert_eq!(reached, (1..=10).collect::<Vec<_>>(), "{count} reports");
            }
        }
    }

    #[test]
    fn test_new_run_logs_again() {
        let progress = TracingProgress::default();
        assert_eq!(progress.next_step(0.5), Some(5));
        assert_eq!(progress.next_step(1.0), Some(10));
        assert_eq!(progress.next_step(0.5), Some(5));
        assert_eq!(progress.next_step(0.55), None);
    }
}
