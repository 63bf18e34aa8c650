//! Progress phase tracking for two-stage upscale jobs.

use crate::interaction::{ProgressPhase, ProgressUpdate};

/// Backend progress near which a drop to zero means "phase two started"
/// rather than "nothing running yet".
const NEAR_COMPLETE: f64 = 0.9;

/// Folds raw backend progress fractions into phase-qualified updates.
///
/// The backend exposes a single progress metric even when an upscale job
/// runs two passes (regenerate, then upscale); the metric resets downward
/// when the second pass begins. The first observed decrease, or a
/// zero-to-nonzero transition after the metric previously came near
/// completion, is treated as the phase boundary. This is an approximation:
/// a non-monotonic metric for any other reason would flip the phase early,
/// and nothing flips it back.
pub(crate) struct PhaseTracker {
    two_phase: bool,
    phase: ProgressPhase,
    last: f64,
    peak: f64,
}

impl PhaseTracker {
    pub(crate) fn new(two_phase: bool) -> Self {
        Self {
            two_phase,
            phase: ProgressPhase::Render,
            last: 0.0,
            peak: 0.0,
        }
    }

    pub(crate) fn observe(&mut self, raw: f64) -> ProgressUpdate {
        if self.two_phase && self.phase == ProgressPhase::Render {
            let decreased = raw < self.last;
            let restarted = raw > 0.0 && self.last == 0.0 && self.peak >= NEAR_COMPLETE;
            if decreased || restarted {
                self.phase = ProgressPhase::Upscale;
            }
        }
        self.last = raw;
        self.peak = self.peak.max(raw);
        ProgressUpdate {
            phase: self.phase,
            fraction: raw.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_progress_stays_in_render_phase() {
        let mut tracker = PhaseTracker::new(true);
        for raw in [0.0, 0.2, 0.5, 0.9, 0.95] {
            assert_eq!(tracker.observe(raw).phase, ProgressPhase::Render);
        }
    }

    #[test]
    fn decrease_flips_to_upscale() {
        let mut tracker = PhaseTracker::new(true);
        tracker.observe(0.5);
        tracker.observe(0.95);
        let update = tracker.observe(0.1);
        assert_eq!(update.phase, ProgressPhase::Upscale);
        // And it never flips back.
        assert_eq!(tracker.observe(0.8).phase, ProgressPhase::Upscale);
    }

    #[test]
    fn zero_to_nonzero_after_near_complete_flips() {
        let mut tracker = PhaseTracker::new(true);
        tracker.observe(0.95);
        tracker.observe(0.0); // the drop itself already counts as a decrease
        assert_eq!(tracker.observe(0.05).phase, ProgressPhase::Upscale);
    }

    #[test]
    fn initial_zeroes_do_not_flip() {
        let mut tracker = PhaseTracker::new(true);
        assert_eq!(tracker.observe(0.0).phase, ProgressPhase::Render);
        assert_eq!(tracker.observe(0.0).phase, ProgressPhase::Render);
        assert_eq!(tracker.observe(0.3).phase, ProgressPhase::Render);
    }

    #[test]
    fn single_phase_jobs_never_flip() {
        let mut tracker = PhaseTracker::new(false);
        tracker.observe(0.9);
        assert_eq!(tracker.observe(0.1).phase, ProgressPhase::Render);
    }

    #[test]
    fn fraction_is_clamped() {
        let mut tracker = PhaseTracker::new(false);
        assert_eq!(tracker.observe(1.4).fraction, 1.0);
        assert_eq!(tracker.observe(-0.2).fraction, 0.0);
    }
}
