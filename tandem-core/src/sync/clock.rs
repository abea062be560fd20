//! Clock Reconciler
//!
//! Decides whether the local transport has drifted far enough from the
//! projected authoritative position to warrant a seek.

use tracing::debug;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Within tolerance, nothing to do
    None,
    /// Seek the transport to this position (seconds)
    Seek(f64),
    /// A scrub gesture is in progress; reconciliation is suspended
    Suspended,
}

/// Tolerance-band reconciler with scrub suspension
#[derive(Debug, Clone)]
pub struct ClockReconciler {
    /// Maximum tolerated |actual - target| in seconds
    threshold_seconds: f64,
    /// Whether a local scrub/drag gesture is in progress
    scrubbing: bool,
}

impl ClockReconciler {
    pub fn new(threshold_seconds: f64) -> Self {
        Self {
            threshold_seconds,
            scrubbing: false,
        }
    }

    pub fn threshold_seconds(&self) -> f64 {
        self.threshold_seconds
    }

    /// Decide what to do given the projected target and the actual position.
    ///
    /// `force` bypasses the tolerance band (targeted corrections) but never a
    /// scrub in progress.
    pub fn evaluate(&self, target: f64, actual: f64, force: bool) -> Correction {
        if self.scrubbing {
            return Correction::Suspended;
        }

        let diff = (actual - target).abs();
        if force || diff > self.threshold_seconds {
            debug!(
                "Reconcile: drift {:.3}s (target: {:.3}s, actual: {:.3}s, forced: {})",
                diff, target, actual, force
            );
            Correction::Seek(target)
        } else {
            Correction::None
        }
    }

    pub fn begin_scrub(&mut self) {
        self.scrubbing = true;
    }

    pub fn end_scrub(&mut self) {
        self.scrubbing = false;
    }

    pub fn is_scrubbing(&self) -> bool {
        self.scrubbing
    }

    /// Forget any gesture state (leaving the room)
    pub fn reset(&mut self) {
        self.scrubbing = false;
    }
}

impl Default for ClockReconciler {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CORRECTION_THRESHOLD_SECONDS)
    }
}
