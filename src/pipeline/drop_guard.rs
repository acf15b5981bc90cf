//! Discovery drop guard.
//!
//! A discovery pass that observed far fewer ids than the previous accepted
//! pass usually means the search surface was throttled or broken, not that
//! listings vanished. Missing detection is skipped for such a pass so that
//! healthy items are not queued for verification en masse.
//!
//! A drop that holds steady over `confirm_passes` complete passes is a real
//! shrink of the catalog and becomes the new baseline.

use crate::models::PassRecord;

/// Drop guard thresholds.
#[derive(Debug, Clone)]
pub struct DropGuardConfig {
    /// Maximum allowed drop percentage (0-100)
    pub max_drop_percent: u8,
    /// Below this previous count the check is skipped (new catalogs)
    pub min_baseline: usize,
    /// Consistent held passes that confirm a lower baseline (0 never confirms)
    pub confirm_passes: u32,
}

impl Default for DropGuardConfig {
    fn default() -> Self {
        Self {
            max_drop_percent: 20,
            min_baseline: 100,
            confirm_passes: 3,
        }
    }
}

/// Verdict on one discovery pass.
#[derive(Debug, Clone, PartialEq)]
pub enum DropVerdict {
    Safe { current: usize, previous: usize },
    /// No usable previous pass
    ColdStart { current: usize },
    Triggered {
        current: usize,
        previous: usize,
        drop_percent: f64,
    },
    /// Nothing observed at all while a baseline exists
    Empty { previous: usize },
}

impl DropVerdict {
    /// Whether missing detection may run after this pass.
    pub fn allows_missing_detection(&self) -> bool {
        matches!(self, Self::Safe { .. } | Self::ColdStart { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DropGuard {
    config: DropGuardConfig,
}

impl DropGuard {
    pub fn with_config(config: DropGuardConfig) -> Self {
        Self { config }
    }

    /// Compare the distinct ids seen this pass with the last accepted pass.
    pub fn check(&self, current: usize, previous: Option<usize>) -> DropVerdict {
        let previous = previous.unwrap_or(0);

        if current == 0 && previous > 0 {
            return DropVerdict::Empty { previous };
        }
        if previous < self.config.min_baseline {
            return DropVerdict::ColdStart { current };
        }

        if current < previous {
            let drop_percent = (previous - current) as f64 / previous as f64 * 100.0;
            if drop_percent > self.config.max_drop_percent as f64 {
                return DropVerdict::Triggered {
                    current,
                    previous,
                    drop_percent,
                };
            }
        }

        DropVerdict::Safe { current, previous }
    }

    /// Whether two pass sizes lie within `max_drop_percent` of each other.
    pub fn consistent(&self, a: usize, b: usize) -> bool {
        let (low, high) = (a.min(b), a.max(b));
        if high == 0 {
            return true;
        }
        (high - low) as f64 / high as f64 * 100.0 <= self.config.max_drop_percent as f64
    }

    /// Length of the held streak once a blocked pass of `current` ids is added.
    ///
    /// The streak restarts when `current` is not consistent with the
    /// previous held pass.
    pub fn hold(&self, baseline: &PassRecord, current: usize) -> u32 {
        if baseline.held_passes > 0 && self.consistent(baseline.held_observed, current) {
            baseline.held_passes + 1
        } else {
            1
        }
    }

    /// Whether a held streak is long enough to become the new baseline.
    pub fn is_confirmed(&self, held_passes: u32) -> bool {
        self.config.confirm_passes > 0 && held_passes >= self.config.confirm_passes
    }

    /// `check` plus logging; returns whether missing detection may run.
    pub fn evaluate(&self, run_id: &str, current: usize, previous: Option<usize>) -> bool {
        let verdict = self.check(current, previous);
        match &verdict {
            DropVerdict::Safe { current, previous } => {
                log::info!("[{run_id}] Drop guard: SAFE ({current} ids, was {previous})");
            }
            DropVerdict::ColdStart { current } => {
                log::info!("[{run_id}] Drop guard: COLD START ({current} ids, no baseline)");
            }
            DropVerdict::Triggered {
                current,
                previous,
                drop_percent,
            } => {
                log::error!(
                    "[{run_id}] Drop guard: TRIGGERED {previous} → {current} ids ({drop_percent:.1}% drop > {}%), skipping missing detection",
                    self.config.max_drop_percent
                );
            }
            DropVerdict::Empty { previous } => {
                log::error!(
                    "[{run_id}] Drop guard: EMPTY pass (was {previous}), skipping missing detection"
                );
            }
        }
        verdict.allows_missing_detection()
    }
}
