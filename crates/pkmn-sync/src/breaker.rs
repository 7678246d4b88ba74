use pkmn_core::AbortReason;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    /// Failed / attempted ratio above which the run is aborted.
    pub max_failure_ratio: f64,
    /// Attempts required before the ratio is evaluated.
    pub min_attempts: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failure_ratio: 0.5,
            min_attempts: 10,
        }
    }
}

/// Per-run failure-ratio breaker. Once tripped it stays tripped.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    attempted: usize,
    failed: usize,
    tripped: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            attempted: 0,
            failed: 0,
            tripped: false,
        }
    }

    pub fn record_success(&mut self) {
        self.attempted += 1;
    }

    /// Counts a failed item and reports the abort reason if this failure trips the
    /// breaker.
    pub fn record_failure(&mut self) -> Option<AbortReason> {
        self.attempted += 1;
        self.failed += 1;
        if self.tripped || self.attempted < self.config.min_attempts {
            return None;
        }
        let ratio = self.failed as f64 / self.attempted as f64;
        if ratio > self.config.max_failure_ratio {
            self.tripped = true;
            return Some(AbortReason::CircuitBreakerTripped {
                failed: self.failed,
                attempted: self.attempted,
            });
        }
        None
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn attempted(&self) -> usize {
        self.attempted
    }

    pub fn failed(&self) -> usize {
        self.failed
    }
}
