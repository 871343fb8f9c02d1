//! Circuit breaker for the remote embedding dependency.
//!
//! Five consecutive failures open the circuit for five minutes. While
//! open, the non-blocking ingest path short-circuits to `None` and the
//! blocking recall path fails fast, so a dead embedding service costs one
//! state check instead of a timeout per request.

use std::time::{Duration, Instant};

/// Consecutive failures before the circuit opens.
pub const FAILURE_THRESHOLD: u32 = 5;

/// How long the circuit stays open before a trial call.
pub const OPEN_DURATION: Duration = Duration::from_secs(300);

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { opened_at: Instant },
}

/// Embedding circuit breaker state machine.
#[derive(Debug)]
pub struct EmbedCircuitBreaker {
    state: State,
    failure_threshold: u32,
    open_duration: Duration,
}

impl EmbedCircuitBreaker {
    /// Creates a breaker with the default thresholds.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: State::Closed { failures: 0 },
            failure_threshold: FAILURE_THRESHOLD,
            open_duration: OPEN_DURATION,
        }
    }

    /// Overrides the open duration (tests).
    #[must_use]
    pub const fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Whether a call may proceed. An expired open window admits one trial
    /// call; its outcome decides whether the circuit closes or re-opens.
    pub fn allow(&mut self) -> bool {
        match self.state {
            State::Closed { .. } => true,
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.open_duration {
                    tracing::info!("Embedding circuit breaker trial call after open window");
                    self.state = State::Closed {
                        failures: self.failure_threshold.saturating_sub(1),
                    };
                    true
                } else {
                    false
                }
            },
        }
    }

    /// Records a successful call, fully closing the circuit.
    pub fn on_success(&mut self) {
        self.state = State::Closed { failures: 0 };
    }

    /// Records a failed call. Returns `true` when this failure tripped the
    /// circuit open.
    pub fn on_failure(&mut self) -> bool {
        match &mut self.state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.failure_threshold {
                    tracing::warn!(
                        failures = *failures,
                        "Embedding circuit breaker opened after consecutive failures"
                    );
                    self.state = State::Open {
                        opened_at: Instant::now(),
                    };
                    metrics::counter!("embed_circuit_trips_total").increment(1);
                    return true;
                }
                false
            },
            State::Open { .. } => false,
        }
    }

    /// Whether the circuit is currently open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }
}

impl Default for EmbedCircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold() {
        let mut breaker = EmbedCircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            assert!(!breaker.on_failure());
        }
        assert!(breaker.on_failure());
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut breaker = EmbedCircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            breaker.on_failure();
        }
        breaker.on_success();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            assert!(!breaker.on_failure());
        }
        assert!(!breaker.is_open());
    }

    #[test]
    fn expired_window_admits_trial_call() {
        let mut breaker = EmbedCircuitBreaker::new().with_open_duration(Duration::from_millis(0));
        for _ in 0..FAILURE_THRESHOLD {
            breaker.on_failure();
        }
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(1));
        assert!(breaker.allow());
        // One more failure re-opens immediately.
        assert!(breaker.on_failure());
        assert!(breaker.is_open());
    }
}
