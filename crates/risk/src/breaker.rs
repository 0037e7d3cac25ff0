//! Circuit breaker gating new admissions.
//!
//! Two states only. `Normal -> Triggered` on a volatility spike, a
//! high-severity reversal signal, or a daily-loss breach. `Triggered ->
//! Normal` only via an explicit `reset` (operator override or session
//! rollover) — it never self-heals, so a trip always forces operator
//! attention. Open positions keep being monitored and closed while
//! triggered; only new admissions stop.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What tripped the breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TripReason {
    VixSpike { vix: f64, threshold: f64 },
    Reversal { detail: String },
    DailyLossLimit,
    Manual,
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VixSpike { vix, threshold } => {
                write!(f, "vix_spike ({vix:.1} >= {threshold:.1})")
            }
            Self::Reversal { detail } => write!(f, "reversal ({detail})"),
            Self::DailyLossLimit => write!(f, "daily_loss_limit"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BreakerState {
    Normal,
    Triggered {
        reason: TripReason,
        at: DateTime<Utc>,
    },
}

pub struct CircuitBreaker {
    state: RwLock<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(BreakerState::Normal),
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state.read().clone()
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        matches!(*self.state.read(), BreakerState::Triggered { .. })
    }

    /// Trip the breaker. The first trip wins; a trip while already
    /// triggered keeps the original reason and timestamp.
    ///
    /// Returns true if this call performed the transition.
    pub fn trip(&self, reason: TripReason) -> bool {
        let mut state = self.state.write();
        if matches!(*state, BreakerState::Triggered { .. }) {
            return false;
        }
        warn!(reason = %reason, "Circuit breaker TRIGGERED");
        *state = BreakerState::Triggered {
            reason,
            at: Utc::now(),
        };
        true
    }

    /// Explicit reset back to `Normal`. Returns true if the breaker was
    /// triggered.
    pub fn reset(&self) -> bool {
        let mut state = self.state.write();
        let was_triggered = matches!(*state, BreakerState::Triggered { .. });
        if was_triggered {
            info!("Circuit breaker reset to normal");
        }
        *state = BreakerState::Normal;
        was_triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_normal() {
        let breaker = CircuitBreaker::new();
        assert!(!breaker.is_triggered());
    }

    #[test]
    fn trip_transitions_once_and_keeps_first_reason() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.trip(TripReason::DailyLossLimit));
        assert!(!breaker.trip(TripReason::Manual));

        match breaker.state() {
            BreakerState::Triggered { reason, .. } => {
                assert_eq!(reason, TripReason::DailyLossLimit);
            }
            BreakerState::Normal => panic!("expected triggered"),
        }
    }

    #[test]
    fn never_self_heals_without_reset() {
        let breaker = CircuitBreaker::new();
        breaker.trip(TripReason::VixSpike {
            vix: 35.0,
            threshold: 32.0,
        });
        // No amount of reads flips it back.
        for _ in 0..100 {
            assert!(breaker.is_triggered());
        }
        assert!(breaker.reset());
        assert!(!breaker.is_triggered());
    }
}
