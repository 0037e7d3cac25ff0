//! Adaptive risk thresholds, replaced atomically and never edited in place.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Snapshot of the engine's adaptive limits.
///
/// Single writer (the adaptive configuration controller), many readers.
/// Published through a `watch` channel so readers never observe a
/// half-updated set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Minimum raw signal strength (0-100) admitted to ranking.
    pub min_signal_strength: f64,
    /// Maximum concurrent open positions.
    pub max_positions: usize,
    /// Fraction of equity risked per trade (0.0-1.0).
    pub per_trade_risk_pct: Decimal,
    /// Watchdog: rolling win rate below this raises an alert.
    pub min_win_rate: f64,
    /// Watchdog: consecutive losses at or above this raises an alert.
    pub max_loss_streak: u32,
    pub adjusted_at: DateTime<Utc>,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            min_signal_strength: 55.0,
            max_positions: 3,
            per_trade_risk_pct: dec!(0.02),
            min_win_rate: 0.35,
            max_loss_streak: 4,
            adjusted_at: Utc::now(),
        }
    }
}

/// Create the single-writer/many-reader channel seeded with `initial`.
pub fn channel(initial: RiskThresholds) -> (watch::Sender<RiskThresholds>, watch::Receiver<RiskThresholds>) {
    watch::channel(initial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readers_see_atomic_replacement() {
        let (tx, rx) = channel(RiskThresholds::default());
        let before = rx.borrow().clone();
        assert!((before.min_signal_strength - 55.0).abs() < f64::EPSILON);

        let next = RiskThresholds {
            min_signal_strength: 62.0,
            max_positions: 2,
            ..RiskThresholds::default()
        };
        tx.send(next.clone()).unwrap();

        let after = rx.borrow().clone();
        assert_eq!(after, next);
    }
}
