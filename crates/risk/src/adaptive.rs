//! Adaptive threshold controller.
//!
//! Recomputes `RiskThresholds` on a fixed cadence from a volatility
//! regime base multiplied by rolling-performance multipliers, then
//! publishes the snapshot atomically through the watch channel. Poor
//! recent performance loosens thresholds to seek more opportunities;
//! excellent performance tightens them to protect the edge.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tracing::{debug, info};

use opt_trade_core::config::{AdaptiveConfig, RiskConfig};
use opt_trade_core::thresholds::RiskThresholds;

/// Hard bounds the published thresholds can never leave, regardless of
/// how extreme the performance inputs are.
pub const MIN_STRENGTH_FLOOR: f64 = 40.0;
pub const MIN_STRENGTH_CEILING: f64 = 80.0;
pub const MAX_POSITIONS_FLOOR: usize = 1;
pub const MAX_POSITIONS_CEILING: usize = 6;
pub const RISK_PCT_FLOOR: Decimal = dec!(0.005);
pub const RISK_PCT_CEILING: Decimal = dec!(0.04);

/// Trades kept in the rolling window.
const TRADE_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolRegime {
    Low,
    Normal,
    High,
}

impl VolRegime {
    /// Classify against the same VIX band the stop-loss scaling uses.
    #[must_use]
    pub fn classify(vix: f64, config: &RiskConfig) -> Self {
        if vix < config.vix_low {
            Self::Low
        } else if vix > config.vix_high {
            Self::High
        } else {
            Self::Normal
        }
    }

    /// Regime base values: (min strength, max positions, per-trade risk).
    fn base(self) -> (f64, usize, Decimal) {
        match self {
            Self::Low => (50.0, 4, dec!(0.025)),
            Self::Normal => (55.0, 3, dec!(0.02)),
            Self::High => (65.0, 2, dec!(0.015)),
        }
    }
}

/// Rolling performance counters feeding the controller.
///
/// Trades keep a bounded window of win/loss outcomes; admissions are
/// session counters reset at rollover.
#[derive(Debug, Default)]
pub struct RollingStats {
    outcomes: VecDeque<bool>,
    accepted: u64,
    rejected: u64,
}

impl RollingStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_trade(&mut self, win: bool) {
        if self.outcomes.len() == TRADE_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(win);
    }

    pub fn record_admission(&mut self, accepted: bool) {
        if accepted {
            self.accepted += 1;
        } else {
            self.rejected += 1;
        }
    }

    #[must_use]
    pub fn sample_size(&self) -> usize {
        self.outcomes.len()
    }

    /// None until at least one trade has closed.
    #[must_use]
    pub fn win_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let wins = self.outcomes.iter().filter(|w| **w).count();
        Some(wins as f64 / self.outcomes.len() as f64)
    }

    /// Share of admission decisions that passed, None before any decision.
    #[must_use]
    pub fn acceptance_rate(&self) -> Option<f64> {
        let total = self.accepted + self.rejected;
        if total == 0 {
            return None;
        }
        Some(self.accepted as f64 / total as f64)
    }

    /// Consecutive losses counting back from the most recent trade.
    #[must_use]
    pub fn loss_streak(&self) -> u32 {
        self.outcomes.iter().rev().take_while(|w| !**w).count() as u32
    }

    /// Session rollover wipes all counters.
    pub fn reset(&mut self) {
        self.outcomes.clear();
        self.accepted = 0;
        self.rejected = 0;
    }
}

pub struct AdaptiveController {
    config: AdaptiveConfig,
    risk: RiskConfig,
    tx: watch::Sender<RiskThresholds>,
}

impl AdaptiveController {
    #[must_use]
    pub fn new(config: AdaptiveConfig, risk: RiskConfig, tx: watch::Sender<RiskThresholds>) -> Self {
        Self { config, risk, tx }
    }

    /// Recompute and publish new thresholds. Returns false when the
    /// sample is still too small to act on.
    pub fn recompute(&self, vix: f64, stats: &RollingStats) -> bool {
        if stats.sample_size() < self.config.min_sample {
            debug!(
                sample = stats.sample_size(),
                min_sample = self.config.min_sample,
                "Adaptive recompute skipped, sample too small"
            );
            return false;
        }

        let regime = VolRegime::classify(vix, &self.risk);
        let (base_strength, base_positions, base_risk) = regime.base();

        let win_rate = stats.win_rate().unwrap_or(0.5);
        let acceptance = stats.acceptance_rate().unwrap_or(0.5);

        // Win rate 0% -> 0.85 (loosen), 100% -> 1.15 (tighten).
        let mut strength_mult = (0.7 + 0.6 * win_rate).clamp(0.85, 1.15);
        // Nearly everything being rejected loosens the gate a notch more.
        if acceptance < 0.2 {
            strength_mult *= 0.95;
        }

        let positions = if win_rate < 0.4 {
            base_positions + 1
        } else if win_rate > 0.65 {
            base_positions.saturating_sub(1)
        } else {
            base_positions
        };

        // Risk budget scales with win rate, 0.75x-1.25x of the base.
        let risk_mult = (0.5 + win_rate).clamp(0.75, 1.25);
        let risk_mult = Decimal::try_from(risk_mult).unwrap_or(Decimal::ONE);

        let next = RiskThresholds {
            min_signal_strength: (base_strength * strength_mult)
                .clamp(MIN_STRENGTH_FLOOR, MIN_STRENGTH_CEILING),
            max_positions: positions.clamp(MAX_POSITIONS_FLOOR, MAX_POSITIONS_CEILING),
            per_trade_risk_pct: (base_risk * risk_mult).clamp(RISK_PCT_FLOOR, RISK_PCT_CEILING),
            min_win_rate: self.tx.borrow().min_win_rate,
            max_loss_streak: self.tx.borrow().max_loss_streak,
            adjusted_at: chrono::Utc::now(),
        };

        info!(
            regime = ?regime,
            win_rate = format!("{win_rate:.2}"),
            acceptance = format!("{acceptance:.2}"),
            min_strength = next.min_signal_strength,
            max_positions = next.max_positions,
            risk_pct = %next.per_trade_risk_pct,
            "Risk thresholds adjusted"
        );
        self.tx.send_replace(next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt_trade_core::thresholds;

    fn controller() -> (AdaptiveController, watch::Receiver<RiskThresholds>) {
        let (tx, rx) = thresholds::channel(RiskThresholds::default());
        let config = AdaptiveConfig {
            min_sample: 10,
            ..AdaptiveConfig::default()
        };
        (
            AdaptiveController::new(config, RiskConfig::default(), tx),
            rx,
        )
    }

    fn stats_with_win_rate(trades: usize, wins: usize) -> RollingStats {
        let mut stats = RollingStats::new();
        for i in 0..trades {
            stats.record_trade(i < wins);
        }
        stats
    }

    #[test]
    fn skips_below_min_sample() {
        let (controller, rx) = controller();
        let before = rx.borrow().clone();
        assert!(!controller.recompute(18.0, &stats_with_win_rate(3, 2)));
        assert_eq!(*rx.borrow(), before);
    }

    #[test]
    fn bounds_hold_at_zero_percent_win_rate() {
        let (controller, rx) = controller();
        assert!(controller.recompute(40.0, &stats_with_win_rate(50, 0)));
        let t = rx.borrow().clone();
        assert!(t.min_signal_strength >= MIN_STRENGTH_FLOOR);
        assert!(t.min_signal_strength <= MIN_STRENGTH_CEILING);
        assert!(t.max_positions >= MAX_POSITIONS_FLOOR);
        assert!(t.max_positions <= MAX_POSITIONS_CEILING);
        assert!(t.per_trade_risk_pct >= RISK_PCT_FLOOR);
        assert!(t.per_trade_risk_pct <= RISK_PCT_CEILING);
    }

    #[test]
    fn bounds_hold_at_hundred_percent_win_rate() {
        let (controller, rx) = controller();
        assert!(controller.recompute(8.0, &stats_with_win_rate(50, 50)));
        let t = rx.borrow().clone();
        assert!(t.min_signal_strength >= MIN_STRENGTH_FLOOR);
        assert!(t.min_signal_strength <= MIN_STRENGTH_CEILING);
        assert!(t.max_positions >= MAX_POSITIONS_FLOOR);
        assert!(t.max_positions <= MAX_POSITIONS_CEILING);
        assert!(t.per_trade_risk_pct <= RISK_PCT_CEILING);
    }

    #[test]
    fn poor_performance_loosens_excellent_tightens() {
        let (controller, rx) = controller();
        controller.recompute(18.0, &stats_with_win_rate(50, 5));
        let loose = rx.borrow().clone();
        controller.recompute(18.0, &stats_with_win_rate(50, 45));
        let tight = rx.borrow().clone();
        assert!(loose.min_signal_strength < tight.min_signal_strength);
        assert!(loose.max_positions > tight.max_positions);
    }

    #[test]
    fn high_vix_regime_is_stricter_than_low() {
        let (controller, rx) = controller();
        let stats = stats_with_win_rate(50, 25);
        controller.recompute(8.0, &stats);
        let low = rx.borrow().clone();
        controller.recompute(35.0, &stats);
        let high = rx.borrow().clone();
        assert!(high.min_signal_strength > low.min_signal_strength);
        assert!(high.max_positions < low.max_positions);
        assert!(high.per_trade_risk_pct < low.per_trade_risk_pct);
    }

    #[test]
    fn loss_streak_counts_from_most_recent() {
        let mut stats = RollingStats::new();
        stats.record_trade(true);
        stats.record_trade(false);
        stats.record_trade(false);
        assert_eq!(stats.loss_streak(), 2);
        stats.record_trade(true);
        assert_eq!(stats.loss_streak(), 0);
    }

    #[test]
    fn reset_wipes_all_counters() {
        let mut stats = stats_with_win_rate(10, 5);
        stats.record_admission(true);
        stats.record_admission(false);
        stats.reset();
        assert_eq!(stats.sample_size(), 0);
        assert_eq!(stats.win_rate(), None);
        assert_eq!(stats.acceptance_rate(), None);
    }
}
