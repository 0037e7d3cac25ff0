//! Admission control, position sizing, and exit rules.
//!
//! The risk manager never talks to the brokerage gateway; it only judges
//! signals and mutates the single position it is handed.

use chrono::NaiveTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use opt_trade_core::config::{RiskConfig, SessionConfig};
use opt_trade_core::error::RejectReason;
use opt_trade_core::position::{CloseReason, Position};
use opt_trade_core::signal::{OrderSide, Signal};
use opt_trade_core::thresholds::RiskThresholds;

use crate::breaker::CircuitBreaker;

/// Output of `size_and_targets`: quantity plus protective levels.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub quantity: i64,
    pub stop_loss: Decimal,
    pub target: Decimal,
    pub required_margin: Decimal,
}

/// Account/batch state the admission decision runs against. The engine
/// folds same-batch admissions into these numbers so no two signals are
/// approved against the same capital.
#[derive(Debug, Clone)]
pub struct AdmissionContext {
    pub open_positions: usize,
    pub available_capital: Decimal,
    /// Daily realized + unrealized P&L (negative = loss).
    pub daily_pnl: Decimal,
    pub now: NaiveTime,
}

pub struct RiskManager {
    config: RiskConfig,
    session: SessionConfig,
    breaker: Arc<CircuitBreaker>,
    thresholds: watch::Receiver<RiskThresholds>,
}

impl RiskManager {
    #[must_use]
    pub fn new(
        config: RiskConfig,
        session: SessionConfig,
        breaker: Arc<CircuitBreaker>,
        thresholds: watch::Receiver<RiskThresholds>,
    ) -> Self {
        Self {
            config,
            session,
            breaker,
            thresholds,
        }
    }

    /// Ordered admission checks; the first failure is the recorded
    /// rejection reason. Rejections are expected outcomes, not errors.
    pub fn can_admit(
        &self,
        signal: &Signal,
        required_margin: Decimal,
        ctx: &AdmissionContext,
    ) -> Result<(), RejectReason> {
        if let crate::breaker::BreakerState::Triggered { reason, .. } = self.breaker.state() {
            return Err(RejectReason::CircuitBreaker(reason.to_string()));
        }

        let max_positions = self.thresholds.borrow().max_positions;
        if ctx.open_positions >= max_positions {
            return Err(RejectReason::MaxPositions {
                open: ctx.open_positions,
                max: max_positions,
            });
        }

        if required_margin > ctx.available_capital {
            return Err(RejectReason::InsufficientCapital {
                required: required_margin.to_string(),
                available: ctx.available_capital.to_string(),
            });
        }

        if ctx.now < self.session.open || ctx.now >= self.session.forced_exit {
            return Err(RejectReason::OutsideTradingWindow);
        }

        let limit = self.config.initial_capital * self.config.daily_loss_limit_pct;
        if -ctx.daily_pnl >= limit {
            return Err(RejectReason::DailyLossLimit {
                loss: (-ctx.daily_pnl).to_string(),
                limit: limit.to_string(),
            });
        }

        debug!(contract = signal.contract_key(), "Signal admitted");
        Ok(())
    }

    /// VIX-scaled stop-loss fraction, linear between the configured VIX
    /// band and clamped to [stop_loss_min_pct, stop_loss_max_pct].
    /// High volatility widens the stop; low volatility narrows it.
    pub fn stop_fraction(&self, vix: f64) -> Decimal {
        let span = self.config.vix_high - self.config.vix_low;
        let t = if span <= 0.0 {
            0.0
        } else {
            ((vix - self.config.vix_low) / span).clamp(0.0, 1.0)
        };
        let t = Decimal::try_from(t).unwrap_or(Decimal::ZERO);
        let range = self.config.stop_loss_max_pct - self.config.stop_loss_min_pct;
        self.config.stop_loss_min_pct + range * t
    }

    /// Fixed-fraction sizing: the per-trade risk budget divided by the
    /// stop distance, with a single target at a fixed reward multiple.
    pub fn size_and_targets(&self, signal: &Signal, equity: Decimal, vix: f64) -> SizedOrder {
        let risk_pct = self.thresholds.borrow().per_trade_risk_pct;
        let risk_budget = equity * risk_pct;
        let fraction = self.stop_fraction(vix);
        let stop_distance = signal.entry_price * fraction;

        let quantity = if stop_distance <= Decimal::ZERO {
            0
        } else {
            (risk_budget / stop_distance)
                .floor()
                .to_i64()
                .unwrap_or(0)
                .max(0)
        };

        let (stop_loss, target) = match signal.side {
            OrderSide::Buy => (
                signal.entry_price - stop_distance,
                signal.entry_price + stop_distance * self.config.reward_multiple,
            ),
            OrderSide::Sell => (
                signal.entry_price + stop_distance,
                signal.entry_price - stop_distance * self.config.reward_multiple,
            ),
        };

        let notional = signal.entry_price * Decimal::from(quantity);
        let required_margin = match signal.side {
            OrderSide::Buy => notional,
            OrderSide::Sell => notional * self.config.short_margin_multiple,
        };

        SizedOrder {
            quantity,
            stop_loss,
            target: target.max(Decimal::ZERO),
            required_margin,
        }
    }

    /// Mark a position to market: current price, and ratchet the trailing
    /// stop toward the price. The caller holds the position's lock.
    pub fn update_mark_to_market(&self, position: &mut Position, price: Decimal) {
        position.current_price = price;

        let trail = self.config.trailing_stop_pct;
        match position.side {
            OrderSide::Buy => {
                // Only trail once the trade is in profit.
                if price > position.entry_price {
                    let candidate = price * (Decimal::ONE - trail);
                    position.trailing_stop = Some(
                        position
                            .trailing_stop
                            .map_or(candidate, |existing| existing.max(candidate)),
                    );
                }
            }
            OrderSide::Sell => {
                if price < position.entry_price {
                    let candidate = price * (Decimal::ONE + trail);
                    position.trailing_stop = Some(
                        position
                            .trailing_stop
                            .map_or(candidate, |existing| existing.min(candidate)),
                    );
                }
            }
        }
    }

    /// Stop-loss / target / trailing-stop breach check.
    pub fn should_exit(&self, position: &Position) -> Option<CloseReason> {
        let price = position.current_price;
        match position.side {
            OrderSide::Buy => {
                if price <= position.stop_loss {
                    return Some(CloseReason::StopLoss);
                }
                if price >= position.target {
                    return Some(CloseReason::Target);
                }
                if let Some(trail) = position.trailing_stop {
                    if price <= trail {
                        return Some(CloseReason::TrailingStop);
                    }
                }
            }
            OrderSide::Sell => {
                if price >= position.stop_loss {
                    return Some(CloseReason::StopLoss);
                }
                if price <= position.target {
                    return Some(CloseReason::Target);
                }
                if let Some(trail) = position.trailing_stop {
                    if price >= trail {
                        return Some(CloseReason::TrailingStop);
                    }
                }
            }
        }
        None
    }

    /// True at/after the forced end-of-day exit time.
    #[must_use]
    pub fn should_exit_eod(&self, now: NaiveTime) -> bool {
        now >= self.session.forced_exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::TripReason;
    use chrono::{NaiveDate, Utc};
    use opt_trade_core::market::Greeks;
    use opt_trade_core::position::PositionStatus;
    use opt_trade_core::signal::OptionRight;
    use opt_trade_core::thresholds;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn manager_with(breaker: Arc<CircuitBreaker>) -> RiskManager {
        let (_tx, rx) = thresholds::channel(RiskThresholds::default());
        RiskManager::new(RiskConfig::default(), SessionConfig::default(), breaker, rx)
    }

    fn signal(side: OrderSide, entry: Decimal) -> Signal {
        Signal {
            symbol: "NIFTY".to_string(),
            right: OptionRight::Call,
            strike: dec!(24800),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 24).unwrap(),
            side,
            entry_price: entry,
            strategy: "directional_momentum".to_string(),
            strength: 70.0,
            created_at: Utc::now(),
            ml: None,
        }
    }

    fn ctx() -> AdmissionContext {
        AdmissionContext {
            open_positions: 0,
            available_capital: dec!(500000),
            daily_pnl: Decimal::ZERO,
            now: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
        }
    }

    fn position(side: OrderSide) -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "NIFTY".to_string(),
            right: OptionRight::Call,
            strike: dec!(24800),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 24).unwrap(),
            side,
            quantity: 50,
            entry_price: dec!(100),
            entry_time: Utc::now(),
            current_price: dec!(100),
            stop_loss: if side == OrderSide::Buy { dec!(82) } else { dec!(118) },
            target: if side == OrderSide::Buy { dec!(136) } else { dec!(64) },
            trailing_stop: None,
            strategy: "directional_momentum".to_string(),
            entry_greeks: Greeks::default(),
            metadata: Default::default(),
            status: PositionStatus::Open,
        }
    }

    #[test]
    fn never_admits_while_breaker_triggered() {
        let breaker = Arc::new(CircuitBreaker::new());
        let manager = manager_with(breaker.clone());
        breaker.trip(TripReason::DailyLossLimit);

        let result = manager.can_admit(&signal(OrderSide::Buy, dec!(100)), dec!(1000), &ctx());
        assert!(matches!(result, Err(RejectReason::CircuitBreaker(_))));
    }

    #[test]
    fn rejects_when_max_positions_reached() {
        let manager = manager_with(Arc::new(CircuitBreaker::new()));
        let mut context = ctx();
        context.open_positions = RiskThresholds::default().max_positions;
        let result = manager.can_admit(&signal(OrderSide::Buy, dec!(100)), dec!(1000), &context);
        assert!(matches!(result, Err(RejectReason::MaxPositions { .. })));
    }

    #[test]
    fn rejects_outside_trading_window() {
        let manager = manager_with(Arc::new(CircuitBreaker::new()));
        let mut context = ctx();
        context.now = NaiveTime::from_hms_opt(15, 20, 0).unwrap();
        let result = manager.can_admit(&signal(OrderSide::Buy, dec!(100)), dec!(1000), &context);
        assert_eq!(result, Err(RejectReason::OutsideTradingWindow));
    }

    #[test]
    fn rejects_on_daily_loss_breach() {
        let manager = manager_with(Arc::new(CircuitBreaker::new()));
        let mut context = ctx();
        // 3% of 500k = 15k limit.
        context.daily_pnl = dec!(-15000);
        let result = manager.can_admit(&signal(OrderSide::Buy, dec!(100)), dec!(1000), &context);
        assert!(matches!(result, Err(RejectReason::DailyLossLimit { .. })));
    }

    #[test]
    fn first_failing_check_wins() {
        let breaker = Arc::new(CircuitBreaker::new());
        let manager = manager_with(breaker.clone());
        breaker.trip(TripReason::Manual);
        let mut context = ctx();
        context.open_positions = 99;
        // Breaker check comes before position count.
        let result = manager.can_admit(&signal(OrderSide::Buy, dec!(100)), dec!(1000), &context);
        assert!(matches!(result, Err(RejectReason::CircuitBreaker(_))));
    }

    #[test]
    fn stop_fraction_scales_with_vix_and_stays_bounded() {
        let manager = manager_with(Arc::new(CircuitBreaker::new()));
        assert_eq!(manager.stop_fraction(5.0), dec!(0.15));
        assert_eq!(manager.stop_fraction(50.0), dec!(0.24));
        let mid = manager.stop_fraction(20.0);
        assert!(mid > dec!(0.15) && mid < dec!(0.24));
    }

    #[test]
    fn sizing_respects_risk_budget() {
        let manager = manager_with(Arc::new(CircuitBreaker::new()));
        let sized = manager.size_and_targets(&signal(OrderSide::Buy, dec!(100)), dec!(500000), 12.0);
        // Budget 2% of 500k = 10000; stop distance 100 * 0.15 = 15 → 666.
        assert_eq!(sized.quantity, 666);
        assert_eq!(sized.stop_loss, dec!(85));
        assert_eq!(sized.target, dec!(130));
        assert_eq!(sized.required_margin, dec!(66600));
    }

    #[test]
    fn short_sizing_carries_margin_multiple() {
        let manager = manager_with(Arc::new(CircuitBreaker::new()));
        let sized = manager.size_and_targets(&signal(OrderSide::Sell, dec!(100)), dec!(500000), 12.0);
        assert!(sized.stop_loss > dec!(100));
        assert!(sized.target < dec!(100));
        assert_eq!(
            sized.required_margin,
            dec!(100) * Decimal::from(sized.quantity) * dec!(1.5)
        );
    }

    #[test]
    fn buy_exit_rules_direction_aware() {
        let manager = manager_with(Arc::new(CircuitBreaker::new()));
        let mut pos = position(OrderSide::Buy);

        pos.current_price = dec!(81);
        assert_eq!(manager.should_exit(&pos), Some(CloseReason::StopLoss));

        pos.current_price = dec!(140);
        assert_eq!(manager.should_exit(&pos), Some(CloseReason::Target));

        pos.current_price = dec!(100);
        assert_eq!(manager.should_exit(&pos), None);
    }

    #[test]
    fn sell_exit_rules_inverted() {
        let manager = manager_with(Arc::new(CircuitBreaker::new()));
        let mut pos = position(OrderSide::Sell);

        pos.current_price = dec!(120);
        assert_eq!(manager.should_exit(&pos), Some(CloseReason::StopLoss));

        pos.current_price = dec!(60);
        assert_eq!(manager.should_exit(&pos), Some(CloseReason::Target));
    }

    #[test]
    fn trailing_stop_ratchets_up_for_longs() {
        let manager = manager_with(Arc::new(CircuitBreaker::new()));
        let mut pos = position(OrderSide::Buy);

        manager.update_mark_to_market(&mut pos, dec!(120));
        let first = pos.trailing_stop.unwrap();
        manager.update_mark_to_market(&mut pos, dec!(130));
        let second = pos.trailing_stop.unwrap();
        assert!(second > first);

        // Price retreat never lowers the trail.
        manager.update_mark_to_market(&mut pos, dec!(121));
        assert_eq!(pos.trailing_stop.unwrap(), second);
    }

    #[test]
    fn eod_cutoff_inclusive() {
        let manager = manager_with(Arc::new(CircuitBreaker::new()));
        assert!(manager.should_exit_eod(NaiveTime::from_hms_opt(15, 10, 0).unwrap()));
        assert!(!manager.should_exit_eod(NaiveTime::from_hms_opt(15, 9, 59).unwrap()));
    }
}
