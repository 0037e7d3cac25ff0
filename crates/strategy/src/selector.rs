//! Strategy variant selection and raw signal generation.
//!
//! Variants rotate per cycle with a deterministic exploration step; an
//! external meta-controller can pin the choice via `set_override`. Long
//! volatility variants are gated by time of day: skipped in the opening
//! minutes, substituted with the short-premium fallback after the cutoff
//! hour.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use opt_trade_core::config::{SessionConfig, StrategyConfig};
use opt_trade_core::market::{MarketSnapshot, OptionQuote};
use opt_trade_core::signal::{OptionRight, OrderSide, Signal};

/// Coarse behavior class used for time-of-day gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyClass {
    /// Long gamma, profits from movement (straddles and friends).
    LongVolatility,
    /// Short premium, profits from decay.
    ShortPremium,
    /// Indicator-driven directional option buying.
    Directional,
}

impl StrategyClass {
    pub fn of(name: &str) -> Option<Self> {
        match name {
            "straddle" => Some(Self::LongVolatility),
            "short_strangle" => Some(Self::ShortPremium),
            "directional_momentum" => Some(Self::Directional),
            _ => None,
        }
    }
}

pub struct StrategySelector {
    config: StrategyConfig,
    session: SessionConfig,
    cycle: AtomicU64,
    override_variant: Mutex<Option<String>>,
}

impl StrategySelector {
    #[must_use]
    pub fn new(config: StrategyConfig, session: SessionConfig) -> Self {
        Self {
            config,
            session,
            cycle: AtomicU64::new(0),
            override_variant: Mutex::new(None),
        }
    }

    /// Pin the variant choice (external meta-controller decision). `None`
    /// returns control to rotation.
    pub fn set_override(&self, variant: Option<String>) {
        *self.override_variant.lock() = variant;
    }

    /// Pick the variant for this cycle, applying time-of-day gating.
    /// Returns `None` when nothing is eligible.
    fn select_variant(&self, now: NaiveTime) -> Option<String> {
        if self.config.variants.is_empty() {
            return None;
        }
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst);

        let picked = if let Some(pinned) = self.override_variant.lock().clone() {
            pinned
        } else {
            let len = self.config.variants.len() as u64;
            let mut idx = cycle % len;
            if self.config.explore_every > 0 && cycle % self.config.explore_every == 0 {
                idx = (idx + 1) % len;
            }
            self.config.variants[idx as usize].clone()
        };

        match StrategyClass::of(&picked) {
            Some(StrategyClass::LongVolatility) => self.gate_long_vol(picked, now),
            Some(_) => Some(picked),
            None => {
                warn!(strategy = picked, "Unknown strategy variant, skipping cycle");
                None
            }
        }
    }

    fn gate_long_vol(&self, picked: String, now: NaiveTime) -> Option<String> {
        let gate_end = self.session.open + Duration::minutes(self.session.opening_gate_minutes);
        if now >= self.session.open && now < gate_end {
            debug!(strategy = picked, "Long-volatility variant gated during opening window");
            return None;
        }
        let cutoff = NaiveTime::from_hms_opt(self.session.long_vol_cutoff_hour, 0, 0)?;
        if now >= cutoff {
            if self.config.short_premium_fallback.is_empty() {
                debug!(
                    strategy = picked,
                    "Long-volatility variant past cutoff and no fallback configured"
                );
                return None;
            }
            debug!(
                from = picked,
                to = self.config.short_premium_fallback,
                "Substituting short-premium fallback past cutoff hour"
            );
            return Some(self.config.short_premium_fallback.clone());
        }
        Some(picked)
    }

    /// Produce this cycle's candidate signals from the market snapshot.
    ///
    /// All failure modes (empty chain, unknown variant, missing strikes)
    /// log and return an empty set; they are never errors.
    pub fn generate(&self, snapshot: &MarketSnapshot, now: DateTime<Utc>) -> Vec<Signal> {
        if snapshot.is_empty() {
            warn!(symbol = snapshot.symbol, "Empty option chain, no signals");
            return Vec::new();
        }
        let Some(variant) = self.select_variant(now.time()) else {
            return Vec::new();
        };

        let signals = match variant.as_str() {
            "directional_momentum" => directional_momentum(snapshot, now),
            "straddle" => straddle(snapshot, now),
            "short_strangle" => short_strangle(snapshot, now),
            other => {
                warn!(strategy = other, "No generator for variant");
                Vec::new()
            }
        };
        debug!(
            strategy = variant,
            count = signals.len(),
            "Generated candidate signals"
        );
        signals
    }
}

fn make_signal(
    snapshot: &MarketSnapshot,
    strategy: &str,
    right: OptionRight,
    strike: Decimal,
    side: OrderSide,
    quote: &OptionQuote,
    strength: f64,
    now: DateTime<Utc>,
) -> Signal {
    Signal {
        symbol: snapshot.symbol.clone(),
        right,
        strike,
        expiry: snapshot.chain_expiry,
        side,
        entry_price: quote.mid(),
        strategy: strategy.to_string(),
        strength: strength.clamp(0.0, 100.0),
        created_at: now,
        ml: None,
    }
}

/// Buy the ATM call or put in the direction of the trend indicator.
fn directional_momentum(snapshot: &MarketSnapshot, now: DateTime<Utc>) -> Vec<Signal> {
    let trend = snapshot.indicators.get("trend").copied().unwrap_or(0.0);
    if trend.abs() < 0.1 {
        return Vec::new();
    }
    let Some(atm) = snapshot.atm_strike() else {
        return Vec::new();
    };
    let (right, book) = if trend > 0.0 {
        (OptionRight::Call, &snapshot.chain.calls)
    } else {
        (OptionRight::Put, &snapshot.chain.puts)
    };
    let Some(quote) = book.get(&atm) else {
        return Vec::new();
    };
    let rsi = snapshot.indicators.get("rsi").copied().unwrap_or(50.0);
    let rsi_confirm = if trend > 0.0 { rsi - 50.0 } else { 50.0 - rsi };
    let strength = 50.0 + trend.abs() * 40.0 + rsi_confirm.max(0.0) / 2.0;
    vec![make_signal(
        snapshot,
        "directional_momentum",
        right,
        atm,
        OrderSide::Buy,
        quote,
        strength,
        now,
    )]
}

/// Buy the ATM straddle when implied volatility looks cheap. Emits two
/// legs as independent signals; they are admitted independently.
fn straddle(snapshot: &MarketSnapshot, now: DateTime<Utc>) -> Vec<Signal> {
    if snapshot.vix >= 20.0 {
        return Vec::new();
    }
    let Some(atm) = snapshot.atm_strike() else {
        return Vec::new();
    };
    let strength = 45.0 + (20.0 - snapshot.vix) * 2.5;
    let mut signals = Vec::new();
    if let Some(call) = snapshot.chain.calls.get(&atm) {
        signals.push(make_signal(
            snapshot, "straddle", OptionRight::Call, atm, OrderSide::Buy, call, strength, now,
        ));
    }
    if let Some(put) = snapshot.chain.puts.get(&atm) {
        signals.push(make_signal(
            snapshot, "straddle", OptionRight::Put, atm, OrderSide::Buy, put, strength, now,
        ));
    }
    signals
}

/// Sell an OTM call and put two strikes out, harvesting premium in calm
/// regimes.
fn short_strangle(snapshot: &MarketSnapshot, now: DateTime<Utc>) -> Vec<Signal> {
    if snapshot.vix >= 24.0 {
        // Selling premium into a vol spike is the risk manager's veto
        // anyway; don't generate the candidates.
        return Vec::new();
    }
    let Some(atm) = snapshot.atm_strike() else {
        return Vec::new();
    };
    let step = strike_step(snapshot).unwrap_or_else(|| Decimal::from(50));
    let call_strike = atm + step * Decimal::from(2);
    let put_strike = atm - step * Decimal::from(2);
    let strength = 50.0 + snapshot.vix;

    let mut signals = Vec::new();
    if let Some(call) = snapshot.chain.calls.get(&call_strike) {
        signals.push(make_signal(
            snapshot,
            "short_strangle",
            OptionRight::Call,
            call_strike,
            OrderSide::Sell,
            call,
            strength,
            now,
        ));
    }
    if let Some(put) = snapshot.chain.puts.get(&put_strike) {
        signals.push(make_signal(
            snapshot,
            "short_strangle",
            OptionRight::Put,
            put_strike,
            OrderSide::Sell,
            put,
            strength,
            now,
        ));
    }
    signals
}

fn strike_step(snapshot: &MarketSnapshot) -> Option<Decimal> {
    let mut strikes = snapshot.chain.calls.keys();
    let first = *strikes.next()?;
    let second = *strikes.next()?;
    Some(second - first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use opt_trade_core::market::{Greeks, OptionChain};
    use rust_decimal_macros::dec;
    use std::collections::{BTreeMap, HashMap};

    fn quote(last: Decimal) -> OptionQuote {
        OptionQuote {
            last,
            bid: last - dec!(0.5),
            ask: last + dec!(0.5),
            volume: 1000,
            open_interest: 4000,
            oi_change: 80,
            iv: 0.15,
            greeks: Greeks::default(),
        }
    }

    fn snapshot(vix: f64, trend: f64) -> MarketSnapshot {
        let mut calls = BTreeMap::new();
        let mut puts = BTreeMap::new();
        for offset in -3i64..=3 {
            let strike = dec!(24700) + Decimal::from(offset * 50);
            calls.insert(strike, quote(dec!(110)));
            puts.insert(strike, quote(dec!(95)));
        }
        let mut indicators = HashMap::new();
        indicators.insert("trend".to_string(), trend);
        indicators.insert("rsi".to_string(), 58.0);
        MarketSnapshot {
            symbol: "NIFTY".to_string(),
            spot: dec!(24710),
            vix,
            chain: OptionChain { calls, puts },
            chain_expiry: NaiveDate::from_ymd_opt(2026, 9, 24).unwrap(),
            pcr: 0.98,
            max_pain: dec!(24700),
            indicators,
            captured_at: Utc::now(),
        }
    }

    fn selector_with(variants: Vec<&str>, fallback: &str) -> StrategySelector {
        let mut config = StrategyConfig::default();
        config.variants = variants.into_iter().map(String::from).collect();
        config.explore_every = 0;
        config.short_premium_fallback = fallback.to_string();
        StrategySelector::new(config, SessionConfig::default())
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 21, hour, minute, 0).unwrap()
    }

    #[test]
    fn directional_buys_call_on_positive_trend() {
        let selector = selector_with(vec!["directional_momentum"], "");
        let signals = selector.generate(&snapshot(14.0, 0.5), at(11, 0));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].right, OptionRight::Call);
        assert_eq!(signals[0].side, OrderSide::Buy);
        assert!(signals[0].strength > 50.0);
    }

    #[test]
    fn long_vol_past_cutoff_substitutes_fallback() {
        let selector = selector_with(vec!["straddle"], "short_strangle");
        let signals = selector.generate(&snapshot(15.0, 0.0), at(14, 30));
        assert!(!signals.is_empty());
        assert!(signals.iter().all(|s| s.strategy == "short_strangle"));
        assert!(signals.iter().all(|s| s.side == OrderSide::Sell));
    }

    #[test]
    fn long_vol_past_cutoff_without_fallback_is_empty() {
        let selector = selector_with(vec!["straddle"], "");
        let signals = selector.generate(&snapshot(15.0, 0.0), at(14, 30));
        assert!(signals.is_empty());
    }

    #[test]
    fn long_vol_gated_in_opening_window() {
        let selector = selector_with(vec!["straddle"], "short_strangle");
        // Session opens 09:15; gate runs 15 minutes.
        let signals = selector.generate(&snapshot(15.0, 0.0), at(9, 20));
        assert!(signals.is_empty());
    }

    #[test]
    fn unknown_variant_yields_empty_set() {
        let selector = selector_with(vec!["iron_butterfly"], "");
        let signals = selector.generate(&snapshot(15.0, 0.5), at(11, 0));
        assert!(signals.is_empty());
    }

    #[test]
    fn override_pins_variant() {
        let selector = selector_with(
            vec!["directional_momentum", "short_strangle"],
            "short_strangle",
        );
        selector.set_override(Some("short_strangle".to_string()));
        for _ in 0..3 {
            let signals = selector.generate(&snapshot(15.0, 0.5), at(11, 0));
            assert!(signals.iter().all(|s| s.strategy == "short_strangle"));
        }
    }

    #[test]
    fn straddle_emits_both_legs_when_vix_low() {
        let selector = selector_with(vec!["straddle"], "");
        let signals = selector.generate(&snapshot(13.0, 0.0), at(11, 0));
        assert_eq!(signals.len(), 2);
        let rights: Vec<_> = signals.iter().map(|s| s.right).collect();
        assert!(rights.contains(&OptionRight::Call));
        assert!(rights.contains(&OptionRight::Put));
    }
}
