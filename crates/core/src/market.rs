//! Market-state snapshots supplied by the external data provider.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Option greeks snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
}

/// One strike's quote inside the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionQuote {
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume: u64,
    pub open_interest: u64,
    pub oi_change: i64,
    pub iv: f64,
    pub greeks: Greeks,
}

impl OptionQuote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::from(2)
    }
}

/// Full option chain keyed by strike.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionChain {
    pub calls: BTreeMap<Decimal, OptionQuote>,
    pub puts: BTreeMap<Decimal, OptionQuote>,
}

/// Per-symbol market state consumed read-only each cycle.
///
/// The provider may return stale or partial data; consumers must treat
/// that as "no signal" rather than fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub spot: Decimal,
    pub vix: f64,
    pub chain: OptionChain,
    /// Expiry the chain quotes refer to (nearest weekly).
    pub chain_expiry: chrono::NaiveDate,
    /// Put/call ratio computed by the provider.
    pub pcr: f64,
    pub max_pain: Decimal,
    #[serde(default)]
    pub indicators: HashMap<String, f64>,
    pub captured_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// True when the snapshot is older than `max_age_secs`.
    pub fn is_stale(&self, max_age_secs: i64, now: DateTime<Utc>) -> bool {
        now - self.captured_at > Duration::seconds(max_age_secs)
    }

    /// True when the chain carries no quotes at all (partial-data guard).
    pub fn is_empty(&self) -> bool {
        self.chain.calls.is_empty() && self.chain.puts.is_empty()
    }

    /// Nearest listed strike at or above/below the spot for the given side
    /// of the chain. Returns `None` on an empty chain.
    pub fn atm_strike(&self) -> Option<Decimal> {
        let strikes: Vec<Decimal> = self
            .chain
            .calls
            .keys()
            .chain(self.chain.puts.keys())
            .copied()
            .collect();
        strikes
            .into_iter()
            .min_by_key(|s| (*s - self.spot).abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(last: Decimal) -> OptionQuote {
        OptionQuote {
            last,
            bid: last - dec!(0.5),
            ask: last + dec!(0.5),
            volume: 1000,
            open_interest: 5000,
            oi_change: 120,
            iv: 0.18,
            greeks: Greeks::default(),
        }
    }

    #[test]
    fn staleness_uses_captured_at() {
        let snap = MarketSnapshot {
            symbol: "NIFTY".to_string(),
            spot: dec!(24750),
            vix: 14.2,
            chain: OptionChain::default(),
            chain_expiry: chrono::NaiveDate::from_ymd_opt(2026, 9, 24).unwrap(),
            pcr: 0.92,
            max_pain: dec!(24700),
            indicators: HashMap::new(),
            captured_at: Utc::now() - Duration::seconds(120),
        };
        assert!(snap.is_stale(60, Utc::now()));
        assert!(!snap.is_stale(300, Utc::now()));
    }

    #[test]
    fn atm_strike_picks_nearest() {
        let mut chain = OptionChain::default();
        for strike in [dec!(24600), dec!(24700), dec!(24800)] {
            chain.calls.insert(strike, quote(dec!(100)));
        }
        let snap = MarketSnapshot {
            symbol: "NIFTY".to_string(),
            spot: dec!(24740),
            vix: 14.2,
            chain,
            chain_expiry: chrono::NaiveDate::from_ymd_opt(2026, 9, 24).unwrap(),
            pcr: 1.0,
            max_pain: dec!(24700),
            indicators: HashMap::new(),
            captured_at: Utc::now(),
        };
        assert_eq!(snap.atm_strike(), Some(dec!(24700)));
    }
}
