//! Paper trading shim.
//!
//! Simulates order fills and a synthetic option chain without touching a
//! real broker. Useful for running the full pipeline and as a test double
//! (failures can be injected to exercise the error paths).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

use opt_trade_core::market::{Greeks, MarketSnapshot, OptionChain, OptionQuote};
use opt_trade_core::signal::OrderSide;

use crate::gateway::{BrokerGateway, BrokerPosition, MarketDataProvider, OrderAck, OrderRequest};

#[derive(Debug, Clone)]
struct PaperBook {
    positions: HashMap<String, BrokerPosition>,
    prices: HashMap<String, Decimal>,
}

/// In-memory broker that fills at the requested limit price.
pub struct PaperGateway {
    book: Mutex<PaperBook>,
    fail_next_order: AtomicBool,
    unreachable: AtomicBool,
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            book: Mutex::new(PaperBook {
                positions: HashMap::new(),
                prices: HashMap::new(),
            }),
            fail_next_order: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Make the next `place_order` fail with a rejection.
    pub fn inject_order_failure(&self) {
        self.fail_next_order.store(true, Ordering::SeqCst);
    }

    /// Simulate the broker being unreachable for all calls.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Seed or move the simulated last price for a contract.
    pub fn set_price(&self, contract_key: &str, price: Decimal) {
        self.book.lock().prices.insert(contract_key.to_string(), price);
    }

    /// Drop a broker-side position, simulating an externally closed trade
    /// (reconciliation should then see an orphan in the ledger).
    pub fn drop_position(&self, contract_key: &str) {
        self.book.lock().positions.remove(contract_key);
    }

    /// Insert a broker-side position the engine does not know about
    /// (reconciliation should recover it).
    pub fn seed_position(&self, position: BrokerPosition) {
        let key = position.contract_key();
        self.book.lock().positions.insert(key, position);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("broker connection timed out");
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        self.check_reachable()?;
        if self.fail_next_order.swap(false, Ordering::SeqCst) {
            anyhow::bail!("broker rejected order: insufficient margin");
        }

        let key = order.contract_key();
        let mut book = self.book.lock();

        // Signed book: buys add, sells subtract; flat entries are removed.
        let signed = match order.side {
            OrderSide::Buy => order.quantity,
            OrderSide::Sell => -order.quantity,
        };
        match book.positions.get_mut(&key) {
            Some(existing) => {
                let existing_signed = match existing.side {
                    OrderSide::Buy => existing.quantity,
                    OrderSide::Sell => -existing.quantity,
                };
                let net = existing_signed + signed;
                if net == 0 {
                    book.positions.remove(&key);
                } else {
                    existing.side = if net > 0 { OrderSide::Buy } else { OrderSide::Sell };
                    existing.quantity = net.abs();
                }
            }
            None => {
                book.positions.insert(
                    key.clone(),
                    BrokerPosition {
                        symbol: order.symbol.clone(),
                        right: order.right,
                        strike: order.strike,
                        expiry: order.expiry,
                        side: order.side,
                        quantity: order.quantity,
                        avg_price: order.price,
                        last_price: order.price,
                    },
                );
            }
        }
        book.prices.insert(key.clone(), order.price);

        let ack = OrderAck {
            order_id: format!("PAPER-{}", Utc::now().timestamp_millis()),
            fill_price: order.price,
            filled_at: Utc::now(),
        };
        info!(
            order_id = ack.order_id,
            contract = key,
            side = %order.side,
            quantity = order.quantity,
            price = %ack.fill_price,
            "Paper fill simulated"
        );
        Ok(ack)
    }

    async fn last_prices(&self, contract_keys: &[String]) -> Result<HashMap<String, Decimal>> {
        self.check_reachable()?;
        let book = self.book.lock();
        Ok(contract_keys
            .iter()
            .filter_map(|key| book.prices.get(key).map(|price| (key.clone(), *price)))
            .collect())
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
        self.check_reachable()?;
        Ok(self.book.lock().positions.values().cloned().collect())
    }
}

/// Deterministic synthetic market data for paper mode.
///
/// The spot oscillates around a base value per tick so the pipeline has
/// something to react to without a live feed.
pub struct PaperMarketData {
    base_spot: Decimal,
    vix: f64,
    strike_step: Decimal,
    tick: AtomicU64,
    overrides: Mutex<HashMap<String, f64>>,
}

impl PaperMarketData {
    #[must_use]
    pub fn new(base_spot: Decimal, vix: f64, strike_step: Decimal) -> Self {
        Self {
            base_spot,
            vix,
            strike_step,
            tick: AtomicU64::new(0),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Pin an indicator value into every subsequent snapshot.
    pub fn set_indicator(&self, name: &str, value: f64) {
        self.overrides.lock().insert(name.to_string(), value);
    }

    fn synthetic_quote(distance: Decimal, spot: Decimal) -> OptionQuote {
        // Rough premium decay with distance from spot; enough texture for
        // the selector, not a pricing model.
        let base = (spot * dec!(0.008)).max(dec!(1));
        let decay = (distance.abs() / spot * dec!(20)).min(dec!(0.9));
        let last = (base * (Decimal::ONE - decay)).max(dec!(0.5));
        OptionQuote {
            last,
            bid: (last - dec!(0.5)).max(dec!(0.05)),
            ask: last + dec!(0.5),
            volume: 1500,
            open_interest: 8000,
            oi_change: 250,
            iv: 0.16,
            greeks: Greeks {
                delta: 0.5,
                gamma: 0.02,
                theta: -4.5,
                vega: 11.0,
            },
        }
    }
}

#[async_trait]
impl MarketDataProvider for PaperMarketData {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst);
        // Triangle-wave drift of ±0.2% over a 40-tick period.
        let phase = (tick % 40) as i64 - 20;
        let drift = Decimal::from(phase) / dec!(10000);
        let spot = self.base_spot * (Decimal::ONE + drift);

        let atm = (spot / self.strike_step).round() * self.strike_step;
        let mut calls = BTreeMap::new();
        let mut puts = BTreeMap::new();
        for offset in -5i64..=5 {
            let strike = atm + Decimal::from(offset) * self.strike_step;
            calls.insert(strike, Self::synthetic_quote(strike - spot, spot));
            puts.insert(strike, Self::synthetic_quote(spot - strike, spot));
        }

        let now = Utc::now();
        // Next Thursday, the weekly index expiry.
        let days_ahead = (3 - now.weekday().num_days_from_monday() as i64).rem_euclid(7);
        let expiry_hint = now.date_naive() + Duration::days(days_ahead);
        let mut indicators = HashMap::new();
        indicators.insert("rsi".to_string(), 52.0 + phase as f64 / 4.0);
        indicators.insert("trend".to_string(), phase as f64 / 20.0);
        for (name, value) in self.overrides.lock().iter() {
            indicators.insert(name.clone(), *value);
        }

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            spot,
            vix: self.vix,
            chain: OptionChain { calls, puts },
            chain_expiry: expiry_hint,
            pcr: 0.95 + phase as f64 / 200.0,
            max_pain: atm,
            indicators,
            captured_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use opt_trade_core::signal::OptionRight;

    fn order(side: OrderSide, quantity: i64) -> OrderRequest {
        OrderRequest {
            symbol: "NIFTY".to_string(),
            right: OptionRight::Call,
            strike: dec!(24800),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 24).unwrap(),
            side,
            quantity,
            price: dec!(120),
        }
    }

    #[tokio::test]
    async fn fill_records_broker_position() {
        let gw = PaperGateway::new();
        gw.place_order(&order(OrderSide::Buy, 50)).await.unwrap();

        let positions = gw.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 50);
        assert_eq!(positions[0].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn opposite_order_flattens_position() {
        let gw = PaperGateway::new();
        gw.place_order(&order(OrderSide::Buy, 50)).await.unwrap();
        gw.place_order(&order(OrderSide::Sell, 50)).await.unwrap();
        assert!(gw.list_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_rejects_once() {
        let gw = PaperGateway::new();
        gw.inject_order_failure();
        assert!(gw.place_order(&order(OrderSide::Buy, 50)).await.is_err());
        assert!(gw.place_order(&order(OrderSide::Buy, 50)).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_gateway_errors_everywhere() {
        let gw = PaperGateway::new();
        gw.set_unreachable(true);
        assert!(gw.place_order(&order(OrderSide::Buy, 1)).await.is_err());
        assert!(gw.list_positions().await.is_err());
    }

    #[tokio::test]
    async fn snapshot_has_chain_around_spot() {
        let md = PaperMarketData::new(dec!(24750), 14.0, dec!(50));
        let snap = md.snapshot("NIFTY").await.unwrap();
        assert!(!snap.is_empty());
        assert_eq!(snap.chain.calls.len(), 11);
        let atm = snap.atm_strike().unwrap();
        assert!((atm - snap.spot).abs() <= dec!(50));
    }
}
