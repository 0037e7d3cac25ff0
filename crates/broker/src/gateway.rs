//! External interface traits for the brokerage gateway and market data.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use opt_trade_core::market::MarketSnapshot;
use opt_trade_core::signal::{OptionRight, OrderSide};

/// An order sent to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub right: OptionRight,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub side: OrderSide,
    pub quantity: i64,
    /// Limit price; paper mode fills at this price.
    pub price: Decimal,
}

impl OrderRequest {
    pub fn contract_key(&self) -> String {
        format!("{} {}{}", self.symbol, self.strike, self.right)
    }
}

/// Broker acknowledgement of a filled order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub fill_price: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// A position as reported by the broker, used by reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub right: OptionRight,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub side: OrderSide,
    pub quantity: i64,
    pub avg_price: Decimal,
    pub last_price: Decimal,
}

impl BrokerPosition {
    pub fn contract_key(&self) -> String {
        format!("{} {}{}", self.symbol, self.strike, self.right)
    }
}

/// Brokerage gateway. Assumed to rate-limit and occasionally time out;
/// callers apply their own backoff.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Place an order; returns the fill or an error on rejection/timeout.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    /// Batch last-price lookup keyed by contract key.
    async fn last_prices(&self, contract_keys: &[String]) -> Result<HashMap<String, Decimal>>;

    /// Broker-side open positions, the reconciliation ground truth.
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>>;
}

/// Per-symbol market state. May return stale or partial data; consumers
/// treat that as "no signal" rather than fail.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot>;
}
