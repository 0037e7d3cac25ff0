//! Positions and closed-trade records.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::market::Greeks;
use crate::signal::{OptionRight, OrderSide};

/// Lifecycle state of a ledger entry.
///
/// `Closing` is set under the position lock before a close is executed so
/// that exactly one `Trade` can ever be produced for an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    Target,
    TrailingStop,
    EndOfDay,
    DailyLossLimit,
    Orphaned,
    Shutdown,
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopLoss => "stop_loss",
            Self::Target => "target",
            Self::TrailingStop => "trailing_stop",
            Self::EndOfDay => "end_of_day",
            Self::DailyLossLimit => "daily_loss_limit",
            Self::Orphaned => "orphaned",
            Self::Shutdown => "shutdown",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// A live trade tracked by the position ledger.
///
/// Exactly one authoritative copy exists per id; concurrent mutation is
/// serialized by the ledger's per-position lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub right: OptionRight,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub side: OrderSide,
    pub quantity: i64,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub current_price: Decimal,
    pub stop_loss: Decimal,
    pub target: Decimal,
    pub trailing_stop: Option<Decimal>,
    pub strategy: String,
    #[serde(default)]
    pub entry_greeks: Greeks,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub status: PositionStatus,
}

impl Position {
    /// Contract identity matching `Signal::contract_key`.
    pub fn contract_key(&self) -> String {
        format!("{} {}{}", self.symbol, self.strike, self.right)
    }

    /// Direction-aware unrealized P&L at the current mark.
    pub fn unrealized_pnl(&self) -> Decimal {
        pnl(self.side, self.entry_price, self.current_price, self.quantity)
    }

    /// A position with a non-positive quantity or entry price cannot be
    /// priced or closed sanely; the monitor routes these to a skipped list.
    pub fn is_well_formed(&self) -> bool {
        self.quantity > 0 && self.entry_price > Decimal::ZERO
    }

    /// Convert to an immutable trade record at the given exit.
    pub fn into_trade(self, exit_price: Decimal, reason: CloseReason, exit_time: DateTime<Utc>) -> Trade {
        let realized_pnl = pnl(self.side, self.entry_price, exit_price, self.quantity);
        let hold_duration_secs = (exit_time - self.entry_time).num_seconds().max(0);
        Trade {
            position_id: self.id,
            symbol: self.symbol,
            right: self.right,
            strike: self.strike,
            expiry: self.expiry,
            side: self.side,
            quantity: self.quantity,
            entry_price: self.entry_price,
            entry_time: self.entry_time,
            exit_price,
            exit_time,
            exit_reason: reason,
            realized_pnl,
            hold_duration_secs,
            strategy: self.strategy,
            metadata: self.metadata,
        }
    }
}

/// Direction-aware P&L: longs profit on a rise, shorts on a fall.
pub fn pnl(side: OrderSide, entry: Decimal, exit: Decimal, quantity: i64) -> Decimal {
    let qty = Decimal::from(quantity);
    match side {
        OrderSide::Buy => (exit - entry) * qty,
        OrderSide::Sell => (entry - exit) * qty,
    }
}

/// Closed-position historical record. Immutable once written; created
/// exactly once per position closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub position_id: Uuid,
    pub symbol: String,
    pub right: OptionRight,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub side: OrderSide,
    pub quantity: i64,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Decimal,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: CloseReason,
    pub realized_pnl: Decimal,
    pub hold_duration_secs: i64,
    pub strategy: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_position(side: OrderSide, entry: Decimal, quantity: i64) -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "NIFTY".to_string(),
            right: OptionRight::Put,
            strike: dec!(24500),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 24).unwrap(),
            side,
            quantity,
            entry_price: entry,
            entry_time: Utc::now(),
            current_price: entry,
            stop_loss: dec!(80),
            target: dec!(140),
            trailing_stop: None,
            strategy: "short_strangle".to_string(),
            entry_greeks: Greeks::default(),
            metadata: HashMap::new(),
            status: PositionStatus::Open,
        }
    }

    #[test]
    fn sell_position_profits_on_price_fall() {
        let pos = make_position(OrderSide::Sell, dec!(100), 50);
        let trade = pos.into_trade(dec!(80), CloseReason::Target, Utc::now());
        assert_eq!(trade.realized_pnl, dec!(1000));
        assert!(trade.is_win());
    }

    #[test]
    fn buy_position_loses_on_price_fall() {
        let pos = make_position(OrderSide::Buy, dec!(100), 50);
        let trade = pos.into_trade(dec!(80), CloseReason::StopLoss, Utc::now());
        assert_eq!(trade.realized_pnl, dec!(-1000));
        assert!(!trade.is_win());
    }

    #[test]
    fn unrealized_pnl_tracks_mark() {
        let mut pos = make_position(OrderSide::Buy, dec!(100), 10);
        pos.current_price = dec!(112.5);
        assert_eq!(pos.unrealized_pnl(), dec!(125));
    }

    #[test]
    fn zero_quantity_is_malformed() {
        let pos = make_position(OrderSide::Buy, dec!(100), 0);
        assert!(!pos.is_well_formed());
    }
}
