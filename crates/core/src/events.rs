//! Typed events pushed to external consumers (dashboard, notifier).
//!
//! Delivery is best-effort over a `tokio::sync::broadcast` channel; a slow
//! or disconnected consumer never blocks the core loops.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::position::CloseReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    PositionOpened {
        position_id: Uuid,
        contract: String,
        quantity: i64,
        entry_price: Decimal,
        timestamp: DateTime<Utc>,
    },
    PositionUpdated {
        position_id: Uuid,
        current_price: Decimal,
        unrealized_pnl: Decimal,
        timestamp: DateTime<Utc>,
    },
    PositionClosed {
        position_id: Uuid,
        reason: CloseReason,
        realized_pnl: Decimal,
        timestamp: DateTime<Utc>,
    },
    PnlUpdate {
        daily_realized: Decimal,
        open_unrealized: Decimal,
        timestamp: DateTime<Utc>,
    },
    CircuitBreaker {
        triggered: bool,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Alert {
        severity: AlertSeverity,
        message: String,
        timestamp: DateTime<Utc>,
    },
    MarketCondition {
        symbol: String,
        spot: Decimal,
        vix: f64,
        pcr: f64,
        timestamp: DateTime<Utc>,
    },
}
