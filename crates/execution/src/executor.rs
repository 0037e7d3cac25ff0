//! Idempotent order execution against the brokerage gateway.
//!
//! One executor owns the insert/remove side of the position ledger.
//! Every admitted signal goes through `execute`, every closure through
//! `close`; nothing else creates or removes ledger entries except the
//! reconciliation job.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use opt_trade_broker::gateway::{BrokerGateway, OrderRequest};
use opt_trade_core::error::ExecutionError;
use opt_trade_core::market::Greeks;
use opt_trade_core::position::{CloseReason, Position, PositionStatus, Trade};
use opt_trade_core::signal::{OrderSide, Signal};

use crate::ledger::PositionLedger;
use crate::store::Store;

/// Metadata key set when a close could not reach the broker and the
/// ledger was cleaned up locally; reconciliation picks these up.
pub const FORCED_LOCAL_CLOSE: &str = "forced_local_close";

/// An admitted signal plus the sizing the risk manager attached to it.
#[derive(Debug, Clone)]
pub struct OrderPlan {
    pub signal: Signal,
    pub quantity: i64,
    pub stop_loss: Decimal,
    pub target: Decimal,
    pub entry_greeks: Greeks,
}

/// Outcome of a single execution attempt. Failures are recorded, not
/// raised; the ledger is untouched on any non-filled outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Filled { position_id: Uuid },
    Duplicate,
    Failed { reason: String },
}

pub struct OrderExecutor {
    gateway: Arc<dyn BrokerGateway>,
    store: Arc<dyn Store>,
    ledger: Arc<PositionLedger>,
    dedup_window_secs: i64,
    recent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl OrderExecutor {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        store: Arc<dyn Store>,
        ledger: Arc<PositionLedger>,
        dedup_window_secs: u64,
    ) -> Self {
        Self {
            gateway,
            store,
            ledger,
            dedup_window_secs: dedup_window_secs as i64,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Content-derived key: two signals for the same contract, side, and
    /// strategy landing in the same time bucket are the same logical
    /// signal, so a retry cannot open a second position.
    fn idempotency_key(&self, signal: &Signal) -> String {
        let bucket = if self.dedup_window_secs > 0 {
            signal.created_at.timestamp() / self.dedup_window_secs
        } else {
            0
        };
        format!(
            "{}|{}|{}|{:?}|{}|{}",
            signal.symbol, signal.strike, signal.right, signal.side, signal.strategy, bucket
        )
    }

    /// True if the key was already seen inside the window. Marks it seen
    /// otherwise, and prunes expired entries while it holds the lock.
    fn is_duplicate(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut recent = self.recent.lock();
        let window = self.dedup_window_secs;
        recent.retain(|_, seen| (now - *seen).num_seconds() <= window);
        if recent.contains_key(key) {
            return true;
        }
        recent.insert(key.to_string(), now);
        false
    }

    /// Execute an admitted signal. On a fill, inserts the new position
    /// into the ledger and persists it; on rejection or timeout the
    /// ledger is left unchanged and the failure is the result.
    pub async fn execute(&self, plan: &OrderPlan) -> ExecutionResult {
        let signal = &plan.signal;
        if plan.quantity <= 0 {
            return ExecutionResult::Failed {
                reason: format!("non-positive quantity {}", plan.quantity),
            };
        }

        let key = self.idempotency_key(signal);
        if self.is_duplicate(&key, Utc::now()) {
            info!(contract = signal.contract_key(), "Duplicate signal suppressed");
            return ExecutionResult::Duplicate;
        }

        let order = OrderRequest {
            symbol: signal.symbol.clone(),
            right: signal.right,
            strike: signal.strike,
            expiry: signal.expiry,
            side: signal.side,
            quantity: plan.quantity,
            price: signal.entry_price,
        };

        let ack = match self.gateway.place_order(&order).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(
                    contract = signal.contract_key(),
                    error = %e,
                    "Order rejected or timed out, ledger unchanged"
                );
                // The signal may legitimately be retried after a failure.
                self.recent.lock().remove(&key);
                return ExecutionResult::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let mut metadata = HashMap::new();
        metadata.insert("order_id".to_string(), ack.order_id.clone());
        let position = Position {
            id: Uuid::new_v4(),
            symbol: signal.symbol.clone(),
            right: signal.right,
            strike: signal.strike,
            expiry: signal.expiry,
            side: signal.side,
            quantity: plan.quantity,
            entry_price: ack.fill_price,
            entry_time: ack.filled_at,
            current_price: ack.fill_price,
            stop_loss: plan.stop_loss,
            target: plan.target,
            trailing_stop: None,
            strategy: signal.strategy.clone(),
            entry_greeks: plan.entry_greeks,
            metadata,
            status: PositionStatus::Open,
        };
        let position_id = position.id;

        self.ledger.insert(position.clone());
        if let Err(e) = self.store.upsert_position(&position).await {
            // The ledger stays authoritative; the next reconciliation
            // pass re-persists from it.
            error!(position_id = %position_id, error = %e, "Failed to persist new position");
        }

        info!(
            position_id = %position_id,
            contract = signal.contract_key(),
            side = %signal.side,
            quantity = plan.quantity,
            fill = %ack.fill_price,
            strategy = signal.strategy,
            "Position opened"
        );
        ExecutionResult::Filled { position_id }
    }

    /// Close a position: place the offsetting order, remove the ledger
    /// entry, and persist exactly one trade record.
    ///
    /// An unreachable broker does not leave the position stuck open: the
    /// ledger entry is still removed, the trade is marked as a forced
    /// local close, and reconciliation settles the broker side later.
    ///
    /// # Errors
    /// `PositionUnavailable` if the id is unknown or another caller is
    /// already closing it.
    pub async fn close(&self, id: Uuid, reason: CloseReason) -> Result<Trade, ExecutionError> {
        let claimed = self
            .ledger
            .begin_close(id)
            .ok_or_else(|| ExecutionError::PositionUnavailable(id.to_string()))?;

        let offset_side = match claimed.side {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        };
        let order = OrderRequest {
            symbol: claimed.symbol.clone(),
            right: claimed.right,
            strike: claimed.strike,
            expiry: claimed.expiry,
            side: offset_side,
            quantity: claimed.quantity,
            price: claimed.current_price,
        };

        let (exit_price, forced_local) = match self.gateway.place_order(&order).await {
            Ok(ack) => (ack.fill_price, false),
            Err(e) => {
                warn!(
                    position_id = %id,
                    error = %e,
                    "Broker unreachable on close, forcing local closure"
                );
                (claimed.current_price, true)
            }
        };

        // begin_close guarantees we are the only closer, so the entry is
        // still present here.
        let mut final_state = self
            .ledger
            .remove(id)
            .ok_or_else(|| ExecutionError::PositionUnavailable(id.to_string()))?;
        if forced_local {
            final_state
                .metadata
                .insert(FORCED_LOCAL_CLOSE.to_string(), "true".to_string());
        }

        let trade = final_state.into_trade(exit_price, reason, Utc::now());
        if let Err(e) = self.store.insert_trade(&trade).await {
            error!(position_id = %id, error = %e, "Failed to persist trade record");
        }
        if let Err(e) = self.store.delete_position(id).await {
            error!(position_id = %id, error = %e, "Failed to delete persisted position");
        }

        info!(
            position_id = %id,
            reason = %reason,
            exit = %exit_price,
            pnl = %trade.realized_pnl,
            forced_local,
            "Position closed"
        );
        Ok(trade)
    }
}
