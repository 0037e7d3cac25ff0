//! Reconciliation between the ledger, persisted storage, and the broker.
//!
//! Corrective actions are deliberately narrow: add positions the broker
//! knows about but the ledger lost, close positions the broker no longer
//! carries, and log price drift. It never overwrites live fields owned
//! by the monitoring loop, which is what makes repeated and concurrent
//! runs safe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};
use uuid::Uuid;

use opt_trade_broker::gateway::{BrokerGateway, BrokerPosition};
use opt_trade_core::config::ReconcileConfig;
use opt_trade_core::position::{CloseReason, Position, PositionStatus};
use opt_trade_core::signal::OrderSide;

use crate::ledger::PositionLedger;
use crate::store::Store;

/// Stop fraction applied to positions recovered without their original
/// risk parameters. Wide on purpose; the monitor tightens via trailing.
const RECOVERY_STOP_FRACTION: Decimal = dec!(0.2);

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub recovered: usize,
    pub orphans_closed: usize,
    pub repersisted: usize,
    pub drift_warnings: usize,
}

pub struct Reconciler {
    gateway: Arc<dyn BrokerGateway>,
    store: Arc<dyn Store>,
    ledger: Arc<PositionLedger>,
    config: ReconcileConfig,
    /// First time each ledger position was seen missing at the broker.
    missing_since: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        store: Arc<dyn Store>,
        ledger: Arc<PositionLedger>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            ledger,
            config,
            missing_since: Mutex::new(HashMap::new()),
        }
    }

    /// Startup recovery: reload persisted open positions into the ledger.
    ///
    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn recover_from_store(&self) -> Result<usize> {
        let persisted = self.store.open_positions().await?;
        let mut recovered = 0;
        for position in persisted {
            if self.ledger.get(position.id).is_none() {
                info!(
                    position_id = %position.id,
                    contract = position.contract_key(),
                    "Recovered persisted position into ledger"
                );
                self.ledger.insert(position);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// One reconciliation pass against the broker's position feed and the
    /// persisted store.
    ///
    /// # Errors
    /// Returns an error if the broker feed or the store is unavailable;
    /// the caller's loop backs off and retries.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let broker_positions = self.gateway.list_positions().await?;
        let by_contract: HashMap<String, &BrokerPosition> = broker_positions
            .iter()
            .map(|p| (p.contract_key(), p))
            .collect();

        let mut report = ReconcileReport::default();
        let ledger_snapshot = self.ledger.snapshot();

        // (a) broker-only positions get re-inserted.
        for broker_pos in &broker_positions {
            let key = broker_pos.contract_key();
            if !ledger_snapshot.iter().any(|p| p.contract_key() == key) {
                let recovered = Self::from_broker(broker_pos);
                warn!(
                    position_id = %recovered.id,
                    contract = key,
                    quantity = broker_pos.quantity,
                    "Broker position missing from ledger, recovering"
                );
                if let Err(e) = self.store.upsert_position(&recovered).await {
                    warn!(error = %e, "Failed to persist recovered position");
                }
                self.ledger.insert(recovered);
                report.recovered += 1;
            }
        }

        // (b) ledger-only positions become orphans after the grace period.
        for position in &ledger_snapshot {
            if position.status == PositionStatus::Closing {
                continue;
            }
            if by_contract.contains_key(&position.contract_key()) {
                self.missing_since.lock().remove(&position.id);
                continue;
            }
            let first_missing = *self
                .missing_since
                .lock()
                .entry(position.id)
                .or_insert(now);
            let missing_for = (now - first_missing).num_seconds();
            if missing_for >= self.config.orphan_grace_secs as i64 {
                if self.force_close_orphan(position.id).await {
                    report.orphans_closed += 1;
                }
            }
        }

        // (c) ledger positions missing from the store get re-persisted.
        // Covers an initial persist that failed at execution time.
        let stored_ids: HashSet<Uuid> = self
            .store
            .open_positions()
            .await?
            .iter()
            .map(|p| p.id)
            .collect();
        for position in &ledger_snapshot {
            if stored_ids.contains(&position.id) || self.ledger.get(position.id).is_none() {
                continue;
            }
            warn!(
                position_id = %position.id,
                contract = position.contract_key(),
                "Ledger position missing from store, re-persisting"
            );
            if let Err(e) = self.store.upsert_position(position).await {
                warn!(error = %e, "Re-persist failed, will retry next pass");
            } else {
                report.repersisted += 1;
            }
        }

        // (d) price drift above tolerance is logged, never corrected.
        for position in &ledger_snapshot {
            if let Some(broker_pos) = by_contract.get(&position.contract_key()) {
                if position.current_price > Decimal::ZERO {
                    let drift = (broker_pos.last_price - position.current_price).abs()
                        / position.current_price;
                    if drift > self.config.price_tolerance_pct {
                        warn!(
                            position_id = %position.id,
                            ledger_price = %position.current_price,
                            broker_price = %broker_pos.last_price,
                            "Price drift above tolerance"
                        );
                        report.drift_warnings += 1;
                    }
                }
            }
        }

        // A position closed elsewhere while marked missing must not leave
        // a stale tracking entry behind.
        let live: HashSet<Uuid> = self.ledger.ids().into_iter().collect();
        self.missing_since.lock().retain(|id, _| live.contains(id));

        Ok(report)
    }

    /// Close an orphan locally: the broker already has no position, so no
    /// offsetting order is placed. Shares the ledger's exactly-once claim
    /// with the executor, so a racing exit cannot double-close.
    async fn force_close_orphan(&self, id: Uuid) -> bool {
        let Some(_claimed) = self.ledger.begin_close(id) else {
            return false;
        };
        let Some(mut final_state) = self.ledger.remove(id) else {
            return false;
        };
        final_state
            .metadata
            .insert("orphaned".to_string(), "true".to_string());
        let exit_price = final_state.current_price;
        let trade = final_state.into_trade(exit_price, CloseReason::Orphaned, Utc::now());

        warn!(
            position_id = %id,
            pnl = %trade.realized_pnl,
            "Orphaned position force-closed"
        );
        if let Err(e) = self.store.insert_trade(&trade).await {
            warn!(error = %e, "Failed to persist orphan trade");
        }
        if let Err(e) = self.store.delete_position(id).await {
            warn!(error = %e, "Failed to delete orphaned position record");
        }
        self.missing_since.lock().remove(&id);
        true
    }

    fn from_broker(broker_pos: &BrokerPosition) -> Position {
        let fraction = broker_pos.avg_price * RECOVERY_STOP_FRACTION;
        let (stop_loss, target) = match broker_pos.side {
            OrderSide::Buy => (
                broker_pos.avg_price - fraction,
                broker_pos.avg_price + fraction * dec!(2),
            ),
            OrderSide::Sell => (
                broker_pos.avg_price + fraction,
                (broker_pos.avg_price - fraction * dec!(2)).max(Decimal::ZERO),
            ),
        };
        let mut metadata = HashMap::new();
        metadata.insert("recovered".to_string(), "true".to_string());
        Position {
            id: Uuid::new_v4(),
            symbol: broker_pos.symbol.clone(),
            right: broker_pos.right,
            strike: broker_pos.strike,
            expiry: broker_pos.expiry,
            side: broker_pos.side,
            quantity: broker_pos.quantity,
            entry_price: broker_pos.avg_price,
            entry_time: Utc::now(),
            current_price: broker_pos.last_price,
            stop_loss,
            target,
            trailing_stop: None,
            strategy: "recovered".to_string(),
            entry_greeks: Default::default(),
            metadata,
            status: PositionStatus::Open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use opt_trade_broker::paper::PaperGateway;
    use opt_trade_core::market::Greeks;
    use opt_trade_core::signal::OptionRight;
    use rust_decimal_macros::dec;

    fn broker_position() -> BrokerPosition {
        BrokerPosition {
            symbol: "NIFTY".to_string(),
            right: OptionRight::Call,
            strike: dec!(24800),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 24).unwrap(),
            side: OrderSide::Buy,
            quantity: 50,
            avg_price: dec!(100),
            last_price: dec!(105),
        }
    }

    fn ledger_position() -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "NIFTY".to_string(),
            right: OptionRight::Call,
            strike: dec!(24800),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 24).unwrap(),
            side: OrderSide::Buy,
            quantity: 50,
            entry_price: dec!(100),
            entry_time: Utc::now(),
            current_price: dec!(105),
            stop_loss: dec!(85),
            target: dec!(130),
            trailing_stop: None,
            strategy: "directional_momentum".to_string(),
            entry_greeks: Greeks::default(),
            metadata: HashMap::new(),
            status: PositionStatus::Open,
        }
    }

    fn reconciler(grace_secs: u64) -> (Reconciler, Arc<PaperGateway>, Arc<MemoryStore>, Arc<PositionLedger>) {
        let gateway = Arc::new(PaperGateway::new());
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(PositionLedger::new());
        let config = ReconcileConfig {
            orphan_grace_secs: grace_secs,
            ..ReconcileConfig::default()
        };
        let reconciler = Reconciler::new(gateway.clone(), store.clone(), ledger.clone(), config);
        (reconciler, gateway, store, ledger)
    }

    #[tokio::test]
    async fn recovers_broker_only_position() {
        let (reconciler, gateway, store, ledger) = reconciler(120);
        gateway.seed_position(broker_position());

        let report = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(ledger.open_count(), 1);
        assert_eq!(store.open_positions().await.unwrap().len(), 1);

        // Idempotent: a second pass finds nothing to do.
        let second = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(second.recovered, 0);
        assert_eq!(ledger.open_count(), 1);
    }

    #[tokio::test]
    async fn orphan_closed_only_after_grace() {
        let (reconciler, _gateway, store, ledger) = reconciler(120);
        ledger.insert(ledger_position());

        let t0 = Utc::now();
        let report = reconciler.run_once(t0).await.unwrap();
        assert_eq!(report.orphans_closed, 0, "still inside grace");
        assert_eq!(ledger.open_count(), 1);

        let later = t0 + chrono::Duration::seconds(121);
        let report = reconciler.run_once(later).await.unwrap();
        assert_eq!(report.orphans_closed, 1);
        assert_eq!(ledger.open_count(), 0);

        let trades = store.trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, CloseReason::Orphaned);
    }

    #[tokio::test]
    async fn reappearing_position_clears_orphan_mark() {
        let (reconciler, gateway, _store, ledger) = reconciler(120);
        ledger.insert(ledger_position());

        let t0 = Utc::now();
        reconciler.run_once(t0).await.unwrap();
        gateway.seed_position(broker_position());

        let later = t0 + chrono::Duration::seconds(300);
        let report = reconciler.run_once(later).await.unwrap();
        assert_eq!(report.orphans_closed, 0);
        assert_eq!(ledger.open_count(), 1);
    }

    #[tokio::test]
    async fn unpersisted_ledger_position_is_repersisted() {
        // The initial persist failed at execution time: ledger and broker
        // both hold the position, the store does not.
        let (reconciler, gateway, store, ledger) = reconciler(120);
        gateway.seed_position(broker_position());
        let pos = ledger_position();
        let id = pos.id;
        ledger.insert(pos);
        assert!(store.open_positions().await.unwrap().is_empty());

        let report = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.repersisted, 1);
        assert_eq!(report.recovered, 0, "broker and ledger already agree");

        let persisted = store.open_positions().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, id);

        // Idempotent once the store has caught up.
        let second = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(second.repersisted, 0);
    }

    #[tokio::test]
    async fn position_closed_elsewhere_clears_missing_mark() {
        let (reconciler, _gateway, _store, ledger) = reconciler(120);
        let pos = ledger_position();
        let id = pos.id;
        ledger.insert(pos);

        let t0 = Utc::now();
        reconciler.run_once(t0).await.unwrap();
        assert_eq!(reconciler.missing_since.lock().len(), 1);

        // Another closer (monitor exit) takes the position out.
        ledger.begin_close(id);
        ledger.remove(id);

        let later = t0 + chrono::Duration::seconds(300);
        let report = reconciler.run_once(later).await.unwrap();
        assert_eq!(report.orphans_closed, 0);
        assert!(reconciler.missing_since.lock().is_empty());
    }

    #[tokio::test]
    async fn drift_is_logged_not_corrected() {
        let (reconciler, gateway, _store, ledger) = reconciler(120);
        let mut broker_pos = broker_position();
        broker_pos.last_price = dec!(150);
        gateway.seed_position(broker_pos);

        let pos = ledger_position();
        let id = pos.id;
        ledger.insert(pos);

        let report = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.drift_warnings, 1);
        // The monitor owns current_price; reconciliation must not touch it.
        let unchanged = ledger.get(id).unwrap().read().current_price;
        assert_eq!(unchanged, dec!(105));
    }

    #[tokio::test]
    async fn startup_recovery_reloads_persisted_positions() {
        let (reconciler, _gateway, store, ledger) = reconciler(120);
        let pos = ledger_position();
        store.upsert_position(&pos).await.unwrap();

        let recovered = reconciler.recover_from_store().await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(ledger.open_count(), 1);
        assert_eq!(ledger.get(pos.id).unwrap().read().entry_price, dec!(100));
    }

    #[tokio::test]
    async fn unreachable_broker_propagates_error() {
        let (reconciler, gateway, _store, _ledger) = reconciler(120);
        gateway.set_unreachable(true);
        assert!(reconciler.run_once(Utc::now()).await.is_err());
    }
}
