//! Persistence for positions and trades.
//!
//! The store is a collaborator, not the source of truth: the ledger is
//! authoritative while the process runs, and the store exists so the
//! ledger can be recovered after a restart and so closed trades survive.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

use opt_trade_core::position::{Position, Trade};

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a position record.
    async fn upsert_position(&self, position: &Position) -> Result<()>;

    /// Delete a position record after it closed.
    async fn delete_position(&self, id: Uuid) -> Result<()>;

    /// All persisted open positions, for ledger recovery at startup and
    /// for reconciliation.
    async fn open_positions(&self) -> Result<Vec<Position>>;

    /// Append an immutable trade record.
    async fn insert_trade(&self, trade: &Trade) -> Result<()>;
}

/// In-memory store for paper mode and tests.
#[derive(Default)]
pub struct MemoryStore {
    positions: Mutex<HashMap<Uuid, Position>>,
    trades: Mutex<Vec<Trade>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn trades(&self) -> Vec<Trade> {
        self.trades.lock().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_position(&self, position: &Position) -> Result<()> {
        self.positions.lock().insert(position.id, position.clone());
        Ok(())
    }

    async fn delete_position(&self, id: Uuid) -> Result<()> {
        self.positions.lock().remove(&id);
        Ok(())
    }

    async fn open_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.lock().values().cloned().collect())
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        self.trades.lock().push(trade.clone());
        Ok(())
    }
}

/// PostgreSQL-backed store. Positions keep their full state as JSONB so
/// the recovered ledger matches the in-memory shape field for field;
/// trades get real columns for ad-hoc performance queries.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and make sure the schema exists.
    ///
    /// # Errors
    /// Returns an error if the connection or schema setup fails.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("failed to connect to database")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS open_positions (
                id UUID PRIMARY KEY,
                contract_key TEXT NOT NULL,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                position_id UUID PRIMARY KEY,
                symbol TEXT NOT NULL,
                contract_key TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity BIGINT NOT NULL,
                entry_price NUMERIC NOT NULL,
                entry_time TIMESTAMPTZ NOT NULL,
                exit_price NUMERIC NOT NULL,
                exit_time TIMESTAMPTZ NOT NULL,
                exit_reason TEXT NOT NULL,
                realized_pnl NUMERIC NOT NULL,
                hold_duration_secs BIGINT NOT NULL,
                strategy TEXT NOT NULL,
                metadata JSONB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_position(&self, position: &Position) -> Result<()> {
        let data = serde_json::to_value(position).context("failed to serialize position")?;
        sqlx::query(
            r#"
            INSERT INTO open_positions (id, contract_key, data, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (id) DO UPDATE SET data = $3, updated_at = now()
            "#,
        )
        .bind(position.id)
        .bind(position.contract_key())
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_position(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM open_positions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT data FROM open_positions")
            .fetch_all(&self.pool)
            .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.try_get("data")?;
            let position =
                serde_json::from_value(data).context("failed to deserialize stored position")?;
            positions.push(position);
        }
        Ok(positions)
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        let metadata = serde_json::to_value(&trade.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO trades
                (position_id, symbol, contract_key, side, quantity, entry_price, entry_time,
                 exit_price, exit_time, exit_reason, realized_pnl, hold_duration_secs,
                 strategy, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (position_id) DO NOTHING
            "#,
        )
        .bind(trade.position_id)
        .bind(&trade.symbol)
        .bind(format!("{} {}{}", trade.symbol, trade.strike, trade.right))
        .bind(format!("{:?}", trade.side).to_lowercase())
        .bind(trade.quantity)
        .bind(trade.entry_price)
        .bind(trade.entry_time)
        .bind(trade.exit_price)
        .bind(trade.exit_time)
        .bind(trade.exit_reason.to_string())
        .bind(trade.realized_pnl)
        .bind(trade.hold_duration_secs)
        .bind(&trade.strategy)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use opt_trade_core::market::Greeks;
    use opt_trade_core::position::{CloseReason, PositionStatus};
    use opt_trade_core::signal::{OptionRight, OrderSide};
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "NIFTY".to_string(),
            right: OptionRight::Put,
            strike: dec!(24500),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 24).unwrap(),
            side: OrderSide::Sell,
            quantity: 50,
            entry_price: dec!(100),
            entry_time: Utc::now(),
            current_price: dec!(96),
            stop_loss: dec!(118),
            target: dec!(64),
            trailing_stop: Some(dec!(103)),
            strategy: "short_strangle".to_string(),
            entry_greeks: Greeks::default(),
            metadata: HashMap::new(),
            status: PositionStatus::Open,
        }
    }

    #[tokio::test]
    async fn memory_store_recovers_positions() {
        let store = MemoryStore::new();
        let pos = position();
        let id = pos.id;
        store.upsert_position(&pos).await.unwrap();

        let recovered = store.open_positions().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, id);
        assert_eq!(recovered[0].trailing_stop, Some(dec!(103)));

        store.delete_position(id).await.unwrap();
        assert!(store.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_keeps_trades() {
        let store = MemoryStore::new();
        let trade = position().into_trade(dec!(80), CloseReason::Target, Utc::now());
        store.insert_trade(&trade).await.unwrap();
        assert_eq!(store.trades().len(), 1);
        assert_eq!(store.trades()[0].realized_pnl, dec!(1000));
    }

    #[test]
    fn position_serde_round_trip_preserves_fields() {
        let pos = position();
        let json = serde_json::to_value(&pos).unwrap();
        let back: Position = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, pos.id);
        assert_eq!(back.entry_price, pos.entry_price);
        assert_eq!(back.trailing_stop, pos.trailing_stop);
        assert_eq!(back.status, pos.status);
    }
}
