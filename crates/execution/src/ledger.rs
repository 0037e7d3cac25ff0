//! In-memory authoritative position ledger.
//!
//! Two writers mutate it: the order executor (insert/remove) and the
//! monitoring loop (field-level price and trailing-stop updates). Each
//! position carries its own lock so a close racing a mark-to-market
//! update is serialized per id, never lost.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use opt_trade_core::position::{Position, PositionStatus};

#[derive(Default)]
pub struct PositionLedger {
    positions: RwLock<HashMap<Uuid, Arc<RwLock<Position>>>>,
}

impl PositionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, position: Position) {
        let id = position.id;
        debug!(position_id = %id, contract = position.contract_key(), "Ledger insert");
        self.positions
            .write()
            .insert(id, Arc::new(RwLock::new(position)));
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<RwLock<Position>>> {
        self.positions.read().get(&id).cloned()
    }

    #[must_use]
    pub fn contains_contract(&self, contract_key: &str) -> bool {
        self.positions
            .read()
            .values()
            .any(|p| p.read().contract_key() == contract_key)
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.positions.read().len()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<Uuid> {
        self.positions.read().keys().copied().collect()
    }

    /// Point-in-time clones of every position. Used for reporting and
    /// reconciliation, never for mutation.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .map(|p| p.read().clone())
            .collect()
    }

    /// Run `f` against the position under its write lock.
    pub fn with_position<T>(&self, id: Uuid, f: impl FnOnce(&mut Position) -> T) -> Option<T> {
        let entry = self.get(id)?;
        let mut position = entry.write();
        Some(f(&mut position))
    }

    /// Claim a position for closing.
    ///
    /// Flips `Open -> Closing` under the position lock and returns a
    /// frozen clone. Returns `None` if the id is unknown or another
    /// caller already claimed it; at most one caller ever gets a clone,
    /// which is what makes the close path exactly-once.
    pub fn begin_close(&self, id: Uuid) -> Option<Position> {
        let entry = self.get(id)?;
        let mut position = entry.write();
        if position.status == PositionStatus::Closing {
            return None;
        }
        position.status = PositionStatus::Closing;
        Some(position.clone())
    }

    /// Remove a position, returning its final state.
    pub fn remove(&self, id: Uuid) -> Option<Position> {
        let entry = self.positions.write().remove(&id)?;
        let position = entry.read().clone();
        debug!(position_id = %id, "Ledger remove");
        Some(position)
    }
}
