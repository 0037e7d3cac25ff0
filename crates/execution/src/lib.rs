//! Order execution and position lifecycle: the authoritative in-memory
//! ledger, the idempotent order executor, persistence, and the
//! reconciliation job.

pub mod executor;
pub mod ledger;
pub mod reconcile;
pub mod store;

pub use executor::{ExecutionResult, OrderExecutor, OrderPlan};
pub use ledger::PositionLedger;
pub use reconcile::Reconciler;
pub use store::{MemoryStore, PgStore, Store};
