//! Core types, traits, and configuration for the options trading engine.
//!
//! Everything shared across the workspace lives here: the signal and
//! position data model, risk threshold snapshots, the engine event bus
//! types, market-state snapshots, error taxonomy, and config loading.

pub mod config;
pub mod config_loader;
pub mod error;
pub mod events;
pub mod market;
pub mod position;
pub mod signal;
pub mod thresholds;

pub use config::AppConfig;
pub use config_loader::ConfigLoader;
pub use error::{FailureKind, RejectReason};
pub use events::{AlertSeverity, EngineEvent};
pub use market::MarketSnapshot;
pub use position::{CloseReason, Position, PositionStatus, Trade};
pub use signal::{OptionRight, OrderSide, Signal};
pub use thresholds::RiskThresholds;
