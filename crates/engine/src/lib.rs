//! Scheduler and control loops: the trading engine context, the actor
//! that runs its cooperating tasks, and loop liveness tracking.

pub mod engine;
pub mod heartbeat;
pub mod scheduler;

pub use engine::TradingEngine;
pub use heartbeat::{Health, Heartbeats};
pub use scheduler::{spawn_engine, EngineCommand, EngineHandle};
