//! Risk control: admission checks, sizing, the circuit breaker, and the
//! adaptive threshold controller.

pub mod adaptive;
pub mod breaker;
pub mod manager;

pub use adaptive::{AdaptiveController, RollingStats, VolRegime};
pub use breaker::{BreakerState, CircuitBreaker, TripReason};
pub use manager::{AdmissionContext, RiskManager, SizedOrder};
