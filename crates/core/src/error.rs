//! Error taxonomy: expected rejections, execution failures, and the
//! transient-failure classification that drives loop backoff.

use std::time::Duration;
use thiserror::Error;

/// Why admission control rejected a signal. These are expected outcomes,
/// recorded with the signal's telemetry rather than raised as errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("circuit breaker triggered: {0}")]
    CircuitBreaker(String),
    #[error("max positions reached: {open} >= {max}")]
    MaxPositions { open: usize, max: usize },
    #[error("insufficient capital: need {required}, have {available}")]
    InsufficientCapital { required: String, available: String },
    #[error("outside trading window")]
    OutsideTradingWindow,
    #[error("daily loss limit breached: {loss} >= {limit}")]
    DailyLossLimit { loss: String, limit: String },
}

/// Failure in the execution path. The ledger is left unchanged when the
/// broker rejects or times out.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("duplicate signal within de-duplication window")]
    Duplicate,
    #[error("broker rejected order: {0}")]
    BrokerRejected(String),
    #[error("position {0} not found or already closing")]
    PositionUnavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Classification of an unhandled loop error, used to pick a backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Storage,
    ResourceExhaustion,
    Unknown,
}

impl FailureKind {
    /// Best-effort classification from the error chain's rendered text.
    /// Unrecognized failures back off conservatively.
    pub fn classify(err: &anyhow::Error) -> Self {
        let text = format!("{err:#}").to_lowercase();
        if ["timeout", "timed out", "connection", "network", "dns", "broken pipe"]
            .iter()
            .any(|needle| text.contains(needle))
        {
            Self::Network
        } else if ["database", "sql", "storage", "pool"]
            .iter()
            .any(|needle| text.contains(needle))
        {
            Self::Storage
        } else if ["too many", "rate limit", "capacity", "exhausted"]
            .iter()
            .any(|needle| text.contains(needle))
        {
            Self::ResourceExhaustion
        } else {
            Self::Unknown
        }
    }

    /// Backoff applied before the owning loop's next iteration.
    pub fn backoff(self) -> Duration {
        match self {
            Self::Network => Duration::from_secs(5),
            Self::Storage => Duration::from_secs(10),
            Self::ResourceExhaustion => Duration::from_secs(30),
            Self::Unknown => Duration::from_secs(15),
        }
    }
}
