//! Strategy selection, scoring, and signal ranking.
//!
//! The selector turns a market snapshot into raw candidate signals, the
//! scorer adapter enriches them against the external ML service (degrading
//! gracefully when it is down), and the filter ranks and caps the batch.

pub mod filter;
pub mod scorer;
pub mod selector;

pub use filter::rank_signals;
pub use scorer::{HttpScorer, NullScorer, ScoreOutcome, ScorerAdapter, SignalScorer};
pub use selector::{StrategyClass, StrategySelector};
