//! Candidate trade signals and their ML enrichment.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Options contract right (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "C"),
            Self::Put => write!(f, "P"),
        }
    }
}

/// Order side. `Sell` opens a short-premium position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Scorer output attached to a signal by the scorer adapter.
///
/// `probability` and `confidence` are in [0, 1]. Provenance fields identify
/// the exact model that produced them; they are `None` when the scorer was
/// unavailable and the adapter degraded to the signal's own strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlScore {
    pub probability: f64,
    pub confidence: f64,
    pub model_version: Option<String>,
    pub model_hash: Option<String>,
    #[serde(default)]
    pub features: HashMap<String, f64>,
}

/// A proposed trade produced by the strategy selector.
///
/// Signals are transient: they flow through scoring, filtering, and
/// admission, and are discarded after the admission decision. Only the
/// outcome is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub right: OptionRight,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub side: OrderSide,
    pub entry_price: Decimal,
    pub strategy: String,
    /// Raw strategy strength, 0-100.
    pub strength: f64,
    pub created_at: DateTime<Utc>,
    pub ml: Option<MlScore>,
}

/// Validation failures for malformed signals. These are dropped with a log
/// entry, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("empty symbol")]
    EmptySymbol,
    #[error("non-positive strike: {0}")]
    NonPositiveStrike(String),
    #[error("non-positive entry price: {0}")]
    NonPositiveEntry(String),
    #[error("strength out of range: {0}")]
    StrengthOutOfRange(String),
}

impl Signal {
    /// Contract identity, shared with positions (e.g., "NIFTY 24800C").
    pub fn contract_key(&self) -> String {
        format!("{} {}{}", self.symbol, self.strike, self.right)
    }

    /// Shape check applied at the scorer-adapter boundary.
    ///
    /// # Errors
    /// Returns the first failing check.
    pub fn validate(&self) -> Result<(), SignalError> {
        if self.symbol.trim().is_empty() {
            return Err(SignalError::EmptySymbol);
        }
        if self.strike <= Decimal::ZERO {
            return Err(SignalError::NonPositiveStrike(self.strike.to_string()));
        }
        if self.entry_price <= Decimal::ZERO {
            return Err(SignalError::NonPositiveEntry(self.entry_price.to_string()));
        }
        if !(0.0..=100.0).contains(&self.strength) {
            return Err(SignalError::StrengthOutOfRange(self.strength.to_string()));
        }
        Ok(())
    }

    /// ML probability, falling back to strength/100 when unscored.
    pub fn probability(&self) -> f64 {
        self.ml
            .as_ref()
            .map_or(self.strength / 100.0, |ml| ml.probability)
    }

    /// ML confidence, falling back to strength/100 when unscored.
    pub fn confidence(&self) -> f64 {
        self.ml
            .as_ref()
            .map_or(self.strength / 100.0, |ml| ml.confidence)
    }
}
