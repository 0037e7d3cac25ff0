//! Signal scorer adapter — the single boundary to the external ML service.
//!
//! The adapter validates signals, requests a score, and attaches the
//! result. When the service is unreachable or reports no loaded model, the
//! signal degrades to its own strength as confidence with null provenance;
//! scorer trouble never propagates upward.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use opt_trade_core::market::MarketSnapshot;
use opt_trade_core::signal::{MlScore, Signal};

/// Scorer response: a real score, or an explicit "unavailable" — never a
/// silent default masked as real confidence.
#[derive(Debug, Clone)]
pub enum ScoreOutcome {
    Scored(MlScore),
    Unavailable,
}

#[async_trait]
pub trait SignalScorer: Send + Sync {
    async fn score(&self, signal: &Signal, market: &MarketSnapshot) -> Result<ScoreOutcome>;
}

/// Always-unavailable scorer for paper mode and tests.
pub struct NullScorer;

#[async_trait]
impl SignalScorer for NullScorer {
    async fn score(&self, _signal: &Signal, _market: &MarketSnapshot) -> Result<ScoreOutcome> {
        Ok(ScoreOutcome::Unavailable)
    }
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    symbol: &'a str,
    strategy: &'a str,
    strength: f64,
    strike: String,
    entry_price: String,
    spot: String,
    vix: f64,
    pcr: f64,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    available: bool,
    #[serde(default)]
    probability: f64,
    #[serde(default)]
    confidence: f64,
    model_version: Option<String>,
    model_hash: Option<String>,
    #[serde(default)]
    features: HashMap<String, f64>,
}

/// HTTP client for the external model service.
pub struct HttpScorer {
    client: reqwest::Client,
    url: String,
}

impl HttpScorer {
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(url: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build scorer HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl SignalScorer for HttpScorer {
    async fn score(&self, signal: &Signal, market: &MarketSnapshot) -> Result<ScoreOutcome> {
        let request = ScoreRequest {
            symbol: &signal.symbol,
            strategy: &signal.strategy,
            strength: signal.strength,
            strike: signal.strike.to_string(),
            entry_price: signal.entry_price.to_string(),
            spot: market.spot.to_string(),
            vix: market.vix,
            pcr: market.pcr,
        };
        let response: ScoreResponse = self
            .client
            .post(format!("{}/score", self.url))
            .json(&request)
            .send()
            .await
            .context("Scorer request failed")?
            .error_for_status()
            .context("Scorer returned error status")?
            .json()
            .await
            .context("Scorer response malformed")?;

        if !response.available {
            return Ok(ScoreOutcome::Unavailable);
        }
        Ok(ScoreOutcome::Scored(MlScore {
            probability: response.probability.clamp(0.0, 1.0),
            confidence: response.confidence.clamp(0.0, 1.0),
            model_version: response.model_version,
            model_hash: response.model_hash,
            features: response.features,
        }))
    }
}

/// Enriches a batch: validates, scores, degrades.
pub struct ScorerAdapter {
    scorer: std::sync::Arc<dyn SignalScorer>,
}

impl ScorerAdapter {
    #[must_use]
    pub fn new(scorer: std::sync::Arc<dyn SignalScorer>) -> Self {
        Self { scorer }
    }

    /// Returns the enriched batch. Malformed signals are dropped with a
    /// log entry; scorer failures degrade the signal instead of erroring.
    pub async fn enrich(&self, signals: Vec<Signal>, market: &MarketSnapshot) -> Vec<Signal> {
        let mut enriched = Vec::with_capacity(signals.len());
        for mut signal in signals {
            if let Err(e) = signal.validate() {
                warn!(
                    contract = signal.contract_key(),
                    strategy = signal.strategy,
                    error = %e,
                    "Dropping malformed signal"
                );
                continue;
            }
            match self.scorer.score(&signal, market).await {
                Ok(ScoreOutcome::Scored(ml)) => {
                    signal.ml = Some(ml);
                }
                Ok(ScoreOutcome::Unavailable) => {
                    debug!(
                        contract = signal.contract_key(),
                        "Scorer unavailable, degrading to raw strength"
                    );
                    signal.ml = None;
                }
                Err(e) => {
                    warn!(
                        contract = signal.contract_key(),
                        error = %e,
                        "Scorer call failed, degrading to raw strength"
                    );
                    signal.ml = None;
                }
            }
            enriched.push(signal);
        }
        enriched
    }
}
