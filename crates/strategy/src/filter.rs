//! Threshold filtering and composite ranking of enriched signals.

use std::collections::HashMap;
use tracing::debug;

use opt_trade_core::signal::Signal;
use opt_trade_core::thresholds::RiskThresholds;

const W_STRENGTH: f64 = 0.35;
const W_PROBABILITY: f64 = 0.35;
const W_CONFIDENCE: f64 = 0.15;
const W_STRATEGY: f64 = 0.15;

/// Composite score in [0, 1]. Unknown strategies get a neutral 0.5 weight.
pub fn composite_score(signal: &Signal, weights: &HashMap<String, f64>) -> f64 {
    let strategy_weight = weights.get(&signal.strategy).copied().unwrap_or(0.5);
    W_STRENGTH * signal.strength / 100.0
        + W_PROBABILITY * signal.probability()
        + W_CONFIDENCE * signal.confidence()
        + W_STRATEGY * strategy_weight
}

/// Filter by the adaptive strength threshold, rank by composite score
/// descending, and cap the batch.
///
/// Deterministic given identical inputs: ties break on contract key.
pub fn rank_signals(
    signals: Vec<Signal>,
    thresholds: &RiskThresholds,
    weights: &HashMap<String, f64>,
    cap: usize,
) -> Vec<Signal> {
    let before = signals.len();
    let mut scored: Vec<(f64, Signal)> = signals
        .into_iter()
        .filter(|s| s.strength >= thresholds.min_signal_strength)
        .map(|s| (composite_score(&s, weights), s))
        .collect();

    scored.sort_by(|(a_score, a), (b_score, b)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.contract_key().cmp(&b.contract_key()))
    });
    scored.truncate(cap);

    debug!(
        before,
        after = scored.len(),
        min_strength = thresholds.min_signal_strength,
        "Filtered and ranked signals"
    );
    scored.into_iter().map(|(_, s)| s).collect()
}
