//! Typed application configuration with serde defaults.

use chrono::NaiveTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub symbol: String,
    /// Trading-cycle cadence (strategy → score → filter → admit → execute).
    pub cycle_interval_secs: u64,
    /// Risk/position monitoring cadence.
    pub monitor_interval_secs: u64,
    /// Market-data refresh bounds; the actual interval adapts between them.
    pub refresh_min_secs: u64,
    pub refresh_max_secs: u64,
    /// Snapshot older than this is treated as "no data" by the cycle.
    pub market_stale_secs: i64,
    /// Bounded grace period for best-effort shutdown work.
    pub shutdown_grace_secs: u64,
    /// A loop heartbeat older than this marks the loop as stalled.
    pub heartbeat_stale_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "NIFTY".to_string(),
            cycle_interval_secs: 300,
            monitor_interval_secs: 5,
            refresh_min_secs: 15,
            refresh_max_secs: 120,
            market_stale_secs: 90,
            shutdown_grace_secs: 30,
            heartbeat_stale_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// Long-volatility strategies are gated out for this many minutes
    /// after the open.
    pub opening_gate_minutes: i64,
    /// Hour (0-23) after which long-volatility strategies are swapped for
    /// the short-premium fallback.
    pub long_vol_cutoff_hour: u32,
    /// All open positions are force-closed at/after this time.
    pub forced_exit: NaiveTime,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            opening_gate_minutes: 15,
            long_vol_cutoff_hour: 14,
            forced_exit: NaiveTime::from_hms_opt(15, 10, 0).unwrap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub initial_capital: Decimal,
    /// Daily realized+unrealized loss limit as a fraction of capital.
    pub daily_loss_limit_pct: Decimal,
    /// VIX-scaled stop-loss fraction bounds.
    pub stop_loss_min_pct: Decimal,
    pub stop_loss_max_pct: Decimal,
    /// VIX levels mapped to the stop bounds above.
    pub vix_low: f64,
    pub vix_high: f64,
    /// VIX at/above this trips the circuit breaker outright.
    pub vix_hard_threshold: f64,
    /// Provider "reversal" indicator at/above this trips the breaker.
    pub reversal_severity_threshold: f64,
    /// Final target = stop distance × this multiple.
    pub reward_multiple: Decimal,
    /// Trailing stop distance as a fraction of the mark.
    pub trailing_stop_pct: Decimal,
    /// Margin multiple applied to short-premium notional.
    pub short_margin_multiple: Decimal,
    /// Duplicate-execution detection window.
    pub dedup_window_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(500000),
            daily_loss_limit_pct: dec!(0.03),
            stop_loss_min_pct: dec!(0.15),
            stop_loss_max_pct: dec!(0.24),
            vix_low: 12.0,
            vix_high: 28.0,
            vix_hard_threshold: 32.0,
            reversal_severity_threshold: 0.8,
            reward_multiple: dec!(2),
            trailing_stop_pct: dec!(0.08),
            short_margin_multiple: dec!(1.5),
            dedup_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Rotation order of strategy variants.
    pub variants: Vec<String>,
    /// Every Nth cycle picks the next-best variant instead of the
    /// rotation choice (deterministic exploration). 0 disables.
    pub explore_every: u64,
    /// Substituted for long-volatility variants after the cutoff hour.
    /// Empty string disables substitution (selector returns no signals).
    pub short_premium_fallback: String,
    /// Per-strategy ensemble weight used in composite ranking.
    pub weights: std::collections::HashMap<String, f64>,
    /// Ranked result-set cap per cycle.
    pub max_ranked: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        let mut weights = std::collections::HashMap::new();
        weights.insert("directional_momentum".to_string(), 0.8);
        weights.insert("straddle".to_string(), 0.7);
        weights.insert("short_strangle".to_string(), 0.9);
        Self {
            variants: vec![
                "directional_momentum".to_string(),
                "straddle".to_string(),
                "short_strangle".to_string(),
            ],
            explore_every: 7,
            short_premium_fallback: "short_strangle".to_string(),
            weights,
            max_ranked: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Base URL of the external scoring service. `None` runs degraded.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL. `None` uses the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// A ledger position missing at the broker for longer than this is
    /// treated as orphaned and force-closed.
    pub orphan_grace_secs: u64,
    /// Price drift above this fraction is logged, never auto-corrected.
    pub price_tolerance_pct: Decimal,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            orphan_grace_secs: 120,
            price_tolerance_pct: dec!(0.05),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub interval_secs: u64,
    /// Minimum closed trades + scored signals before any adjustment.
    pub min_sample: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            min_sample: 10,
        }
    }
}
