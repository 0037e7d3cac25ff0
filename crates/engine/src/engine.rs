//! The trading engine context.
//!
//! One `TradingEngine` owns every shared component — ledger, breaker,
//! thresholds, market cache — and is passed (as an `Arc`) to each control
//! loop. There is no process-wide singleton state; everything flows
//! through this struct.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use opt_trade_broker::gateway::{BrokerGateway, MarketDataProvider};
use opt_trade_core::config::AppConfig;
use opt_trade_core::events::{AlertSeverity, EngineEvent};
use opt_trade_core::market::{Greeks, MarketSnapshot};
use opt_trade_core::position::{CloseReason, Position, Trade};
use opt_trade_core::signal::{OptionRight, OrderSide, Signal};
use opt_trade_core::thresholds::RiskThresholds;
use opt_trade_execution::executor::{ExecutionResult, OrderExecutor, OrderPlan};
use opt_trade_execution::ledger::PositionLedger;
use opt_trade_execution::reconcile::Reconciler;
use opt_trade_risk::adaptive::{AdaptiveController, RollingStats};
use opt_trade_risk::breaker::{CircuitBreaker, TripReason};
use opt_trade_risk::manager::{AdmissionContext, RiskManager};
use opt_trade_strategy::filter::rank_signals;
use opt_trade_strategy::scorer::ScorerAdapter;
use opt_trade_strategy::selector::StrategySelector;

use crate::heartbeat::Heartbeats;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Per-session accumulators, reset at rollover.
struct SessionDay {
    date: NaiveDate,
    realized_pnl: Decimal,
    /// Malformed positions the monitor refuses to touch.
    skipped: Vec<Uuid>,
}

pub struct TradingEngine {
    pub config: AppConfig,
    gateway: Arc<dyn BrokerGateway>,
    market_data: Arc<dyn MarketDataProvider>,
    selector: StrategySelector,
    scorer: ScorerAdapter,
    risk: RiskManager,
    pub breaker: Arc<CircuitBreaker>,
    thresholds: watch::Receiver<RiskThresholds>,
    adaptive: AdaptiveController,
    pub ledger: Arc<PositionLedger>,
    executor: OrderExecutor,
    reconciler: Reconciler,
    stats: Mutex<RollingStats>,
    market: RwLock<Option<MarketSnapshot>>,
    events: broadcast::Sender<EngineEvent>,
    pub heartbeats: Heartbeats,
    day: Mutex<SessionDay>,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: AppConfig,
        gateway: Arc<dyn BrokerGateway>,
        market_data: Arc<dyn MarketDataProvider>,
        selector: StrategySelector,
        scorer: ScorerAdapter,
        risk: RiskManager,
        breaker: Arc<CircuitBreaker>,
        thresholds: watch::Receiver<RiskThresholds>,
        adaptive: AdaptiveController,
        ledger: Arc<PositionLedger>,
        executor: OrderExecutor,
        reconciler: Reconciler,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            gateway,
            market_data,
            selector,
            scorer,
            risk,
            breaker,
            thresholds,
            adaptive,
            ledger,
            executor,
            reconciler,
            stats: Mutex::new(RollingStats::new()),
            market: RwLock::new(None),
            events,
            heartbeats: Heartbeats::new(),
            day: Mutex::new(SessionDay {
                date: Utc::now().date_naive(),
                realized_pnl: Decimal::ZERO,
                skipped: Vec::new(),
            }),
        }
    }

    /// Subscribe to engine events. Best-effort delivery: a lagging
    /// consumer drops messages, never blocks a loop.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        // Err just means nobody is listening right now.
        let _ = self.events.send(event);
    }

    /// Startup: reload persisted open positions into the ledger.
    pub async fn recover(&self) -> Result<()> {
        let recovered = self.reconciler.recover_from_store().await?;
        if recovered > 0 {
            info!(recovered, "Ledger recovered from storage");
        }
        Ok(())
    }

    // ---- market-data refresh loop -------------------------------------

    /// Refresh the shared market cache and run the market-level breaker
    /// checks.
    pub async fn refresh_market(&self) -> Result<()> {
        let snapshot = self
            .market_data
            .snapshot(&self.config.engine.symbol)
            .await?;

        self.emit(EngineEvent::MarketCondition {
            symbol: snapshot.symbol.clone(),
            spot: snapshot.spot,
            vix: snapshot.vix,
            pcr: snapshot.pcr,
            timestamp: snapshot.captured_at,
        });

        if snapshot.vix >= self.config.risk.vix_hard_threshold {
            self.trip_and_announce(TripReason::VixSpike {
                vix: snapshot.vix,
                threshold: self.config.risk.vix_hard_threshold,
            });
        }
        if let Some(&severity) = snapshot.indicators.get("reversal") {
            if severity >= self.config.risk.reversal_severity_threshold {
                self.trip_and_announce(TripReason::Reversal {
                    detail: format!("severity {severity:.2}"),
                });
            }
        }

        *self.market.write() = Some(snapshot);
        Ok(())
    }

    fn trip_and_announce(&self, reason: TripReason) {
        if self.breaker.trip(reason.clone()) {
            self.emit(EngineEvent::CircuitBreaker {
                triggered: true,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
            self.emit(EngineEvent::Alert {
                severity: AlertSeverity::Critical,
                message: format!("circuit breaker: {reason}"),
                timestamp: Utc::now(),
            });
        }
    }

    /// Adaptive refresh cadence: tight while positions are open or
    /// volatility is elevated, relaxed otherwise, slowest off-hours.
    #[must_use]
    pub fn refresh_interval(&self, now: DateTime<Utc>) -> std::time::Duration {
        let engine = &self.config.engine;
        let session = &self.config.session;
        let time = now.time();
        if time < session.open || time >= session.close {
            return std::time::Duration::from_secs(engine.refresh_max_secs);
        }
        let vix = self
            .market
            .read()
            .as_ref()
            .map_or(0.0, |snapshot| snapshot.vix);
        if self.ledger.open_count() > 0 || vix >= self.config.risk.vix_high {
            std::time::Duration::from_secs(engine.refresh_min_secs)
        } else {
            std::time::Duration::from_secs(engine.refresh_max_secs)
        }
    }

    // ---- trading cycle -------------------------------------------------

    /// One trading cycle: select, score, rank, admit, execute. Candidates
    /// run in ranked order and capital/count checks see admissions already
    /// made earlier in the same batch.
    pub async fn trading_cycle(&self, now: DateTime<Utc>) -> Result<()> {
        if self.breaker.is_triggered() {
            debug!("Trading cycle skipped, circuit breaker triggered");
            return Ok(());
        }

        let Some(snapshot) = self.market.read().clone() else {
            debug!("Trading cycle skipped, no market snapshot yet");
            return Ok(());
        };
        if snapshot.is_stale(self.config.engine.market_stale_secs, now) {
            info!(
                captured_at = %snapshot.captured_at,
                "Market snapshot stale, treating as no signal"
            );
            return Ok(());
        }

        let raw = self.selector.generate(&snapshot, now);
        if raw.is_empty() {
            return Ok(());
        }
        let enriched = self.scorer.enrich(raw, &snapshot).await;
        let ranked = rank_signals(
            enriched,
            &self.thresholds.borrow().clone(),
            &self.config.strategy.weights,
            self.config.strategy.max_ranked,
        );

        let equity = self.equity();
        let daily_pnl = self.daily_pnl();

        for signal in ranked {
            // Skip contracts we already hold; averaging in is not a goal.
            if self.ledger.contains_contract(&signal.contract_key()) {
                debug!(contract = signal.contract_key(), "Contract already held");
                continue;
            }

            let sized = self.risk.size_and_targets(&signal, equity, snapshot.vix);
            // Count and margin are read live so earlier admissions in
            // this same batch are already reflected.
            let ctx = AdmissionContext {
                open_positions: self.ledger.open_count(),
                available_capital: equity - self.margin_in_use(),
                daily_pnl,
                now: now.time(),
            };

            match self.risk.can_admit(&signal, sized.required_margin, &ctx) {
                Ok(()) => self.stats.lock().record_admission(true),
                Err(reason) => {
                    info!(
                        contract = signal.contract_key(),
                        reason = %reason,
                        "Signal rejected"
                    );
                    self.stats.lock().record_admission(false);
                    continue;
                }
            }

            let plan = OrderPlan {
                entry_greeks: entry_greeks(&snapshot, &signal),
                quantity: sized.quantity,
                stop_loss: sized.stop_loss,
                target: sized.target,
                signal,
            };
            match self.executor.execute(&plan).await {
                ExecutionResult::Filled { position_id } => {
                    self.emit(EngineEvent::PositionOpened {
                        position_id,
                        contract: plan.signal.contract_key(),
                        quantity: plan.quantity,
                        entry_price: plan.signal.entry_price,
                        timestamp: Utc::now(),
                    });
                }
                ExecutionResult::Duplicate => {}
                ExecutionResult::Failed { reason } => {
                    self.emit(EngineEvent::Alert {
                        severity: AlertSeverity::Warning,
                        message: format!(
                            "execution failed for {}: {reason}",
                            plan.signal.contract_key()
                        ),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
        Ok(())
    }

    // ---- risk/position monitor ----------------------------------------

    /// One monitor pass: session rollover, re-pricing, exit checks, EOD
    /// forced liquidation, daily-loss hard stop.
    pub async fn monitor_once(&self, now: DateTime<Utc>) -> Result<()> {
        self.roll_session(now);

        let positions = self.ledger.snapshot();
        if positions.is_empty() {
            return Ok(());
        }

        let (well_formed, malformed): (Vec<_>, Vec<_>) =
            positions.into_iter().partition(Position::is_well_formed);
        for position in malformed {
            let mut day = self.day.lock();
            if !day.skipped.contains(&position.id) {
                warn!(
                    position_id = %position.id,
                    quantity = position.quantity,
                    entry = %position.entry_price,
                    "Malformed position routed to skipped list"
                );
                day.skipped.push(position.id);
            }
        }

        self.reprice(&well_formed).await;

        let daily_pnl = self.daily_pnl();
        let realized = self.day.lock().realized_pnl;
        self.emit(EngineEvent::PnlUpdate {
            daily_realized: realized,
            open_unrealized: daily_pnl - realized,
            timestamp: now,
        });

        let loss_limit =
            self.config.risk.initial_capital * self.config.risk.daily_loss_limit_pct;
        if -daily_pnl >= loss_limit && !self.breaker.is_triggered() {
            self.breaker.trip(TripReason::DailyLossLimit);
            self.emit(EngineEvent::CircuitBreaker {
                triggered: true,
                reason: TripReason::DailyLossLimit.to_string(),
                timestamp: now,
            });
            self.emit(EngineEvent::Alert {
                severity: AlertSeverity::Critical,
                message: format!("daily loss limit breached: {daily_pnl} vs -{loss_limit}"),
                timestamp: now,
            });
            self.close_all(CloseReason::DailyLossLimit).await;
            return Ok(());
        }

        if self.risk.should_exit_eod(now.time()) {
            self.liquidate_eod(&well_formed).await;
            return Ok(());
        }

        for position in &well_formed {
            let current = match self.ledger.get(position.id) {
                Some(entry) => entry.read().clone(),
                None => continue,
            };
            if let Some(reason) = self.risk.should_exit(&current) {
                self.close_position(current.id, reason).await;
            }
        }
        Ok(())
    }

    fn roll_session(&self, now: DateTime<Utc>) {
        let today = now.date_naive();
        let mut day = self.day.lock();
        if day.date != today {
            info!(from = %day.date, to = %today, "Session rollover");
            day.date = today;
            day.realized_pnl = Decimal::ZERO;
            day.skipped.clear();
            self.stats.lock().reset();
            if self.breaker.reset() {
                self.emit(EngineEvent::CircuitBreaker {
                    triggered: false,
                    reason: "session rollover".to_string(),
                    timestamp: now,
                });
            }
        }
    }

    async fn reprice(&self, positions: &[Position]) {
        let keys: Vec<String> = positions.iter().map(Position::contract_key).collect();
        let prices: HashMap<String, Decimal> = match self.gateway.last_prices(&keys).await {
            Ok(prices) => prices,
            Err(e) => {
                warn!(error = %e, "Price fetch failed, marks kept");
                return;
            }
        };
        for position in positions {
            let Some(price) = prices.get(&position.contract_key()).copied() else {
                continue;
            };
            let updated = self.ledger.with_position(position.id, |p| {
                self.risk.update_mark_to_market(p, price);
                (p.current_price, p.unrealized_pnl())
            });
            if let Some((current_price, unrealized_pnl)) = updated {
                self.emit(EngineEvent::PositionUpdated {
                    position_id: position.id,
                    current_price,
                    unrealized_pnl,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Forced end-of-day liquidation. Malformed entries were already
    /// routed to the skipped list, so a bad position cannot take down
    /// the pass.
    async fn liquidate_eod(&self, well_formed: &[Position]) {
        if well_formed.is_empty() {
            return;
        }
        info!(count = well_formed.len(), "Forced end-of-day liquidation");
        for position in well_formed {
            self.close_position(position.id, CloseReason::EndOfDay).await;
        }
    }

    /// Best-effort closure of everything in the ledger.
    pub async fn close_all(&self, reason: CloseReason) {
        for id in self.ledger.ids() {
            self.close_position(id, reason).await;
        }
    }

    async fn close_position(&self, id: Uuid, reason: CloseReason) -> Option<Trade> {
        match self.executor.close(id, reason).await {
            Ok(trade) => {
                {
                    let mut day = self.day.lock();
                    day.realized_pnl += trade.realized_pnl;
                }
                self.stats.lock().record_trade(trade.is_win());
                self.emit(EngineEvent::PositionClosed {
                    position_id: id,
                    reason,
                    realized_pnl: trade.realized_pnl,
                    timestamp: trade.exit_time,
                });
                Some(trade)
            }
            Err(e) => {
                // Usually a benign race with another closer.
                debug!(position_id = %id, error = %e, "Close skipped");
                None
            }
        }
    }

    // ---- reconcile + adaptive cadences --------------------------------

    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<()> {
        let report = self.reconciler.run_once(now).await?;
        if report != Default::default() {
            info!(
                recovered = report.recovered,
                orphans_closed = report.orphans_closed,
                repersisted = report.repersisted,
                drift_warnings = report.drift_warnings,
                "Reconciliation pass applied corrections"
            );
        }
        Ok(())
    }

    pub fn adjust_thresholds(&self) {
        let vix = self
            .market
            .read()
            .as_ref()
            .map_or(0.0, |snapshot| snapshot.vix);
        let stats = self.stats.lock();
        self.adaptive.recompute(vix, &stats);

        // Watchdog limits ride along in the thresholds snapshot; breaching
        // one raises an alert but never trips the breaker by itself.
        let limits = self.thresholds.borrow().clone();
        let streak = stats.loss_streak();
        if streak >= limits.max_loss_streak {
            warn!(streak, limit = limits.max_loss_streak, "Loss-streak watchdog limit hit");
            self.emit(EngineEvent::Alert {
                severity: AlertSeverity::Warning,
                message: format!(
                    "loss streak {streak} at or above limit {}",
                    limits.max_loss_streak
                ),
                timestamp: Utc::now(),
            });
        }
        if stats.sample_size() >= self.config.adaptive.min_sample {
            if let Some(rate) = stats.win_rate() {
                if rate < limits.min_win_rate {
                    warn!(
                        win_rate = format!("{rate:.2}"),
                        floor = limits.min_win_rate,
                        "Win-rate watchdog floor breached"
                    );
                    self.emit(EngineEvent::Alert {
                        severity: AlertSeverity::Warning,
                        message: format!(
                            "win rate {rate:.2} below watchdog floor {:.2}",
                            limits.min_win_rate
                        ),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    // ---- accounting ----------------------------------------------------

    /// Session equity: starting capital plus realized P&L.
    #[must_use]
    pub fn equity(&self) -> Decimal {
        self.config.risk.initial_capital + self.day.lock().realized_pnl
    }

    fn margin_in_use(&self) -> Decimal {
        self.ledger
            .snapshot()
            .iter()
            .map(|p| {
                let notional = p.entry_price * Decimal::from(p.quantity);
                match p.side {
                    OrderSide::Buy => notional,
                    OrderSide::Sell => notional * self.config.risk.short_margin_multiple,
                }
            })
            .sum()
    }

    /// Realized plus open unrealized P&L for the session.
    #[must_use]
    pub fn daily_pnl(&self) -> Decimal {
        let unrealized: Decimal = self
            .ledger
            .snapshot()
            .iter()
            .filter(|p| p.is_well_formed())
            .map(Position::unrealized_pnl)
            .sum();
        self.day.lock().realized_pnl + unrealized
    }
}

fn entry_greeks(snapshot: &MarketSnapshot, signal: &Signal) -> Greeks {
    let book = match signal.right {
        OptionRight::Call => &snapshot.chain.calls,
        OptionRight::Put => &snapshot.chain.puts,
    };
    book.get(&signal.strike)
        .map(|quote| quote.greeks)
        .unwrap_or_default()
}
