//! The engine actor: owns the control loops and processes commands.
//!
//! Five loops run concurrently once started: trading cycle, market-data
//! refresh, risk/position monitor, reconciliation, and the adaptive
//! threshold controller. An error inside one iteration is classified and
//! backed off; it never stops a sibling loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use opt_trade_core::error::FailureKind;
use opt_trade_core::position::CloseReason;

use crate::engine::TradingEngine;
use crate::heartbeat::Health;

const TRADING: &str = "trading";
const REFRESH: &str = "refresh";
const MONITOR: &str = "monitor";
const RECONCILE: &str = "reconcile";
const ADAPTIVE: &str = "adaptive";

pub enum EngineCommand {
    Start,
    Stop,
    GetHealth(oneshot::Sender<Health>),
    Shutdown,
}

/// Cloneable handle to the engine actor.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<EngineCommand>) -> Self {
        Self { tx }
    }

    /// # Errors
    /// Returns an error if the actor has shut down.
    pub async fn start(&self) -> Result<()> {
        self.tx.send(EngineCommand::Start).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the actor has shut down.
    pub async fn stop(&self) -> Result<()> {
        self.tx.send(EngineCommand::Stop).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the actor has shut down or dropped the reply.
    pub async fn health(&self) -> Result<Health> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(EngineCommand::GetHealth(tx)).await?;
        Ok(rx.await?)
    }

    /// # Errors
    /// Returns an error if the actor has already shut down.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(EngineCommand::Shutdown).await?;
        Ok(())
    }
}

/// Spawn the engine actor; the returned handle controls it.
pub fn spawn_engine(engine: Arc<TradingEngine>) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let actor = EngineActor {
        engine,
        rx,
        running: false,
        shutdown_tx: None,
        tasks: Vec::new(),
    };
    let join = tokio::spawn(actor.run());
    (EngineHandle::new(tx), join)
}

struct EngineActor {
    engine: Arc<TradingEngine>,
    rx: mpsc::Receiver<EngineCommand>,
    running: bool,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineActor {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                EngineCommand::Start => self.start().await,
                EngineCommand::Stop => self.stop().await,
                EngineCommand::GetHealth(reply) => {
                    let health = self.engine.heartbeats.health(
                        self.running,
                        self.engine.config.engine.heartbeat_stale_secs,
                        Utc::now(),
                    );
                    let _ = reply.send(health);
                }
                EngineCommand::Shutdown => {
                    self.stop().await;
                    break;
                }
            }
        }
        // Dropped handle counts as shutdown.
        if self.running {
            self.stop().await;
        }
        info!("Engine actor terminated");
    }

    async fn start(&mut self) {
        if self.running {
            return;
        }
        if let Err(e) = self.engine.recover().await {
            warn!(error = %e, "Startup ledger recovery failed, continuing with empty ledger");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.tasks = vec![
            tokio::spawn(trading_loop(self.engine.clone(), shutdown_rx.clone())),
            tokio::spawn(refresh_loop(self.engine.clone(), shutdown_rx.clone())),
            tokio::spawn(monitor_loop(self.engine.clone(), shutdown_rx.clone())),
            tokio::spawn(reconcile_loop(self.engine.clone(), shutdown_rx.clone())),
            tokio::spawn(adaptive_loop(self.engine.clone(), shutdown_rx)),
        ];
        self.shutdown_tx = Some(shutdown_tx);
        self.running = true;
        info!("Engine started");
    }

    /// Stop admissions, then best-effort close of all open positions
    /// within the configured grace period. A failed close is logged, not
    /// retried; the actor always finishes stopping.
    async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        info!("Engine stopping");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        let grace = Duration::from_secs(self.engine.config.engine.shutdown_grace_secs);

        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Control loops did not stop within grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        if tokio::time::timeout(grace, self.engine.close_all(CloseReason::Shutdown))
            .await
            .is_err()
        {
            error!("Best-effort close-all did not finish within grace period");
        }
        info!("Engine stopped");
    }
}

/// Sleep that wakes early on shutdown. Returns false when stopping.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

fn backoff_for(task: &'static str, err: &anyhow::Error) -> Duration {
    let kind = FailureKind::classify(err);
    warn!(task, error = %err, kind = ?kind, "Loop iteration failed, backing off");
    kind.backoff()
}

async fn trading_loop(engine: Arc<TradingEngine>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(engine.config.engine.cycle_interval_secs);
    loop {
        engine.heartbeats.beat(TRADING);
        let wait = match engine.trading_cycle(Utc::now()).await {
            Ok(()) => interval,
            Err(e) => backoff_for(TRADING, &e),
        };
        if !pause(&mut shutdown, wait).await {
            break;
        }
    }
    info!(task = TRADING, "Loop stopped");
}

async fn refresh_loop(engine: Arc<TradingEngine>, mut shutdown: watch::Receiver<bool>) {
    loop {
        engine.heartbeats.beat(REFRESH);
        let wait = match engine.refresh_market().await {
            Ok(()) => engine.refresh_interval(Utc::now()),
            Err(e) => backoff_for(REFRESH, &e),
        };
        if !pause(&mut shutdown, wait).await {
            break;
        }
    }
    info!(task = REFRESH, "Loop stopped");
}

async fn monitor_loop(engine: Arc<TradingEngine>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(engine.config.engine.monitor_interval_secs);
    loop {
        engine.heartbeats.beat(MONITOR);
        let wait = match engine.monitor_once(Utc::now()).await {
            Ok(()) => interval,
            Err(e) => backoff_for(MONITOR, &e),
        };
        if !pause(&mut shutdown, wait).await {
            break;
        }
    }
    info!(task = MONITOR, "Loop stopped");
}

async fn reconcile_loop(engine: Arc<TradingEngine>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(engine.config.reconcile.interval_secs);
    loop {
        engine.heartbeats.beat(RECONCILE);
        let wait = match engine.reconcile_once(Utc::now()).await {
            Ok(()) => interval,
            Err(e) => backoff_for(RECONCILE, &e),
        };
        if !pause(&mut shutdown, wait).await {
            break;
        }
    }
    info!(task = RECONCILE, "Loop stopped");
}

async fn adaptive_loop(engine: Arc<TradingEngine>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(engine.config.adaptive.interval_secs);
    loop {
        engine.heartbeats.beat(ADAPTIVE);
        engine.adjust_thresholds();
        if !pause(&mut shutdown, interval).await {
            break;
        }
    }
    info!(task = ADAPTIVE, "Loop stopped");
}
