use std::sync::Arc;

use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use tracing::{info, warn};

use opt_trade_broker::gateway::{BrokerGateway, MarketDataProvider};
use opt_trade_broker::paper::{PaperGateway, PaperMarketData};
use opt_trade_core::events::EngineEvent;
use opt_trade_core::thresholds::{self, RiskThresholds};
use opt_trade_core::ConfigLoader;
use opt_trade_engine::{spawn_engine, TradingEngine};
use opt_trade_execution::executor::OrderExecutor;
use opt_trade_execution::ledger::PositionLedger;
use opt_trade_execution::reconcile::Reconciler;
use opt_trade_execution::store::{MemoryStore, PgStore, Store};
use opt_trade_risk::adaptive::AdaptiveController;
use opt_trade_risk::breaker::CircuitBreaker;
use opt_trade_risk::manager::RiskManager;
use opt_trade_strategy::scorer::{HttpScorer, NullScorer, ScorerAdapter, SignalScorer};
use opt_trade_strategy::selector::StrategySelector;

mod server;

#[derive(Parser)]
#[command(name = "opt-trade")]
#[command(about = "Risk-gated intraday index options trading engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading engine with the health endpoint
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config).await,
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let config = ConfigLoader::load(config_path)?;
    info!(symbol = config.engine.symbol, "Starting engine");

    // Paper gateway and synthetic market data; a live brokerage adapter
    // plugs in behind the same traits.
    let gateway: Arc<dyn BrokerGateway> = Arc::new(PaperGateway::new());
    let market_data: Arc<dyn MarketDataProvider> =
        Arc::new(PaperMarketData::new(dec!(24750), 14.0, dec!(50)));

    let store: Arc<dyn Store> = match &config.database.url {
        Some(url) => {
            info!("Using PostgreSQL store");
            Arc::new(PgStore::connect(url, config.database.max_connections).await?)
        }
        None => {
            info!("No database configured, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let scorer: Arc<dyn SignalScorer> = match &config.scorer.url {
        Some(url) => {
            info!(url, "Using external signal scorer");
            Arc::new(HttpScorer::new(url.clone(), config.scorer.timeout_secs)?)
        }
        None => {
            info!("No scorer configured, signals carry raw strength only");
            Arc::new(NullScorer)
        }
    };

    let ledger = Arc::new(PositionLedger::new());
    let breaker = Arc::new(CircuitBreaker::new());
    let (thresholds_tx, thresholds_rx) = thresholds::channel(RiskThresholds::default());

    let engine = Arc::new(TradingEngine::new(
        config.clone(),
        gateway.clone(),
        market_data,
        StrategySelector::new(config.strategy.clone(), config.session.clone()),
        ScorerAdapter::new(scorer),
        RiskManager::new(
            config.risk.clone(),
            config.session.clone(),
            breaker.clone(),
            thresholds_rx.clone(),
        ),
        breaker,
        thresholds_rx,
        AdaptiveController::new(config.adaptive.clone(), config.risk.clone(), thresholds_tx),
        ledger.clone(),
        OrderExecutor::new(
            gateway.clone(),
            store.clone(),
            ledger.clone(),
            config.risk.dedup_window_secs,
        ),
        Reconciler::new(gateway, store, ledger, config.reconcile.clone()),
    ));

    // Surface pushed events in the logs; a dashboard would subscribe the
    // same way.
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::Alert {
                    severity, message, ..
                } => warn!(?severity, message, "Alert"),
                EngineEvent::CircuitBreaker {
                    triggered, reason, ..
                } => warn!(triggered, reason, "Circuit breaker event"),
                _ => {}
            }
        }
    });

    let (handle, actor) = spawn_engine(engine);
    handle.start().await?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tokio::spawn(server::serve(addr, handle.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.shutdown().await?;
    actor.await?;
    info!("Engine stopped cleanly");
    Ok(())
}
