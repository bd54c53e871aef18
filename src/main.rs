use deribit_delta_hedger::config::Config;
use deribit_delta_hedger::events::{EventBus, PnlRecorder};
use deribit_delta_hedger::exchange::{DeribitClient, ExchangeApi, ExchangeError};
use deribit_delta_hedger::hedging::{HedgerConfig, HedgingManager};
use deribit_delta_hedger::market::SubscriptionManager;
use deribit_delta_hedger::portfolio::FilePortfolioStore;
use deribit_delta_hedger::pricing::BlackScholesPricer;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

// Exit codes for the host process.
const EX_CONFIG: u8 = 64;
const EX_AUTH: u8 = 69;
const EX_INTERNAL: u8 = 70;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting Deribit Delta Hedger v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match Config::load().and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration error");
            return ExitCode::from(EX_CONFIG);
        }
    };
    info!(
        testnet = config.exchange.testnet,
        portfolios_dir = %config.portfolios_dir.display(),
        target_delta = config.hedging.target_delta,
        step_mode = ?config.hedging.step_mode,
        "Configuration loaded"
    );

    // Connect the exchange session; a bad key is fatal here.
    let exchange = Arc::new(DeribitClient::new(&config.exchange));
    if let Err(e) = exchange.connect().await {
        return match e {
            ExchangeError::AuthRequired => {
                error!(error = %e, "Exchange authentication failed");
                ExitCode::from(EX_AUTH)
            }
            other => {
                error!(error = %other, "Exchange connection failed");
                ExitCode::from(EX_INTERNAL)
            }
        };
    }

    let bus = EventBus::new();
    let store = match FilePortfolioStore::open(&config.portfolios_dir, bus.clone()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "Failed to open portfolio store");
            return ExitCode::from(EX_INTERNAL);
        }
    };

    let pnl = Arc::new(PnlRecorder::new(
        bus.clone(),
        config.hedging.pnl_history_depth,
        Duration::from_secs_f64(config.hedging.pnl_publish_interval),
    ));
    let (pnl_stop_tx, pnl_stop_rx) = watch::channel(false);
    let pnl_task = tokio::spawn(pnl.clone().run(pnl_stop_rx));

    let exchange_api: Arc<dyn ExchangeApi> = exchange.clone();
    let subscriptions = Arc::new(SubscriptionManager::new(exchange_api.clone()));

    let manager = HedgingManager::new(
        exchange_api,
        store,
        subscriptions,
        Arc::new(BlackScholesPricer),
        bus,
        pnl,
        HedgerConfig::from_settings(&config.hedging),
    );

    if let Err(e) = manager.start_all().await {
        error!(error = %e, "Failed to start hedgers");
        manager.shutdown().await;
        return ExitCode::from(EX_INTERNAL);
    }

    info!("Hedging engine running, ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Signal handler failed");
        manager.shutdown().await;
        return ExitCode::from(EX_INTERNAL);
    }

    info!("Shutdown signal received");
    manager.shutdown().await;
    let _ = pnl_stop_tx.send(true);
    let _ = pnl_task.await;

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
