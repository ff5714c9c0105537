use clap::Parser;
use perpbot::api::{BinanceFuturesClient, ServerTimeClient};
use perpbot::clock::{Clock, ClockSync, SystemClock};
use perpbot::config::AppConfig;
use perpbot::execution::RequestExecutor;
use perpbot::gateway::MarketGateway;
use perpbot::scheduler::Scheduler;
use perpbot::strategy::MaTrendStrategy;
use perpbot::trader::Trader;
use perpbot::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "perpbot")]
#[command(version)]
#[command(about = "Hourly MA trend trader for Binance USDT-M perpetuals", long_about = None)]
struct Cli {
    /// Directory holding default.toml and <PERPBOT_ENV>.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Do not reconcile or re-protect open positions before the first cycle
    #[arg(long)]
    no_startup_reconcile: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)?;
    setup_logging(&config.logging.level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            tracing::error!("Config: {}", error);
        }
        return Err(format!("invalid configuration ({} errors)", errors.len()).into());
    }

    tracing::info!("🚀 perpbot starting");

    // Clock alignment first: every signed request depends on it
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let time_client = ServerTimeClient::new(&config.api.base_url, config.network.request_timeout())?;
    let clock_sync = Arc::new(ClockSync::new(
        Arc::new(time_client),
        clock.clone(),
        config.clock.sync_interval(),
        config.clock.max_offset_ms,
    ));
    clock_sync.sync().await;
    let sync_task = clock_sync.spawn_periodic();

    let client = BinanceFuturesClient::new(config.binance_settings(), clock_sync.clone())?;
    let executor = RequestExecutor::new(
        clock_sync.clone(),
        config.network.max_retries,
        config.network.retry_delay(),
    );
    let gateway = Arc::new(MarketGateway::new(
        Arc::new(client),
        executor,
        clock.clone(),
        config.trading.rules_ttl(),
    ));

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Endpoint: {}", config.api.base_url);
    tracing::info!(
        "  Long: {} USDT x{}",
        config.trading.long_margin,
        config.trading.long_leverage
    );
    tracing::info!(
        "  Short: {} USDT x{}",
        config.trading.short_margin,
        config.trading.short_leverage
    );
    tracing::info!(
        "  Watch list: top {} by volume, {} excluded",
        config.trading.watch_list_size,
        config.trading.exclude_symbols.len()
    );
    tracing::info!(
        "  Clock sync: every {}s, tolerated offset {}ms",
        config.clock.sync_interval_secs,
        config.clock.max_offset_ms
    );

    let mut trader = Trader::new(
        gateway,
        Box::new(MaTrendStrategy::default()),
        config.trading.clone(),
    );

    let reconcile = config.trading.startup_reconcile && !cli.no_startup_reconcile;
    if let Err(e) = trader.startup(reconcile).await {
        // The :57 pass retries reconciliation
        tracing::error!("Startup incomplete: {:#}", e);
    }

    tracing::info!("✅ Running: :57 reconcile, :58 watch list, :59 strategy");
    tracing::info!("\nPress Ctrl+C to stop...\n");

    let mut scheduler = Scheduler::new(trader, clock);
    scheduler
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("\n⚠️  Received Ctrl+C, shutting down..."),
                Err(e) => {
                    tracing::error!("Ctrl+C handler failed, running until killed: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

    sync_task.stop();
    tracing::info!("👋 perpbot stopped");
    Ok(())
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("perpbot={}", level)));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
