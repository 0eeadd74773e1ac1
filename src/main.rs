use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

use trendbot::engine::{self, EngineHandle, EngineParts, EvaluationQueue};
use trendbot::exchange::{BinanceFuturesClient, Exchange, PaperExchange};
use trendbot::market::{BinanceTradeStream, MarketDataFeed, PriceBoard};
use trendbot::notify::{LogNotifier, Notifier};
use trendbot::persistence::{MemoryStore, RedisStore, StateStore};
use trendbot::{Engine, Result, Settings};

#[derive(Parser, Debug)]
#[command(name = "trendbot", about = "Trend-following engine for Binance USD-M futures")]
struct Args {
    /// TOML settings file (defaults to ./trendbot.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Trade against an in-memory account driven by live prices
    #[arg(long)]
    paper: bool,

    /// Comma-separated symbols, overriding the settings file
    #[arg(long, value_delimiter = ',')]
    symbols: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(symbols) = args.symbols {
        settings.symbols = symbols.iter().map(|s| s.trim().to_uppercase()).collect();
        settings.validate()?;
    }

    tracing::info!("🚀 trendbot starting");
    log_settings(&settings, args.paper);

    // ========================================================================
    // Collaborators
    // ========================================================================

    let (exchange, paper) = build_exchange(&settings, args.paper)?;
    let store = build_store(&settings).await;
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    // ========================================================================
    // Market data
    // ========================================================================

    let (handle, commands, shutdown) = engine::channel(settings.engine.command_buffer);
    let queue = Arc::new(EvaluationQueue::new());
    let prices = PriceBoard::new();

    let source = Arc::new(BinanceTradeStream::new(settings.feed.stream_url.clone()));
    let feed = MarketDataFeed::new(source, settings.feed.clone(), settings.indicator.clone());
    let feed_handles = feed.subscribe(&settings.symbols, queue.clone(), prices.clone(), shutdown.clone());

    let relay_task = paper.map(|paper| {
        let prices = prices.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { paper_price_relay(paper, prices, shutdown).await })
    });

    // ========================================================================
    // Engine
    // ========================================================================

    let engine = Engine::bootstrap(
        &settings,
        EngineParts {
            exchange,
            store,
            notifier,
            queue,
            caches: feed_handles.caches,
        },
    )
    .await?;
    let mut engine_task = tokio::spawn(engine.run(commands, shutdown.clone()));
    let status_task = tokio::spawn(status_report(handle.clone(), shutdown));

    tracing::info!("✅ Running. Press Ctrl+C to stop...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        result = &mut engine_task => {
            tracing::error!("Engine exited unexpectedly: {:?}", result);
        }
    }

    handle.shutdown();
    if !engine_task.is_finished() {
        if let Err(e) = engine_task.await {
            tracing::error!("Engine task failed: {}", e);
        }
    }

    let drain = async {
        for task in feed_handles.tasks {
            let _ = task.await;
        }
        if let Some(task) = relay_task {
            let _ = task.await;
        }
        let _ = status_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("Feed tasks did not stop in time");
    }

    tracing::info!("👋 trendbot stopped");
    Ok(())
}

/// Hourly risk and performance summary from the running engine
async fn status_report(handle: EngineHandle, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => match handle.metrics().await {
                Ok(m) => tracing::info!(
                    equity = m.equity,
                    drawdown_pct = m.drawdown_pct * 100.0,
                    exposure = m.total_exposure,
                    available = m.available_balance,
                    daily_pnl = m.daily_pnl,
                    weekly_pnl = m.weekly_pnl,
                    closed_trades = m.closed_trades,
                    win_rate = m.win_rate * 100.0,
                    reducing_risk = m.reducing_risk,
                    paused = m.paused,
                    "📈 Status"
                ),
                Err(e) => {
                    tracing::warn!(error = %e, "Status report stopped");
                    break;
                }
            },
        }
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trendbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_settings(settings: &Settings, paper: bool) {
    tracing::info!("📊 Configuration:");
    tracing::info!("  Mode: {}", if paper { "paper" } else { "live" });
    tracing::info!("  Symbols: {}", settings.symbols.join(", "));
    tracing::info!(
        "  Timeframes: {} (secondary {})",
        settings.indicator.primary_timeframe,
        settings
            .indicator
            .secondary_timeframe
            .map_or_else(|| "none".to_string(), |tf| tf.to_string())
    );
    tracing::info!("  Max Drawdown: {}%", settings.risk.max_drawdown_pct * 100.0);
    tracing::info!("  Allocation per order: {}%", settings.risk.max_allocation_pct * 100.0);
    tracing::info!("  Daily trade limit: {}", settings.risk.daily_trade_limit);
    tracing::info!(
        "  Stop loss / take profit: {}% / {}%",
        settings.execution.stop_loss_pct * 100.0,
        settings.execution.take_profit_pct * 100.0
    );
    match &settings.signal.averaging {
        Some(averaging) => tracing::info!(
            "  Averaging: pullback {}%, decay {}, max {}",
            averaging.pullback_pct * 100.0,
            averaging.decay,
            averaging.max_average_count
        ),
        None => tracing::info!("  Averaging: disabled"),
    }
}

fn build_exchange(settings: &Settings, paper: bool) -> Result<(Arc<dyn Exchange>, Option<Arc<PaperExchange>>)> {
    if paper {
        tracing::info!("📝 Paper trading with {:.2} USDT", settings.paper_balance);
        let exchange = Arc::new(PaperExchange::new(settings.paper_balance));
        return Ok((exchange.clone(), Some(exchange)));
    }

    if settings.binance.api_key.is_empty() || settings.binance.api_secret.is_empty() {
        return Err("Binance API credentials missing (TRENDBOT__BINANCE__API_KEY / API_SECRET); use --paper to run without them".into());
    }
    let client = BinanceFuturesClient::new(settings.binance.clone())?;
    tracing::info!("Binance futures REST at {}", settings.binance.base_url);
    Ok((Arc::new(client), None))
}

async fn build_store(settings: &Settings) -> Arc<dyn StateStore> {
    let Some(url) = settings.redis.url.as_deref() else {
        tracing::info!("No Redis configured, state kept in memory");
        return Arc::new(MemoryStore::new());
    };

    match RedisStore::new(url, &settings.redis.key_prefix).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!("Redis unavailable ({}), state kept in memory", e);
            Arc::new(MemoryStore::new())
        }
    }
}

// ============================================================================
// Paper Mode
// ============================================================================

/// Mirror live prices into the paper account so market orders and stops fill
async fn paper_price_relay(paper: Arc<PaperExchange>, prices: PriceBoard, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for (symbol, price) in prices.all().await {
                    paper.set_mark_price(&symbol, price).await;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
