//! Triangular arbitrage bot entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use triangular_arb::api::{create_router, AppState};
use triangular_arb::config::Config;
use triangular_arb::engine::{Balance, Engine};
use triangular_arb::exchange::{BookTickerStream, CachedExchange, Exchange, RestExchange};
use triangular_arb::finder::Finder;
use triangular_arb::graph::CurrencyGraph;
use triangular_arb::metrics;
use triangular_arb::opportunity::{JsonLinesStore, NullStore, Opportunity, OpportunityStore};

/// Single-exchange triangular arbitrage bot.
#[derive(Parser, Debug)]
#[command(name = "triangular-arb")]
#[command(about = "Finds and exploits triangular arbitrage on a single exchange")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// Run in dry-run mode (no real orders).
    #[arg(long)]
    dry_run: Option<bool>,

    /// HTTP server port for health/status/metrics.
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the detection loop and the engine (default).
    Run {
        /// Run in dry-run mode (no real orders).
        #[arg(long)]
        dry_run: Option<bool>,

        /// HTTP server port for health/status/metrics.
        #[arg(short, long)]
        port: Option<u16>,

        /// Use the websocket top-of-book feed instead of polling tickers.
        #[arg(long)]
        stream: bool,
    },

    /// Check configuration validity.
    CheckConfig,

    /// Check credentials and print the free balance.
    CheckBalance,

    /// Load markets and tickers once and print the best triangles.
    ListTriangles {
        /// Number of triangles to print.
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("triangular_arb=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let json = std::env::var("LOG_JSON").is_ok_and(|v| v == "true" || v == "1");

    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(filter)
        .init();

    // Handle subcommands
    match args.command {
        Some(Command::CheckConfig) => cmd_check_config().await,
        Some(Command::CheckBalance) => cmd_check_balance().await,
        Some(Command::ListTriangles { limit }) => cmd_list_triangles(limit).await,
        Some(Command::Run { dry_run, port, stream }) => cmd_run(dry_run, port, stream).await,
        None => cmd_run(args.dry_run, args.port, false).await,
    }
}

/// Check configuration validity.
async fn cmd_check_config() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("TRIANGULAR ARB - CONFIGURATION CHECK");
    println!("======================================================================");

    // Load configuration
    print!("Loading configuration... ");
    let config = match Config::load() {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration load failed"));
        }
    };

    // Validate configuration
    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    // Show configuration summary
    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!("  Exchange: {} ({})", config.exchange, config.exchange_rest_url);
    println!("  Credentials: {}", if config.has_credentials() { "present" } else { "missing" });
    println!("  Threshold: {}", config.threshold);
    println!("  Dry Run: {}", config.dry_run);
    println!("  Feed: {}", if config.use_stream { "websocket" } else { "ticker polling" });
    println!("  Fetch Volumes: {}", config.fetch_volumes);
    println!("  Fill Wait: {} x {}ms", config.fill_retries, config.fill_poll_interval_ms);
    println!("  Margin / Safety: {} / {}", config.margin_factor, config.safety_factor);
    println!("  Neutral Currencies: {}", config.neutral_currencies().join(","));
    println!("  Excluded Currencies: {}", config.excluded_currencies().join(","));
    match &config.store_path {
        Some(path) => println!("  Store: {}", path.display()),
        None => println!("  Store: disabled"),
    }
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Check credentials and print the free balance.
async fn cmd_check_balance() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("TRIANGULAR ARB - BALANCE CHECK");
    println!("======================================================================");

    let config = Config::load()?;
    println!("Host: {}", config.exchange_rest_url);
    println!("Credentials: {}", if config.has_credentials() { "present" } else { "missing" });

    print!("\n1. Creating client... ");
    let client = RestExchange::new(&config)?;
    println!("OK");

    print!("\n2. Loading markets... ");
    let markets = client.load_markets().await?;
    println!("OK ({} markets)", markets.len());

    print!("\n3. Fetching balance... ");
    match client.fetch_balance().await {
        Ok(free) => {
            println!("OK");
            let mut balance = Balance::new(config.excluded_currencies());
            balance.set_precisions(&markets);
            balance.replace(&free);
            for (currency, amount) in balance.amounts() {
                println!("   {:<8} {}", currency, amount);
            }
            if balance.amounts().is_empty() {
                println!("   (empty)");
            }
        }
        Err(e) => {
            println!("FAILED");
            println!("   Error: {}", e);
        }
    }

    println!("\n======================================================================");
    println!("BALANCE CHECK COMPLETED");
    println!("======================================================================");

    Ok(())
}

/// Print the best triangles from one ticker snapshot.
async fn cmd_list_triangles(limit: usize) -> anyhow::Result<()> {
    let config = Config::load()?;
    let client = RestExchange::new(&config)?;

    let markets = client.load_markets().await?;
    let mut graph = CurrencyGraph::new(client.name(), &markets);
    let tickers = client.fetch_tickers().await?;
    graph.update(&tickers);

    let mut opportunities: Vec<Opportunity> = graph
        .triangles()
        .iter()
        .filter_map(|t| Opportunity::from_triangle(&graph, t).ok())
        .collect();
    opportunities.sort_by(|a, b| b.arbitrage().cmp(&a.arbitrage()));

    println!("======================================================================");
    println!(
        "TRIANGLES ({} markets, {} currencies, {} triangles)",
        markets.len(),
        graph.currencies().count(),
        graph.triangles().len()
    );
    println!("======================================================================");
    for opportunity in opportunities.iter().take(limit) {
        let marker = if opportunity.arbitrage() > config.threshold { "*" } else { " " };
        println!("{} {:<12} {:<28} {}", marker, opportunity.id(), opportunity.to_string(), opportunity.arbitrage().round_dp(6));
    }
    println!("======================================================================");

    Ok(())
}

/// Run the detection loop and the engine.
async fn cmd_run(dry_run_override: Option<bool>, port_override: Option<u16>, stream: bool) -> anyhow::Result<()> {
    // Load configuration
    info!("Loading configuration...");
    let mut config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    // Override with CLI args if provided
    if let Some(dry_run) = dry_run_override {
        config.dry_run = dry_run;
    }
    if let Some(port) = port_override {
        config.port = port;
    }
    config.use_stream |= stream;

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }

    // Initialize metrics
    let prometheus = PrometheusBuilder::new().install_recorder()?;
    metrics::init_metrics();

    info!("Configuration loaded successfully");
    info!("Mode: {}", if config.dry_run { "SIMULATION" } else { "LIVE TRADING" });
    info!("Exchange: {}", config.exchange);
    info!("Threshold: {}", config.threshold);

    // Shutdown fan-out
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Exchange client
    let rest = Arc::new(RestExchange::new(&config)?);
    let exchange = Arc::new(CachedExchange::new(rest, config.cache_ttl(), config.cache_capacity));

    let store: Arc<dyn OpportunityStore> = match &config.store_path {
        Some(path) => Arc::new(JsonLinesStore::new(path)),
        None => Arc::new(NullStore),
    };

    // Finder
    let mut finder = Finder::new(exchange.clone(), config.finder_settings(), store);
    let markets = finder.load().await?;
    info!(
        markets = markets.len(),
        currencies = finder.graph().currencies().count(),
        triangles = finder.graph().triangles().len(),
        "Currency graph built"
    );
    let events = finder.subscribe();
    let snapshot = finder.snapshot();

    // Engine
    let engine = Arc::new(Engine::new(exchange.clone(), config.engine_settings(), snapshot.clone()));
    if let Err(e) = engine.init(&markets).await {
        warn!(error = %e, "Initial balance fetch failed, engine suspended until next refresh");
    }

    // HTTP server
    let app_state = AppState::new(&config.exchange)
        .with_opportunities(snapshot)
        .with_engine(engine.clone())
        .with_prometheus(prometheus);
    app_state.set_ready(engine.is_balance_healthy());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let router = create_router(app_state.clone());
    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    let engine_handle = {
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(events, shutdown).await })
    };

    info!("========================================");
    info!("TRIANGULAR ARBITRAGE BOT STARTED");
    info!("========================================");

    if config.use_stream {
        let relevant = CurrencyGraph::relevant_markets(&markets);
        let feed = Arc::new(BookTickerStream::new(&config.exchange_ws_url, &relevant));
        let records = feed.run_with_reconnect();
        finder.run_stream(records, shutdown_rx.clone()).await;
    } else {
        finder.run(shutdown_rx.clone()).await;
    }

    // Dropping the finder closes the event channel
    drop(finder);
    app_state.set_ready(false);
    if let Err(e) = engine_handle.await {
        error!(error = %e, "Engine task failed");
    }
    if let Ok(Err(e)) = server_handle.await {
        error!(error = %e, "HTTP server failed");
    }

    let stats = engine.stats();
    info!("========================================");
    info!("SHUTDOWN SUMMARY");
    info!("========================================");
    info!("Opportunities evaluated: {}", stats.evaluated);
    info!("Exploited: {}", stats.exploited);
    info!("Failed: {}", stats.failed);
    info!("Skipped while locked: {}", stats.skipped_locked);
    info!("Not exploitable: {}", stats.not_exploitable);

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
