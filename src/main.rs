// src/main.rs
//
// Stock dashboard sync client.
// Keeps one dashboard view in sync with the backend, falls back to the last
// good snapshot when it cannot, and optionally serves the view plus an
// offline-capable edge proxy for the web frontend.

use chrono::NaiveDate;
use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use stock_dashboard::api::DashboardApi;
use stock_dashboard::cache::{FileSnapshotStore, SnapshotCache};
use stock_dashboard::clock::{ExchangeClock, SystemClock};
use stock_dashboard::config::{default_config_template, Config};
use stock_dashboard::dashboard::DashboardServer;
use stock_dashboard::fetch::ReqwestTransport;
use stock_dashboard::models::StrategyKind;
use stock_dashboard::offline::{CacheStorage, OfflineCacheService};
use stock_dashboard::sync::{DashboardView, SyncController, SyncPhase};
use stock_dashboard::traits::SharedTransport;

#[derive(Parser)]
#[command(name = "stock-dashboard")]
#[command(about = "Stock dashboard sync client with snapshot fallback and an offline edge cache")]
struct Args {
    /// Mode of operation: watch, once or serve
    #[arg(long, default_value = "watch")]
    mode: String,

    /// Path to configuration file (TOML)
    #[arg(long, short)]
    config: Option<String>,

    /// Date to load (YYYY-MM-DD); defaults to today on the exchange calendar
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Strategy to select: premarket, intraday or close
    #[arg(long)]
    strategy: Option<StrategyKind>,

    /// Comma-separated ad-hoc tickers merged with the watchlist
    #[arg(long)]
    tickers: Option<String>,

    /// Dashboard / edge proxy port (overrides the config)
    #[arg(long)]
    port: Option<u16>,

    /// Generate a default configuration file
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Handle config generation
    if args.generate_config {
        println!("{}", default_config_template());
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                eprintln!("Use --generate-config to create a template.");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level()))
        .init();

    let app = match build(&args, &config) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    match args.mode.as_str() {
        "once" => run_once(app).await,
        "watch" => run_watch(app).await,
        "serve" => run_serve(app).await,
        _ => {
            eprintln!("Unknown mode: {}. Use: watch, once, or serve", args.mode);
            std::process::exit(1);
        }
    }
}

// =============================================================================
// Wiring
// =============================================================================

struct App {
    controller: SyncController,
    offline: Result<OfflineCacheService, String>,
    port: Option<u16>,
}

fn build(args: &Args, config: &Config) -> Result<App, String> {
    let transport: SharedTransport = Arc::new(ReqwestTransport::new());
    let clock = ExchangeClock::new(
        &config.schedule.timezone,
        config.trading_window()?,
        Arc::new(SystemClock),
    );

    let today = clock.today();
    let date = args.date.unwrap_or(today);
    if date > today {
        return Err(format!("--date {} is after today ({})", date, today));
    }

    let mut params = config.initial_parameters(date)?;
    if let Some(strategy) = args.strategy {
        params.strategy = Some(strategy);
    }
    if let Some(tickers) = &args.tickers {
        params.custom_input = tickers.clone();
    }

    let api = DashboardApi::new(transport.clone(), &config.api.base_url, config.api.user_key.clone())?;
    let cache = SnapshotCache::new(FileSnapshotStore::shared(&config.cache.dir));
    let controller = SyncController::new(api, clock, cache, config.sync_settings(), params);

    let offline = config
        .offline_settings()
        .map(|settings| OfflineCacheService::new(transport, Arc::new(CacheStorage::new()), settings));

    Ok(App {
        controller,
        offline,
        port: args.port.or(config.global.dashboard_port),
    })
}

fn print_view(view: &DashboardView) {
    match serde_json::to_string_pretty(view) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to encode view: {}", e),
    }
}

fn summarize(view: &DashboardView) -> String {
    let strategy = view
        .strategy
        .map(|s| s.label().to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "v{} {} {} candidates={}",
        view.version,
        strategy,
        view.effective_date,
        view.candidates.len()
    );
    if view.from_cache {
        line.push_str(" (cached)");
    }
    if let Some(error) = &view.error {
        line.push_str(&format!(" error: {}", error.message));
    }
    line
}

// =============================================================================
// Modes
// =============================================================================

/// One pipeline for the current parameters, then print the view.
async fn run_once(app: App) {
    let report = app.controller.sync_once().await;
    if report.is_none() {
        warn!("Nothing to load: no strategy is available for the selected date");
    }
    print_view(&app.controller.view());
    app.controller.shutdown();
}

/// Keep the view in sync and log every committed change until Ctrl+C.
async fn run_watch(app: App) {
    let controller = app.controller.clone();
    controller.start();

    if let Some(port) = app.port {
        start_dashboard(&app, port);
    }

    let mut rx = controller.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = rx.borrow_and_update().clone();
                if matches!(view.phase, SyncPhase::Committed | SyncPhase::Degraded) {
                    info!("Dashboard: {}", summarize(&view));
                }
            }
            _ = &mut shutdown => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    controller.shutdown();
}

/// Serve the view and the edge proxy until Ctrl+C.
async fn run_serve(app: App) {
    let Some(port) = app.port else {
        eprintln!("serve mode needs a port: use --port or [global] dashboard_port");
        std::process::exit(1);
    };

    app.controller.start();
    start_dashboard(&app, port);
    wait_for_shutdown().await;
    app.controller.shutdown();
}

fn start_dashboard(app: &App, port: u16) {
    let offline = match &app.offline {
        Ok(offline) => offline.clone(),
        Err(e) => {
            eprintln!("Dashboard disabled: {}", e);
            return;
        }
    };
    let dashboard = DashboardServer::new(app.controller.clone(), offline, port);
    tokio::spawn(async move {
        if let Err(e) = dashboard.run().await {
            eprintln!("Dashboard server error: {}", e);
        }
    });
    println!("Dashboard available at http://localhost:{}", port);
}

async fn wait_for_shutdown() {
    println!("Dashboard running. Press Ctrl+C to exit.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to listen for Ctrl+C: {}", e);
    }
    println!("\nShutting down...");
}
