//! MemePerp engine binary.
//!
//! `memeperp serve --config <path>` boots the matching core; the `admin`
//! subcommands drive a running instance over its HTTP surface.
//!
//! Exit codes: 0 clean, 1 bad configuration, 2 repository unreachable,
//! 3 chain gateway unreachable.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memeperp_backend::{
    api::{self, AppState},
    config::Config,
    engine::{worker::TokenCommand, MatchingEngine},
    repo::{sqlite::SqliteRepository, Repository},
    settlement::{BridgeConfig, ChainGateway, SettlementBridge, StubChainGateway},
};

#[derive(Parser)]
#[command(name = "memeperp", about = "Perpetual futures matching engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the engine.
    Serve {
        /// Optional TOML config; env vars override.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Administer a running engine over HTTP.
    Admin {
        /// Base URL of the running engine.
        #[arg(long, env = "MEMEPERP_URL", default_value = "http://127.0.0.1:8080")]
        url: String,
        #[command(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Subcommand)]
enum AdminCommand {
    /// Token lifecycle actions.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Per-token parameters.
    Params {
        #[command(subcommand)]
        action: ParamsAction,
    },
    /// Credit a trader balance (chainless deployments).
    Deposit { trader: String, amount: String },
}

#[derive(Subcommand)]
enum TokenAction {
    Activate { addr: String },
    Pause { addr: String },
    Resume { addr: String },
    Delist { addr: String },
}

#[derive(Subcommand)]
enum ParamsAction {
    Set {
        addr: String,
        key: String,
        value: String,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Serve { config } => serve(config.as_deref()).await,
        Command::Admin { url, command } => admin(&url, command).await,
    };
    std::process::exit(code);
}

async fn serve(config_path: Option<&std::path::Path>) -> i32 {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return 1;
        }
    };

    info!("MemePerp matching engine starting");
    info!(port = config.port, db = %config.database_path, chain_id = config.chain_id, "configuration loaded");

    if let Some(addr) = &config.metrics_addr {
        match addr.parse::<std::net::SocketAddr>() {
            Ok(sock) => {
                if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
                    .with_http_listener(sock)
                    .install()
                {
                    warn!(error = %e, "metrics exporter failed to start");
                } else {
                    info!(%addr, "metrics exporter listening");
                }
            }
            Err(e) => warn!(error = %e, "bad METRICS_ADDR; metrics disabled"),
        }
    }

    let repo: Arc<dyn Repository> = match SqliteRepository::open(&config.database_path) {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            error!(error = %e, "repository unreachable");
            return 2;
        }
    };

    let gateway: Arc<dyn ChainGateway> = StubChainGateway::new();
    let mut mark_rx = match gateway.subscribe_mark_prices().await {
        Ok(rx) => rx,
        Err(e) => {
            error!(error = %e, "chain gateway unreachable (mark stream)");
            return 3;
        }
    };
    let mut deposit_rx = match gateway.subscribe_deposits().await {
        Ok(rx) => rx,
        Err(e) => {
            error!(error = %e, "chain gateway unreachable (deposit stream)");
            return 3;
        }
    };

    let broadcaster = memeperp_backend::broadcast::Broadcaster::new(config.broadcast_capacity);
    let (bridge, sink, bridge_rx) =
        SettlementBridge::new(gateway.clone(), repo.clone(), BridgeConfig::from(&config));
    let bridge_task = tokio::spawn(bridge.run(bridge_rx));

    let engine = Arc::new(MatchingEngine::new(
        config.clone(),
        repo.clone(),
        broadcaster,
        sink,
    ));
    if let Err(e) = engine.restore_from_repo().await {
        error!(error = %e, "state restore failed");
        return 2;
    }
    for (token, index, updated) in repo.funding_all().await.unwrap_or_default() {
        engine.shared().funding.hydrate(token, index, updated);
    }

    // --- background drivers -------------------------------------------------

    // Mark stream: gate the step, store, and nudge the owning worker.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(update) = mark_rx.recv().await {
                let shared = engine.shared();
                let Ok(params) = shared.registry.params(update.token) else {
                    continue;
                };
                let accepted = shared.marks.update_from_chain(
                    update.token,
                    update.price,
                    update.timestamp,
                    params.max_price_step_bps,
                );
                if accepted == memeperp_backend::marks::MarkUpdate::Accepted {
                    let _ = engine.command_token(update.token, TokenCommand::MarkUpdated);
                }
            }
        });
    }

    // Deposit stream: credit and persist.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(deposit) = deposit_rx.recv().await {
                let shared = engine.shared();
                shared.ledger.deposit(deposit.trader, deposit.amount);
                let balances = shared.ledger.balances(deposit.trader);
                if let Err(e) = shared.repo.balances_persist(deposit.trader, balances).await {
                    warn!(error = %e, "deposit persist failed");
                }
                info!(trader = %deposit.trader, amount = %deposit.amount, "deposit credited");
            }
        });
    }

    // Risk sweep driver; workers gate on their per-token cadence.
    {
        let engine = engine.clone();
        let tick = config.risk_tick_interval_ms.max(50);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(tick));
            loop {
                ticker.tick().await;
                engine.broadcast_command(|| TokenCommand::RiskTick);
            }
        });
    }

    // Funding driver; workers gate on their per-token interval.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                engine.broadcast_command(|| TokenCommand::FundingTick);
            }
        });
    }

    // Resting-order expiry prune.
    {
        let engine = engine.clone();
        let tick = config.expiry_prune_interval_ms.max(250);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(tick));
            loop {
                ticker.tick().await;
                engine.broadcast_command(|| TokenCommand::PruneExpired);
            }
        });
    }

    // Trade log / k-line / balance snapshot flush.
    {
        let engine = engine.clone();
        let tick = config.flush_interval_ms.max(100);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(tick));
            loop {
                ticker.tick().await;
                engine.flush_aggregator().await;
                let shared = engine.shared();
                for (trader, balances) in shared.ledger.snapshot() {
                    if let Err(e) = shared.repo.balances_persist(trader, balances).await {
                        warn!(error = %e, "balance snapshot failed");
                        break;
                    }
                }
            }
        });
    }

    // --- transport ----------------------------------------------------------

    let state = AppState {
        engine: engine.clone(),
    };
    let app = api::router(state)
        .layer(axum::middleware::from_fn(
            memeperp_backend::middleware::request_logging,
        ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr, "bind failed");
            return 1;
        }
    };
    info!(addr, "http listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error = %e, "server error");
    }

    // Graceful drain: cancel resting orders (collateral released), flush
    // buffered trades/k-lines, snapshot balances, let the bridge flush.
    info!("draining engine");
    engine.drain_all().await;
    {
        let shared = engine.shared();
        for (trader, balances) in shared.ledger.snapshot() {
            let _ = shared.repo.balances_persist(trader, balances).await;
        }
    }
    tokio::select! {
        _ = bridge_task => {}
        _ = tokio::time::sleep(Duration::from_millis(
            2 * engine.shared().config.settlement_flush_interval_ms,
        )) => {
            warn!("settlement bridge still busy at shutdown");
        }
    }
    info!("shutdown complete");
    0
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

// --- admin client -----------------------------------------------------------

async fn admin(url: &str, command: AdminCommand) -> i32 {
    match run_admin(url, command).await {
        Ok(body) => {
            println!("{body}");
            0
        }
        Err(e) => {
            eprintln!("admin request failed: {e:#}");
            1
        }
    }
}

async fn run_admin(url: &str, command: AdminCommand) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("build http client")?;

    let (path, body) = match command {
        AdminCommand::Token { action } => match action {
            TokenAction::Activate { addr } => (
                "/admin/token/activate".to_string(),
                serde_json::json!({ "token": addr }),
            ),
            TokenAction::Pause { addr } => (
                "/admin/token/pause".to_string(),
                serde_json::json!({ "token": addr, "reason": "admin pause" }),
            ),
            TokenAction::Resume { addr } => (
                "/admin/token/resume".to_string(),
                serde_json::json!({ "token": addr }),
            ),
            TokenAction::Delist { addr } => (
                "/admin/token/delist".to_string(),
                serde_json::json!({ "token": addr }),
            ),
        },
        AdminCommand::Params {
            action: ParamsAction::Set { addr, key, value },
        } => (
            "/admin/params".to_string(),
            serde_json::json!({ "token": addr, "key": key, "value": value }),
        ),
        AdminCommand::Deposit { trader, amount } => (
            "/admin/deposit".to_string(),
            serde_json::json!({ "trader": trader, "amount": amount }),
        ),
    };

    let response = client
        .post(format!("{url}{path}"))
        .json(&body)
        .send()
        .await
        .context("send admin request")?;
    let status = response.status();
    let text = response.text().await.context("read admin response")?;
    if !status.is_success() {
        anyhow::bail!("{status}: {text}");
    }
    Ok(text)
}
