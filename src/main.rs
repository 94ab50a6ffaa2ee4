//! WAGERHALL: pari-mutuel wagering service.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the record store, wires the engine to the outbound queue, serves
//! the operator console on stdin and runs housekeeping until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use wagerhall::actions::Dispatcher;
use wagerhall::config::AppConfig;
use wagerhall::console::Console;
use wagerhall::dashboard::{self, routes::DashboardState};
use wagerhall::engine::queue::OperationQueue;
use wagerhall::engine::Engine;
use wagerhall::platform::{Announcer, LogChannel, StaticPermissions};
use wagerhall::session::SessionStore;
use wagerhall::storage::Store;

const BANNER: &str = r#"
 __      __                        _  _      _  _
 \ \    / /_ _  __ _  ___  _ _    | || | __ _| || |
  \ \/\/ / _` |/ _` |/ -_)| '_|   | __ |/ _` | || |
   \_/\_/\__,_|\__, |\___||_|     |_||_|\__,_|_||_|
               |___/
  Pari-mutuel events for community chat
"#;

/// How often payouts and stale drafts are swept.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();

    let cfg = AppConfig::load_or_default("config.toml")?;

    println!("{BANNER}");
    info!(
        service = %cfg.service.name,
        announce_target = %cfg.service.announce_target,
        operators = cfg.service.operators.len(),
        "WAGERHALL starting up"
    );

    // -- Initialise components -------------------------------------------

    let database_url = &cfg.storage.database_url;
    let store = Store::connect(
        database_url,
        cfg.storage.max_connections,
        Duration::from_millis(cfg.storage.busy_timeout_ms),
    )
    .await
    .with_context(|| format!("Failed to open record store at {database_url}"))?;

    let queue = OperationQueue::start(cfg.queue.queue_config());
    let announcer = Announcer::new(
        Arc::new(LogChannel),
        queue.clone(),
        cfg.service.announce_target.clone(),
        cfg.queue.announce_retries,
    );
    let engine = Engine::new(store, announcer, &cfg.betting);

    let sessions = Arc::new(SessionStore::new(
        Duration::from_secs(cfg.session.ttl_secs),
        cfg.session.capacity,
        cfg.betting.terms(),
    ));
    let permissions = Arc::new(StaticPermissions::with_operators(
        cfg.service.operators.iter().cloned(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(engine.clone(), permissions)?);
    info!(
        actions = dispatcher.router().len(),
        "Interaction dispatcher ready"
    );

    let console = Console::new(dispatcher, sessions.clone());
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        if let Err(e) = console.run(stdin, tokio::io::stdout()).await {
            error!(error = %e, "Operator console stopped");
        }
    });

    if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(engine.clone(), cfg.service.name.clone()));
        dashboard::spawn_dashboard(state, cfg.dashboard.port).await?;
    }

    // -- Housekeeping loop -------------------------------------------------

    let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                housekeeping(&engine, &sessions).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    let dropped = queue.clear();
    if dropped > 0 {
        warn!(dropped, "Discarded pending outbound operations");
    }
    queue.shutdown().await;
    info!("WAGERHALL shut down cleanly");
    Ok(())
}

async fn housekeeping(engine: &Engine, sessions: &SessionStore) {
    match engine
        .settlement
        .expire_overdue_payouts(chrono::Utc::now())
        .await
    {
        Ok(0) => {}
        Ok(expired) => info!(expired, "Expired overdue payouts"),
        Err(e) => error!(error = %e, "Payout expiry sweep failed"),
    }

    let purged = sessions.purge_expired();
    if purged > 0 {
        info!(purged, "Dropped stale creation drafts");
    }

    let stats = engine.announcer().queue().stats();
    info!(
        pending = stats.pending,
        executed = stats.executed,
        failed = stats.failed,
        spacing_ms = stats.spacing.as_millis() as u64,
        "Outbound queue status"
    );
}

/// Initialise the tracing subscriber with env-filter support.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wagerhall=info"));

    let json_logging = std::env::var("WAGERHALL_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
