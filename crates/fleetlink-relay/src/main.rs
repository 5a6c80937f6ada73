//! Fleetlink Relay Server
//!
//! Brokers persistent sessions between edge devices and management
//! clients over a pub/sub-backed relay.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use uuid::Uuid;

use fleetlink_core::clock::SystemClock;
use fleetlink_core::config::load_config;
use fleetlink_core::tracing_init::init_tracing;
use fleetlink_relay::api::{self, AppState};
use fleetlink_relay::bus::{LocalBus, SharedBus};
use fleetlink_relay::presence::PresenceTracker;
use fleetlink_relay::session::SessionManager;
use fleetlink_relay::store::RelayStore;

#[derive(Parser, Debug)]
#[command(name = "fleetlink-relay")]
#[command(version, about = "Fleetlink relay server - device connectivity broker")]
struct Args {
    /// Address to listen on; overrides the config file.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the SQLite database file; overrides the config file.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.relay.listen_addr = addr.to_string();
    }
    if let Some(db_path) = args.db_path {
        config.relay.database_path = Some(db_path);
    }

    init_tracing("fleetlink_relay=info", config.relay.log_json);

    let instance_id = config
        .relay
        .instance_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.relay.listen_addr,
        instance_id = %instance_id,
        "Starting fleetlink-relay"
    );

    let clock = SystemClock::shared();
    let recording_expire = Duration::from_secs(config.recordings.expire_secs.max(0) as u64);

    let store = match &config.relay.database_path {
        Some(path) => {
            info!(path = %path.display(), "Opening relay store");
            RelayStore::open(path, Arc::clone(&clock), recording_expire).await?
        }
        None => {
            info!("Opening in-memory relay store");
            RelayStore::open_in_memory(Arc::clone(&clock), recording_expire).await?
        }
    };

    let bus: SharedBus = Arc::new(LocalBus::new());
    let heartbeat = Duration::from_secs(config.sessions.ping_period_secs);
    let presence = PresenceTracker::new(store.clone(), Arc::clone(&bus), instance_id, heartbeat);
    let sessions = SessionManager::new(
        store.clone(),
        Arc::clone(&bus),
        presence.clone(),
        clock,
        config.recordings.clone(),
    );

    let state = AppState {
        store,
        bus,
        presence,
        sessions,
        config: config.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.relay.listen_addr.as_str()).await?;
    info!(addr = %config.relay.listen_addr, "Relay server ready");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    info!("Relay stopped");
    Ok(())
}
