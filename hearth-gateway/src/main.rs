//! HearthLink gateway: serves the reading-room document store over
//! WebSocket.
//!
//! Usage: `hearth-gateway [config.toml]`
//!
//! Without a config file the defaults apply (in-memory store on
//! 127.0.0.1:9090, no sign-in tokens); `HEARTH_*` environment variables
//! override either.

mod reporter;

use hearth_collab::store::{LocalStore, ReadingRoomRules, RocksBackend, StorageBackend};
use hearth_collab::{GatewayConfig, HearthConfig, PermissionErrorBus, StoreGateway};
use log::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        error!("hearth-gateway: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BoxError> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading config from {path}");
            HearthConfig::load(path)?
        }
        None => HearthConfig::from_env()?,
    };

    let bus = PermissionErrorBus::new(config.bus_capacity);
    let _reporter = reporter::mount(&bus);

    match config.store_config() {
        Some(store_config) => {
            info!("Opening RocksDB store at {}", store_config.path.display());
            let backend = RocksBackend::open(store_config)?;
            serve(config.gateway, LocalStore::new(backend, ReadingRoomRules), bus).await
        }
        None => {
            info!("No data_dir configured, documents are kept in memory");
            serve(config.gateway, LocalStore::in_memory(ReadingRoomRules), bus).await
        }
    }
}

async fn serve<B: StorageBackend>(
    config: GatewayConfig,
    store: LocalStore<B>,
    bus: PermissionErrorBus,
) -> Result<(), BoxError> {
    if config.tokens.is_empty() && !config.trust_client_uid {
        warn!("No sign-in tokens configured, every connection stays signed out");
    }
    let gateway = StoreGateway::new(config, store).with_bus(bus);

    tokio::select! {
        result = gateway.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = gateway.stats().await;
            info!(
                "Shutting down: {} connections, {} requests ({} denied)",
                stats.total_connections, stats.total_requests, stats.denied_requests
            );
            Ok(())
        }
    }
}
