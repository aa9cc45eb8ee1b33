use anyhow::{bail, Context};
use fleetloop_c2_router::FleetApp;
use fleetloop_core::{logging, FleetConfig, SqliteStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config = match parse_config_path(&args)? {
        Some(path) => FleetConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => FleetConfig::default(),
    };
    config.validate().context("invalid configuration")?;

    logging::init_from_config(&config.logging);

    let store_path = Path::new(&config.store.path);
    if let Some(parent) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating store directory {}", parent.display()))?;
    }
    let store = Arc::new(SqliteStore::open(store_path).context("opening mission store")?);

    let app = FleetApp::from_config(config, store);
    app.restore_missions().context("restoring missions")?;
    let seeded = app.seed_missions().context("seeding missions")?;

    info!(
        listen_addr = %app.config().server.listen_addr,
        mode = ?app.config().facility.mode,
        seeded,
        "fleetloop-node started"
    );

    let server = app.server();
    tokio::select! {
        result = server.run() => {
            result.context("fleet server stopped")?;
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
        }
    }

    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            bail!("--config was provided without a path");
        }
    }

    Ok(None)
}
