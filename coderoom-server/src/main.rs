//! CodeRoom relay server.
//!
//! Configured from the environment (`CODEROOM_BIND_ADDR`,
//! `CODEROOM_HEARTBEAT_SECS`); log output is controlled by `RUST_LOG`.

use coderoom_collab::{ServerConfig, SyncServer};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    let server = SyncServer::new(config);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} messages relayed",
                stats.total_connections, stats.total_messages
            );
        }
    }

    Ok(())
}
