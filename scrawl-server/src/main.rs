//! Whiteboard sync server.
//!
//! Environment: `HOST`, `PORT`, `HEARTBEAT_INTERVAL_SECS`,
//! `COMPACTION_INTERVAL_SECS`, `BROADCAST_CAPACITY`, `RUST_LOG`.

mod config;

use config::Config;
use scrawl_collab::SyncServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    Config::load_env_files();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load_or_default();
    let server = SyncServer::new(config.server_config());
    log::info!(
        "Starting whiteboard server on {} (heartbeat {}s, compaction {}s)",
        server.bind_addr(),
        config.heartbeat_interval_secs,
        config.compaction_interval_secs
    );

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for interrupt: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let stats = server.stats().await;
    log::info!(
        "Exited cleanly: {} admitted, {} refused, {} terminated by liveness",
        stats.total_admitted,
        stats.total_refused,
        stats.total_terminated
    );
    Ok(())
}
