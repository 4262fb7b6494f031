use anyhow::Context;
use gearbroker::{GearmanServer, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gearbroker=info")),
        )
        .init();

    // Optional single argument: path to a JSON config file.
    let config = match std::env::args().nth(1) {
        Some(path) => {
            ServerConfig::from_file(&path).with_context(|| format!("loading config {path}"))?
        }
        None => ServerConfig::default(),
    };

    let server = GearmanServer::new(config);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}
