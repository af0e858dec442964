use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_mesh::config::{verbose_to_filter, RelayConfig};
use relay_mesh::server::SharedState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::parse();

    let json_logs = config.log_json;
    let filter = EnvFilter::try_new(verbose_to_filter(&config.verbose)).unwrap_or_else(|_| EnvFilter::new("relay_mesh=info"));
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(addr = %config.addr, peers = config.query_remotes.len(), "starting relay-mesh");

    let state = SharedState::bootstrap(config).await?;
    state.run().await
}
