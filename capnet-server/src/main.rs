use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use capnet_server::cap::{CapEngine, CapStore, IssuerIdentity};
use capnet_server::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (CAPNET_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("CAPNET_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("capnet_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ServerConfig::parse();
    tracing::info!("Starting capability core on {}", config.listen_addr);
    tracing::info!("Data directory: {}", config.data_dir.display());

    let store = CapStore::open(config.data_dir.clone())?;
    let identity = IssuerIdentity::load_or_generate(&config.data_dir)?;
    tracing::info!(issuer = %identity.issuer_id, "issuer identity ready");

    let engine = Arc::new(CapEngine::new(store, identity));
    capnet_server::web::serve(config, engine).await
}
