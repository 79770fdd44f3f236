use std::sync::Arc;

use clap::Parser;
use collector_core::collector::GlobalConfig;
use collector_core::config::{Args, Config};
use collector_core::{Collector, DirectoryProducer, HttpRemoteNodeClient, SqlNodeRegistry, SqlWorkloadStore};
use eyre::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::from_args(args)?;

    let store = Arc::new(SqlWorkloadStore::connect(&config.workload_db).await?);
    let registry = Arc::new(SqlNodeRegistry::connect_one("default", &config.registry_db).await?);
    let client = Arc::new(HttpRemoteNodeClient::new(
        config.ca_chain_path.as_deref(),
        config.submit_timeout,
    )?);

    let global = GlobalConfig {
        heartbeat: config.node_status_update_frequency,
        ca_chain_path: config.ca_chain_path.clone(),
        company_id: config.company_id.clone(),
    };

    let producer = Box::new(DirectoryProducer::new(config.inbox.clone()));

    let mut collector = Collector::new(store, registry, client, global, producer);

    // A single default group: full coverage, full delivery, against the
    // registry database named "default". Real deployments call `add_group`
    // once per named remote node group before `start()`.
    collector.add_group("default", 100, true, "default").await?;

    collector.start()?;

    tracing::info!(
        company_id = %config.company_id,
        inbox = %config.inbox.display(),
        "collector started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    collector.stop();
    collector.wait().await;

    Ok(())
}
