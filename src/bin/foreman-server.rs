//! Main entry point for the foreman dispatch server.
//!
//! Connects to Postgres and etcd, runs migrations, and serves the dispatch
//! gRPC API until Ctrl+C.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use foreman::config;
use foreman::dispatch::DispatchServerHandle;
use foreman::registry::EtcdRegistry;
use foreman::store::PostgresStore;

#[derive(Parser, Debug)]
#[command(
    name = "foreman-server",
    about = "Central dispatch service for the foreman task platform"
)]
struct Args {
    /// gRPC address to bind, overrides FOREMAN_DISPATCH_GRPC_ADDR
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting foreman dispatch server");

    let config = config::try_get_config()?;
    let grpc_addr = args.grpc_addr.unwrap_or(config.dispatch_grpc_addr);

    let store = PostgresStore::connect(config.require_database_url()?).await?;
    info!("Connected to database, migrations complete");

    let registry = EtcdRegistry::connect(&config.etcd_endpoints, &config.registry_prefix).await?;
    info!(endpoints = ?config.etcd_endpoints, "Connected to etcd");

    let server =
        DispatchServerHandle::start(Some(grpc_addr), Arc::new(store), Arc::new(registry)).await?;

    info!(addr = %server.addr(), "Dispatch server started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    server.shutdown().await?;

    Ok(())
}
