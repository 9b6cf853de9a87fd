//! Demo worker binary.
//!
//! Hosts two example tasks (`echo` and `sleep`), connects to the dispatch
//! service, and registers in etcd under the given service name.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use foreman::config;
use foreman::registry::EtcdRegistry;
use foreman::retry::RetryPolicy;
use foreman::worker::sink::GrpcDispatchSink;
use foreman::worker::{TaskContext, TaskParam, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "foreman-worker", about = "Example foreman worker process")]
struct Args {
    /// Service name to register under
    #[arg(long, default_value = "demo")]
    service_name: String,
    /// gRPC address to bind, overrides FOREMAN_WORKER_GRPC_ADDR
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,
    /// Dispatch service endpoint, e.g. http://127.0.0.1:7910
    #[arg(long)]
    dispatch_endpoint: Option<String>,
    /// Register with a fixed identity so only one instance can run
    #[arg(long)]
    single_instance: bool,
}

async fn echo(_ctx: TaskContext, param: TaskParam) -> anyhow::Result<()> {
    param.logger.info(format!("echo: {}", param.arguments)).await;
    Ok(())
}

async fn sleep(ctx: TaskContext, param: TaskParam) -> anyhow::Result<()> {
    let secs: u64 = param.arguments.trim().parse().unwrap_or(1);
    param.logger.info(format!("sleeping for {secs}s")).await;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(secs)) => {
            param.logger.info("done sleeping").await;
            Ok(())
        }
        _ = ctx.cancelled() => {
            param.logger.warning("sleep cancelled").await;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::try_get_config()?;
    let dispatch_endpoint = args
        .dispatch_endpoint
        .unwrap_or_else(|| format!("http://{}", config.dispatch_grpc_addr));

    let sink = GrpcDispatchSink::connect(dispatch_endpoint.clone()).await?;
    info!(endpoint = %dispatch_endpoint, "connected to dispatch");

    let registry = EtcdRegistry::connect(&config.etcd_endpoints, &config.registry_prefix).await?;

    let mut worker_config = WorkerConfig::new(&args.service_name);
    worker_config.bind_addr = args.grpc_addr.unwrap_or(config.worker_grpc_addr);
    worker_config.multi_instance = !args.single_instance;
    worker_config.lease_ttl = Duration::from_secs(config.lease_ttl_secs);
    worker_config.retry = RetryPolicy {
        attempts: config.status_retry_attempts,
        base_delay: Duration::from_millis(config.status_retry_base_ms),
    };

    let worker = Worker::new(worker_config, Arc::new(sink));
    worker.register_task("echo", echo);
    worker.register_task("sleep", sleep);

    let handle = worker.start(Arc::new(registry)).await?;
    info!(
        addr = %handle.addr(),
        worker_id = %handle.worker_id(),
        "worker started, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.stop().await;

    Ok(())
}
