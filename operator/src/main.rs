//! Shardkeeper Kubernetes Operator
//!
//! Reconciles RedisCluster resources into sharded Redis clusters.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use shardkeeper::config::{OperatorConfig, PVC_TEMPLATE_ENV};
use shardkeeper::node::{ExecTransport, NodeTransport, RespTransport, RoutingTransport};
use shardkeeper::platform::kubernetes::KubePlatform;
use shardkeeper::platform::Platform;
use shardkeeper::TopologyController;

mod controller;
mod error;
mod metrics;

use controller::{Context, Controller};
use metrics::Metrics;

#[derive(Parser, Debug)]
#[command(name = "shardkeeper-operator")]
#[command(about = "Kubernetes Operator for sharded Redis clusters")]
struct Args {
    /// Namespace to watch (empty for all namespaces)
    #[arg(short, long, default_value = "")]
    namespace: String,

    /// Metrics server port
    #[arg(short, long, default_value = "8080")]
    metrics_port: u16,

    /// Health check port
    #[arg(short = 'H', long, default_value = "8081")]
    health_port: u16,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Operator configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Claim template name used when cleaning up storage claims
    #[arg(long, env = PVC_TEMPLATE_ENV)]
    pvc_template_name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Shardkeeper operator");
    info!(namespace = %args.namespace, "Watching namespace");

    let mut config = match &args.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::default(),
    };
    if let Some(name) = args.pvc_template_name.as_deref().map(str::trim) {
        if !name.is_empty() {
            config.pvc_template_name = Some(name.to_string());
        }
    }
    config.validate()?;

    let metrics = Arc::new(Metrics::new()?);
    let client = Client::try_default().await?;

    let platform: Arc<dyn Platform> =
        Arc::new(KubePlatform::new(client.clone(), config.field_manager.clone()));
    let transport: Arc<dyn NodeTransport> = Arc::new(RoutingTransport::new(
        Arc::new(RespTransport::new()),
        Arc::new(ExecTransport::new(platform.clone(), config.admin_binary.clone())),
    ));
    let engine = TopologyController::new(platform, transport, config);

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::run_metrics_server(args.metrics_port, metrics.clone()));

    // Start health server
    let health_handle = tokio::spawn(run_health_server(args.health_port));

    let controller = Controller::new(client, args.namespace, Context { engine, metrics });
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!(error = %e, "Cluster controller error");
        }
    });

    info!("Controller started");

    tokio::select! {
        _ = controller_handle => info!("Cluster controller stopped"),
        result = metrics_handle => log_server_exit("Metrics", result),
        result = health_handle => log_server_exit("Health", result),
    }

    Ok(())
}

fn log_server_exit(server: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!(server = %server, "Server stopped"),
        Ok(Err(e)) => error!(server = %server, error = %e, "Server failed"),
        Err(e) => error!(server = %server, error = %e, "Server task aborted"),
    }
}

async fn run_health_server(port: u16) -> std::io::Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Health server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let response = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}
