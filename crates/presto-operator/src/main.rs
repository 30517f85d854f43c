//! Presto Kubernetes Operator
//!
//! This operator manages Presto custom resources in Kubernetes,
//! deploying and tracking Presto distributed SQL clusters.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use presto_operator::{controller, crd, health, webhook};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Presto Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "presto-operator")]
#[command(about = "Kubernetes operator for Presto distributed SQL clusters")]
#[command(version)]
struct Args {
    /// Seconds between status refreshes of every known cluster
    #[arg(long, env = "STATUS_UPDATE_INTERVAL", default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    status_update_interval: u64,

    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health endpoint address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Admission webhook address (disabled when unset)
    #[arg(long, env = "WEBHOOK_ADDR")]
    webhook_addr: Option<SocketAddr>,

    /// PEM certificate chain served by the admission webhook
    #[arg(long, env = "WEBHOOK_CERT_FILE", default_value = "/certs/tls.crt")]
    webhook_cert: PathBuf,

    /// PEM private key for the webhook certificate
    #[arg(long, env = "WEBHOOK_KEY_FILE", default_value = "/certs/tls.key")]
    webhook_key: PathBuf,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        status_update_interval = args.status_update_interval,
        "Starting Presto Kubernetes Operator"
    );

    // Initialize metrics
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    // Start health server
    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    // Start admission webhook
    if let Some(webhook_addr) = args.webhook_addr {
        let (cert, key) = (args.webhook_cert.clone(), args.webhook_key.clone());
        tokio::spawn(async move {
            if let Err(e) = webhook::serve(webhook_addr, &cert, &key).await {
                tracing::error!(error = %e, "Admission webhook failed");
            }
        });
    }

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Parse namespace (empty string means cluster-wide)
    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace)
    };

    // Run the controller
    controller::run_controller(
        client,
        namespace,
        Duration::from_secs(args.status_update_interval),
    )
    .await
    .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    // Keep the server running
    std::future::pending::<()>().await;

    Ok(())
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = crd::Presto::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}
