//! GPU Node Driver
//!
//! Node-local agent of the GPU allocation driver. Keeps this node's
//! NodeAllocationState record consistent with the claims assigned to the
//! node, reserves devices for prepared claims, and continuously cleans up
//! claims deallocated without notification.

use clap::Parser;
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gpu_node_driver::{
    AllocationStore, ApiServer, ApiServerConfig, DiscoveryConfig, Driver, DriverConfig, Error,
    GpuDeviceState, GpuDiscovery, KubeAllocationStore, MemoryAllocationStore, NodeAllocationState,
    Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// GPU Node Driver - node-local claim preparation and reconciliation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this driver runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Directory for generated CDI spec files
    #[arg(long, env = "CDI_ROOT", default_value = "/var/run/cdi")]
    cdi_root: PathBuf,

    /// JSON GPU inventory file overriding procfs discovery
    #[arg(long, env = "GPU_INVENTORY")]
    inventory_file: Option<PathBuf>,

    /// Claim API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Attempts per conflict-retried record update
    #[arg(long, env = "UPDATE_RETRY_BUDGET", default_value = "5")]
    update_retry_budget: usize,

    /// Unprepare claims synchronously instead of deferring to reconciliation
    #[arg(long, env = "SYNCHRONOUS_UNPREPARE")]
    synchronous_unprepare: bool,

    /// Run with an in-memory allocation record (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Print the NodeAllocationState CRD manifest and exit
    #[arg(long)]
    print_crd: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        let crd = serde_yaml::to_string(&NodeAllocationState::crd())
            .map_err(|e| Error::Internal(format!("Failed to render CRD: {}", e)))?;
        println!("{}", crd);
        return Ok(());
    }

    init_logging(&args);

    info!("Starting GPU Node Driver");
    info!("  Version: {}", gpu_node_driver::VERSION);
    info!("  Node: {}", args.node_name);
    info!("  Claim API: {}", args.api_addr);
    info!("  CDI root: {:?}", args.cdi_root);
    info!("  Standalone mode: {}", args.standalone);

    // Discover this node's GPUs
    let discovery = GpuDiscovery::new(DiscoveryConfig {
        inventory_file: args.inventory_file.clone(),
        ..Default::default()
    });
    let gpus = discovery.discover()?;
    if gpus.is_empty() {
        warn!("No GPUs discovered; claims naming devices will fail to prepare");
    }

    let devices = Arc::new(GpuDeviceState::new(gpus, &args.cdi_root));

    // Open the allocation record store
    let store: Arc<dyn AllocationStore> = if args.standalone {
        info!("Using in-memory allocation record");
        Arc::new(MemoryAllocationStore::new(&args.node_name))
    } else {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| Error::Configuration(format!("Failed to build kube client: {}", e)))?;
        Arc::new(KubeAllocationStore::new(client, &args.node_name))
    };

    // Bring up the driver; this blocks until the record is Ready and the
    // reconciliation loop is running
    let (driver, reconciler) = Driver::start(
        store,
        devices,
        DriverConfig {
            retry_budget: args.update_retry_budget,
        },
    )
    .await?;
    info!("Driver initialized, allocation record is Ready");

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Create and run the claim API server
    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid claim API address: {}", e)))?,
        synchronous_unprepare: args.synchronous_unprepare,
    };

    let api_server = Arc::new(ApiServer::new(api_config, driver.clone()));

    let signal_server = api_server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_server.shutdown();
        }
    });

    info!("Starting claim API server");
    api_server.run().await?;

    // Stop reconciliation deterministically, then mark the record NotReady.
    // Devices stay reserved; the record keeps the true prepared set for the
    // next instance to reconstruct from.
    reconciler.stop().await;
    if let Err(e) = driver.shutdown().await {
        error!("Failed to mark allocation record NotReady: {}", e);
    }

    info!("Driver shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap())
        .add_directive("axum=info".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
