//! Scheduler binary: wires an in-memory [`mr_registry::InMemoryRegistry`], the
//! [`mr_allocator::Allocator`] and the [`mr_grid::GridQueue`] behind the
//! `SchedulerService` gRPC surface.
//!
//! Cloud instance launching is out of scope (§1 of the specification): this binary's
//! [`NoCloudLauncher`] logs and reports zero instances launched, so Phase B always
//! falls through to `NoSuitableShape`/`PartialAllocation` unless every worker can be
//! placed on instances a caller already `RegisterInstance`d.

use std::net::SocketAddr;
use std::sync::Arc;

use mr_allocator::{Allocator, InstanceLauncher};
use mr_grid::{GridQueue, InMemoryObjectStore};
use mr_instance_selector::{Catalog, InstanceTypeInfo};
use mr_registry::InMemoryRegistry;
use mr_scheduler::grpc::start_grpc_server;
use mr_scheduler::AllocatorService;
use mr_sweeper::file_liveness::FileLivenessCheck;
use mr_sweeper::{InstanceTerminator, Sweeper};

struct NoCloudLauncher;

#[async_trait::async_trait]
impl InstanceLauncher for NoCloudLauncher {
    async fn launch(&self, shape: &InstanceTypeInfo, count: u32) -> Vec<String> {
        tracing::warn!(
            shape = %shape.name,
            count,
            "cloud instance launching is out of scope for this binary; returning none"
        );
        Vec::new()
    }
}

struct NoCloudTerminator;

#[async_trait::async_trait]
impl InstanceTerminator for NoCloudTerminator {
    async fn terminate(&self, instance_address: &str) {
        tracing::warn!(
            instance_address,
            "cloud instance termination is out of scope for this binary; registry entry removed without shutting down the VM"
        );
    }
}

/// Runs [`Sweeper::sweep_once`] on a fixed interval until the process exits.
async fn run_sweeper(sweeper: Arc<Sweeper>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let report = sweeper.sweep_once().await;
        if report.jobs_reclaimed > 0 || report.instances_terminated > 0 {
            tracing::info!(
                jobs_reclaimed = report.jobs_reclaimed,
                instances_terminated = report.instances_terminated,
                "sweep pass complete"
            );
        }
    }
}

fn load_catalog() -> Catalog {
    if let Ok(path) = std::env::var("MR_CATALOG_PATH") {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Vec<InstanceTypeInfo>>(&contents) {
                Ok(shapes) => return Catalog::new(shapes),
                Err(e) => tracing::error!(%path, error = %e, "failed to parse MR_CATALOG_PATH"),
            },
            Err(e) => tracing::error!(%path, error = %e, "failed to read MR_CATALOG_PATH"),
        }
    }
    tracing::info!("MR_CATALOG_PATH not set or unreadable; starting with an empty catalog");
    Catalog::new(Vec::new())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("starting mr-scheduler");

    let registry: Arc<dyn mr_registry::Registry> = Arc::new(InMemoryRegistry::new());
    let catalog = load_catalog();
    let launcher = Arc::new(NoCloudLauncher);

    let phase_a_retries: usize = std::env::var("MR_ALLOCATOR_PHASE_A_RETRIES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3);
    let allocator = Arc::new(
        Allocator::new(registry.clone(), catalog, launcher).with_phase_a_retries(phase_a_retries),
    );

    let grid_retry_ceiling: u32 = std::env::var("MR_GRID_RETRY_CEILING")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3);
    let grid = Arc::new(GridQueue::new(
        Arc::new(InMemoryObjectStore::new()),
        grid_retry_ceiling,
    ));

    let liveness_dir = std::env::var("MR_LIVENESS_DIR")
        .unwrap_or_else(|_| "/tmp/meadowrun-liveness".to_string());
    let sweeper = Arc::new(Sweeper::new(
        registry.clone(),
        Arc::new(FileLivenessCheck::new(liveness_dir)),
        Arc::new(NoCloudTerminator),
    ));
    let sweep_interval_secs: u64 = std::env::var("MR_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);
    tokio::spawn(run_sweeper(
        sweeper,
        std::time::Duration::from_secs(sweep_interval_secs),
    ));

    let service = AllocatorService::new(registry, allocator, grid, grid_retry_ceiling);

    let addr: SocketAddr = std::env::var("MR_SCHEDULER_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:50051".to_string())
        .parse()?;

    start_grpc_server(service, addr).await?;
    Ok(())
}
