//! Scheduler service: wires the [`mr_registry::Registry`], [`mr_allocator::Allocator`]
//! and [`mr_grid::GridQueue`] behind the `SchedulerService` gRPC surface defined in
//! `proto/meadowrun.proto`. This replaces the teacher's `EconomicScheduler` — a
//! single-node cost-per-hour placement heuristic — with the real bin-packing
//! allocator; the `Arc<Mutex<HashMap<..>>>`-backed node/job-state bookkeeping is gone,
//! superseded by the Registry's per-record CAS semantics.

pub mod grpc;

use std::sync::Arc;

use mr_allocator::Allocator;
use mr_grid::{GridQueue, InMemoryObjectStore};
use mr_registry::Registry;

/// The service's in-process state: every gRPC method is a thin translation layer
/// over these three components.
pub struct AllocatorService {
    pub registry: Arc<dyn Registry>,
    pub allocator: Arc<Allocator>,
    pub grid: Arc<GridQueue<InMemoryObjectStore>>,
    pub grid_retry_ceiling: u32,
}

impl AllocatorService {
    pub fn new(
        registry: Arc<dyn Registry>,
        allocator: Arc<Allocator>,
        grid: Arc<GridQueue<InMemoryObjectStore>>,
        grid_retry_ceiling: u32,
    ) -> Self {
        Self {
            registry,
            allocator,
            grid,
            grid_retry_ceiling,
        }
    }
}
