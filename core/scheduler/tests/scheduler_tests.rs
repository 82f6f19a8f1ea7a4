//! Integration tests for the scheduler's gRPC surface, driven directly against the
//! `SchedulerService` trait impl (no network socket) the way `tonic` services are
//! typically exercised in-process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mr_allocator::{Allocator, InstanceLauncher};
use mr_grid::{GridQueue, InMemoryObjectStore};
use mr_instance_selector::{Catalog, InstanceTypeInfo, OnDemandOrSpot};
use mr_registry::InMemoryRegistry;
use mr_scheduler::grpc::proto::scheduler_service_server::SchedulerService;
use mr_scheduler::grpc::proto::{self, *};
use mr_scheduler::AllocatorService;
use tonic::Request;

struct CountingLauncher {
    next: AtomicUsize,
}

#[async_trait::async_trait]
impl InstanceLauncher for CountingLauncher {
    async fn launch(&self, _shape: &InstanceTypeInfo, count: u32) -> Vec<String> {
        (0..count)
            .map(|_| format!("10.0.0.{}", self.next.fetch_add(1, Ordering::SeqCst)))
            .collect()
    }
}

fn service_with_shape() -> AllocatorService {
    let registry: Arc<dyn mr_registry::Registry> = Arc::new(InMemoryRegistry::new());
    let catalog = Catalog::new(vec![InstanceTypeInfo {
        name: "m.small".to_string(),
        logical_cpu: 4,
        memory_gb: 8.0,
        price_per_hour: 0.1,
        interruption_probability_percent: 5.0,
        on_demand_or_spot: OnDemandOrSpot::OnDemand,
    }]);
    let launcher = Arc::new(CountingLauncher {
        next: AtomicUsize::new(0),
    });
    let allocator = Arc::new(Allocator::new(registry.clone(), catalog, launcher));
    let grid = Arc::new(GridQueue::new(Arc::new(InMemoryObjectStore::new()), 3));
    AllocatorService::new(registry, allocator, grid, 3)
}

fn resources(memory_gb: f64, logical_cpu: u32) -> proto::Resources {
    proto::Resources {
        memory_gb,
        logical_cpu,
        custom: Default::default(),
    }
}

fn succeeded_process_state() -> proto::ProcessState {
    proto::ProcessState {
        state: process_state::ProcessStateEnum::Succeeded as i32,
        pid: 0,
        container_id: String::new(),
        log_file_name: String::new(),
        pickled_result: Vec::new(),
        return_code: 0,
    }
}

#[tokio::test]
async fn test_register_then_allocate_reuses_the_instance() {
    let svc = service_with_shape();

    let register = svc
        .register_instance(Request::new(RegisterInstanceRequest {
            public_address: "10.0.0.99".to_string(),
            total_resources: Some(resources(8.0, 4)),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(register.success);

    let allocated = svc
        .allocate(Request::new(AllocateRequest {
            resources_per_worker: Some(resources(2.0, 1)),
            num_workers: 1,
            interruption_probability_ceiling_percent: 80.0,
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(allocated.allocated_count, 1);
    assert!(allocated.allocated.contains_key("10.0.0.99"));
}

#[tokio::test]
async fn test_allocate_launches_a_new_instance_when_pool_is_empty() {
    let svc = service_with_shape();

    let allocated = svc
        .allocate(Request::new(AllocateRequest {
            resources_per_worker: Some(resources(2.0, 1)),
            num_workers: 1,
            interruption_probability_ceiling_percent: 80.0,
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(allocated.allocated_count, 1);
    assert_eq!(allocated.allocated.len(), 1);
}

#[tokio::test]
async fn test_report_terminal_job_state_deallocates_and_frees_the_slot() {
    let svc = service_with_shape();
    let allocated = svc
        .allocate(Request::new(AllocateRequest {
            resources_per_worker: Some(resources(2.0, 1)),
            num_workers: 1,
            interruption_probability_ceiling_percent: 80.0,
        }))
        .await
        .unwrap()
        .into_inner();
    let (address, job_ids) = allocated.allocated.into_iter().next().unwrap();
    let job_id = job_ids.job_ids.into_iter().next().unwrap();

    let ack = svc
        .report_job_state(Request::new(ReportJobStateRequest {
            update: Some(JobStateUpdate {
                instance_address: address.clone(),
                job_id,
                process_state: Some(succeeded_process_state()),
            }),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(ack.acknowledged);

    let status = svc
        .get_cluster_status(Request::new(ClusterStatusRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.total_running_jobs, 0);
}

#[tokio::test]
async fn test_grid_job_round_trip_through_next_task_and_complete() {
    let svc = service_with_shape();

    let submitted = svc
        .submit_grid_job(Request::new(SubmitGridJobRequest {
            pickled_args: vec![b"10".to_vec(), b"20".to_vec(), b"30".to_vec()],
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(submitted.num_tasks, 3);

    let mut task_ids = Vec::new();
    loop {
        let next = svc
            .next_grid_task(Request::new(NextGridTaskRequest {
                job_id: submitted.job_id.clone(),
            }))
            .await
            .unwrap()
            .into_inner();
        if !next.has_task {
            break;
        }
        task_ids.push(next.task_id);
        svc.complete_grid_task(Request::new(CompleteGridTaskRequest {
            job_id: submitted.job_id.clone(),
            task_id: next.task_id,
            attempt: next.attempt,
            process_state: Some(succeeded_process_state()),
        }))
        .await
        .unwrap();
    }
    task_ids.sort();
    assert_eq!(task_ids, vec![0, 1, 2]);

    let results = svc
        .poll_grid_results(Request::new(PollGridResultsRequest {
            job_id: submitted.job_id,
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(results.results.len(), 3);
}
