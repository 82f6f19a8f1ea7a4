//! gRPC server implementation for the Meadowrun scheduler.
//!
//! Implements `SchedulerService` from `proto/meadowrun.proto` over the
//! [`crate::AllocatorService`] state, translating wire messages to/from the
//! `mr-instance-selector` / `mr-registry` / `mr-dispatch` / `mr-grid` core types.

use std::collections::HashMap;

use chrono::Utc;
use mr_dispatch::{ProcessState as CoreProcessState, ProcessStateKind};
use mr_instance_selector::Resources as CoreResources;
use tonic::{transport::Server, Request, Response, Status};
use tracing::{info, warn};

use crate::AllocatorService;

pub mod proto {
    tonic::include_proto!("meadowrun");
}

use proto::scheduler_service_server::{SchedulerService, SchedulerServiceServer};
use proto::*;

fn resources_from_proto(r: proto::Resources) -> CoreResources {
    let mut resources = CoreResources::new(r.memory_gb, r.logical_cpu);
    for (name, amount) in r.custom {
        resources = resources.with_custom(name, amount);
    }
    resources
}

fn process_state_kind_from_proto(state: i32) -> ProcessStateKind {
    match process_state::ProcessStateEnum::try_from(state).unwrap_or_default() {
        process_state::ProcessStateEnum::RunRequested => ProcessStateKind::RunRequested,
        process_state::ProcessStateEnum::Running => ProcessStateKind::Running,
        process_state::ProcessStateEnum::Succeeded => ProcessStateKind::Succeeded,
        process_state::ProcessStateEnum::RunRequestFailed => ProcessStateKind::RunRequestFailed,
        process_state::ProcessStateEnum::PythonException => ProcessStateKind::PythonException,
        process_state::ProcessStateEnum::NonZeroReturnCode => ProcessStateKind::NonZeroReturnCode,
        process_state::ProcessStateEnum::ResourcesNotAvailable => {
            ProcessStateKind::ResourcesNotAvailable
        }
        process_state::ProcessStateEnum::ErrorGettingState => ProcessStateKind::ErrorGettingState,
        process_state::ProcessStateEnum::Unknown | process_state::ProcessStateEnum::Default => {
            ProcessStateKind::Unknown
        }
    }
}

fn process_state_kind_to_proto(kind: ProcessStateKind) -> process_state::ProcessStateEnum {
    match kind {
        ProcessStateKind::RunRequested => process_state::ProcessStateEnum::RunRequested,
        ProcessStateKind::Running => process_state::ProcessStateEnum::Running,
        ProcessStateKind::Succeeded => process_state::ProcessStateEnum::Succeeded,
        ProcessStateKind::RunRequestFailed => process_state::ProcessStateEnum::RunRequestFailed,
        ProcessStateKind::PythonException => process_state::ProcessStateEnum::PythonException,
        ProcessStateKind::NonZeroReturnCode => process_state::ProcessStateEnum::NonZeroReturnCode,
        ProcessStateKind::ResourcesNotAvailable => {
            process_state::ProcessStateEnum::ResourcesNotAvailable
        }
        ProcessStateKind::ErrorGettingState => process_state::ProcessStateEnum::ErrorGettingState,
        ProcessStateKind::Unknown => process_state::ProcessStateEnum::Unknown,
    }
}

fn process_state_from_proto(p: proto::ProcessState) -> CoreProcessState {
    CoreProcessState {
        state: process_state_kind_from_proto(p.state),
        pid: (p.pid != 0).then_some(p.pid as u32),
        container_id: (!p.container_id.is_empty()).then_some(p.container_id),
        log_file_name: (!p.log_file_name.is_empty()).then_some(p.log_file_name),
        pickled_result: (!p.pickled_result.is_empty()).then_some(p.pickled_result),
        return_code: Some(p.return_code),
        python_exception: None,
    }
}

fn process_state_to_proto(p: &CoreProcessState) -> proto::ProcessState {
    proto::ProcessState {
        state: process_state_kind_to_proto(p.state) as i32,
        pid: p.pid.unwrap_or(0) as i32,
        container_id: p.container_id.clone().unwrap_or_default(),
        log_file_name: p.log_file_name.clone().unwrap_or_default(),
        pickled_result: p.pickled_result.clone().unwrap_or_default(),
        return_code: p.return_code.unwrap_or(0),
    }
}

#[tonic::async_trait]
impl SchedulerService for AllocatorService {
    async fn register_instance(
        &self,
        request: Request<RegisterInstanceRequest>,
    ) -> Result<Response<RegisterInstanceResponse>, Status> {
        let req = request.into_inner();
        let total_resources = req
            .total_resources
            .map(resources_from_proto)
            .ok_or_else(|| Status::invalid_argument("total_resources is required"))?;

        info!(address = %req.public_address, "registering instance");

        match self
            .registry
            .register(req.public_address.clone(), total_resources, vec![], Utc::now())
            .await
        {
            Ok(()) => Ok(Response::new(RegisterInstanceResponse {
                success: true,
                message: format!("{} registered", req.public_address),
            })),
            Err(e) => {
                warn!(address = %req.public_address, error = %e, "register_instance failed");
                Ok(Response::new(RegisterInstanceResponse {
                    success: false,
                    message: e.to_string(),
                }))
            }
        }
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let req = request.into_inner();
        let resources_per_worker = req
            .resources_per_worker
            .map(resources_from_proto)
            .ok_or_else(|| Status::invalid_argument("resources_per_worker is required"))?;

        info!(
            num_workers = req.num_workers,
            ceiling = req.interruption_probability_ceiling_percent,
            "allocate"
        );

        let (allocated, allocated_count, requested) = match self
            .allocator
            .allocate(
                resources_per_worker,
                req.num_workers,
                req.interruption_probability_ceiling_percent,
            )
            .await
        {
            Ok(map) => {
                let count = map.values().map(|v| v.len() as u32).sum();
                (map, count, req.num_workers)
            }
            Err(mr_allocator::AllocatorError::PartialAllocation {
                partial,
                allocated,
                requested,
            }) => (partial, allocated, requested),
            Err(e) => return Err(Status::resource_exhausted(e.to_string())),
        };

        let allocated = allocated
            .into_iter()
            .map(|(address, job_ids)| (address, JobIdList { job_ids }))
            .collect::<HashMap<_, _>>();

        Ok(Response::new(AllocateResponse {
            allocated,
            requested,
            allocated_count,
        }))
    }

    async fn report_job_state(
        &self,
        request: Request<ReportJobStateRequest>,
    ) -> Result<Response<ReportJobStateResponse>, Status> {
        let update = request
            .into_inner()
            .update
            .ok_or_else(|| Status::invalid_argument("update is required"))?;
        let process_state = update
            .process_state
            .map(process_state_from_proto)
            .ok_or_else(|| Status::invalid_argument("process_state is required"))?;

        let mut acknowledged = true;
        if process_state.is_terminal() {
            info!(
                job_id = %update.job_id,
                address = %update.instance_address,
                "job reached terminal state, deallocating"
            );
            if let Err(e) = self
                .registry
                .deallocate(&update.instance_address, &update.job_id, Utc::now())
                .await
            {
                warn!(job_id = %update.job_id, error = %e, "deallocate on terminal state failed");
                acknowledged = false;
            }
        }

        Ok(Response::new(ReportJobStateResponse { acknowledged }))
    }

    async fn submit_grid_job(
        &self,
        request: Request<SubmitGridJobRequest>,
    ) -> Result<Response<SubmitGridJobResponse>, Status> {
        let req = request.into_inner();
        let num_tasks = req.pickled_args.len() as u32;
        let job_id = self.grid.submit(req.pickled_args).await;
        info!(%job_id, num_tasks, "grid job submitted");
        Ok(Response::new(SubmitGridJobResponse { job_id, num_tasks }))
    }

    async fn get_cluster_status(
        &self,
        _request: Request<ClusterStatusRequest>,
    ) -> Result<Response<ClusterStatusResponse>, Status> {
        let records = self.registry.scan().await;
        let total_running_jobs = records.iter().map(|r| r.running_jobs.len() as u32).sum();
        Ok(Response::new(ClusterStatusResponse {
            total_instances: records.len() as u32,
            total_running_jobs,
        }))
    }

    async fn next_grid_task(
        &self,
        request: Request<NextGridTaskRequest>,
    ) -> Result<Response<NextGridTaskResponse>, Status> {
        let req = request.into_inner();
        let task = self
            .grid
            .next_task(&req.job_id)
            .await
            .map_err(|e| Status::not_found(e.to_string()))?;

        Ok(Response::new(match task {
            Some((task_id, attempt, arg)) => NextGridTaskResponse {
                has_task: true,
                task_id,
                attempt,
                arg,
            },
            None => NextGridTaskResponse {
                has_task: false,
                task_id: 0,
                attempt: 0,
                arg: Vec::new(),
            },
        }))
    }

    async fn complete_grid_task(
        &self,
        request: Request<CompleteGridTaskRequest>,
    ) -> Result<Response<CompleteGridTaskResponse>, Status> {
        let req = request.into_inner();
        let process_state = req
            .process_state
            .map(process_state_from_proto)
            .ok_or_else(|| Status::invalid_argument("process_state is required"))?;

        self.grid
            .complete(&req.job_id, req.task_id, req.attempt, process_state)
            .await
            .map_err(|e| Status::failed_precondition(e.to_string()))?;

        Ok(Response::new(CompleteGridTaskResponse { acknowledged: true }))
    }

    async fn poll_grid_results(
        &self,
        request: Request<PollGridResultsRequest>,
    ) -> Result<Response<PollGridResultsResponse>, Status> {
        let req = request.into_inner();
        let results = self
            .grid
            .poll_results(&req.job_id)
            .await
            .into_iter()
            .map(|(task_id, attempt, state)| GridResult {
                task_id,
                attempt,
                process_state: Some(process_state_to_proto(&state)),
            })
            .collect();

        Ok(Response::new(PollGridResultsResponse { results }))
    }
}

/// Starts the gRPC server. Blocks until the server shuts down.
pub async fn start_grpc_server(
    service: AllocatorService,
    addr: std::net::SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(%addr, "starting scheduler gRPC server");
    Server::builder()
        .add_service(SchedulerServiceServer::new(service))
        .serve(addr)
        .await?;
    Ok(())
}
