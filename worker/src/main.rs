//! Meadowrun Worker Agent
//!
//! Runs on an allocated instance to:
//! - execute a dispatched job in a container and write its terminal `ProcessState` to
//!   the host-side liveness file the sweeper reads (`MR_JOB_FILE` mode), or
//! - poll the scheduler's grid-task queue, run each task in a container, and report
//!   results back (`MR_GRID_JOB_ID` mode).

mod executor;
mod liveness;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use executor::JobExecutor;
use mr_dispatch::Job;
use tracing::{error, info, warn};

#[allow(dead_code)]
mod proto {
    tonic::include_proto!("meadowrun");
}

use proto::scheduler_service_client::SchedulerServiceClient;
use proto::{CompleteGridTaskRequest, NextGridTaskRequest};

fn process_state_kind_to_proto(
    kind: mr_dispatch::ProcessStateKind,
) -> proto::process_state::ProcessStateEnum {
    use mr_dispatch::ProcessStateKind as K;
    use proto::process_state::ProcessStateEnum as P;
    match kind {
        K::RunRequested => P::RunRequested,
        K::Running => P::Running,
        K::Succeeded => P::Succeeded,
        K::RunRequestFailed => P::RunRequestFailed,
        K::PythonException => P::PythonException,
        K::NonZeroReturnCode => P::NonZeroReturnCode,
        K::ResourcesNotAvailable => P::ResourcesNotAvailable,
        K::ErrorGettingState => P::ErrorGettingState,
        K::Unknown => P::Unknown,
    }
}

fn process_state_to_proto(state: &mr_dispatch::ProcessState) -> proto::ProcessState {
    proto::ProcessState {
        state: process_state_kind_to_proto(state.state) as i32,
        pid: state.pid.unwrap_or(0) as i32,
        container_id: state.container_id.clone().unwrap_or_default(),
        log_file_name: state.log_file_name.clone().unwrap_or_default(),
        pickled_result: state.pickled_result.clone().unwrap_or_default(),
        return_code: state.return_code.unwrap_or(0),
    }
}

/// Runs a single dispatched job read from `MR_JOB_FILE`, writing the liveness file
/// before and after so the sweeper can observe `Running` even if the worker crashes
/// mid-execution.
async fn run_job_mode(
    executor: &JobExecutor,
    job_file: PathBuf,
    liveness_dir: PathBuf,
    instance_address: String,
) -> Result<()> {
    let contents = tokio::fs::read_to_string(&job_file)
        .await
        .with_context(|| format!("failed to read job file {}", job_file.display()))?;
    let job: Job = serde_json::from_str(&contents).context("failed to parse job file")?;

    info!(job_id = %job.job_id, "starting dispatched job");

    let running_state = mr_dispatch::ProcessState {
        state: mr_dispatch::ProcessStateKind::Running,
        pid: None,
        container_id: None,
        log_file_name: None,
        pickled_result: None,
        return_code: None,
        python_exception: None,
    };
    liveness::write_liveness(&liveness_dir, &instance_address, &job.job_id, &running_state).await?;

    let final_state = executor.execute_job(&job).await;
    liveness::write_liveness(&liveness_dir, &instance_address, &job.job_id, &final_state).await?;

    info!(job_id = %job.job_id, state = ?final_state.state, "job finished");
    Ok(())
}

/// Polls `NextGridTask` in a loop, executes each task in `MR_GRID_TASK_IMAGE`, and
/// reports the result via `CompleteGridTask`. Exits once the scheduler reports no more
/// tasks for two consecutive polls.
async fn run_grid_mode(
    executor: &JobExecutor,
    scheduler_url: String,
    job_id: String,
    task_image: String,
) -> Result<()> {
    let mut client = SchedulerServiceClient::connect(scheduler_url.clone())
        .await
        .with_context(|| format!("failed to connect to scheduler at {scheduler_url}"))?;

    let mut consecutive_empty_polls = 0u32;
    loop {
        let response = client
            .next_grid_task(NextGridTaskRequest {
                job_id: job_id.clone(),
            })
            .await?
            .into_inner();

        if !response.has_task {
            consecutive_empty_polls += 1;
            if consecutive_empty_polls >= 2 {
                info!(%job_id, "no more grid tasks, worker exiting");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            continue;
        }
        consecutive_empty_polls = 0;

        info!(%job_id, task_id = response.task_id, attempt = response.attempt, "running grid task");
        let process_state = executor.execute_grid_task(&task_image, &response.arg).await;

        if let Err(e) = client
            .complete_grid_task(CompleteGridTaskRequest {
                job_id: job_id.clone(),
                task_id: response.task_id,
                attempt: response.attempt,
                process_state: Some(process_state_to_proto(&process_state)),
            })
            .await
        {
            warn!(%job_id, task_id = response.task_id, error = %e, "failed to report grid task result");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let instance_address =
        std::env::var("MR_INSTANCE_ADDRESS").unwrap_or_else(|_| "worker-1".to_string());
    let scheduler_url = std::env::var("MR_SCHEDULER_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:50051".to_string());
    let liveness_dir = std::env::var("MR_LIVENESS_DIR")
        .unwrap_or_else(|_| "/tmp/meadowrun-liveness".to_string());

    info!("starting Meadowrun worker agent");
    info!(instance_address = %instance_address, scheduler_url = %scheduler_url, "configuration loaded");

    let executor = JobExecutor::new().context("failed to initialize job executor")?;

    if let Ok(job_file) = std::env::var("MR_JOB_FILE") {
        return run_job_mode(
            &executor,
            PathBuf::from(job_file),
            PathBuf::from(liveness_dir),
            instance_address,
        )
        .await;
    }

    if let Ok(grid_job_id) = std::env::var("MR_GRID_JOB_ID") {
        let task_image = std::env::var("MR_GRID_TASK_IMAGE")
            .context("MR_GRID_TASK_IMAGE is required when MR_GRID_JOB_ID is set")?;
        return run_grid_mode(&executor, scheduler_url, grid_job_id, task_image).await;
    }

    error!("neither MR_JOB_FILE nor MR_GRID_JOB_ID set; nothing to do");
    Ok(())
}
