//! Meadowrun CLI - debugging/demo client for the `mr-scheduler` gRPC surface.
//!
//! Exercises every `SchedulerService` RPC directly: register an instance, allocate
//! workers, report a job's terminal state, submit a grid job, and poll its results.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tonic::Request;
use tracing::info;

pub mod proto {
    tonic::include_proto!("meadowrun");
}

use proto::scheduler_service_client::SchedulerServiceClient;
use proto::{
    AllocateRequest, ClusterStatusRequest, CompleteGridTaskRequest, JobStateUpdate,
    NextGridTaskRequest, PollGridResultsRequest, ProcessState, RegisterInstanceRequest,
    ReportJobStateRequest, Resources, SubmitGridJobRequest,
};

#[derive(Parser)]
#[command(name = "mr-cli")]
#[command(about = "Meadowrun CLI - exercise the scheduler's gRPC surface", long_about = None)]
struct Cli {
    /// Scheduler address
    #[arg(short, long, default_value = "http://127.0.0.1:50051")]
    scheduler: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an instance with the allocation registry
    RegisterInstance {
        #[arg(long)]
        address: String,
        #[arg(long, default_value = "8")]
        memory_gb: f64,
        #[arg(long, default_value = "4")]
        logical_cpu: u32,
    },

    /// Allocate workers, reusing registered instances or requesting new ones
    Allocate {
        #[arg(long, default_value = "2")]
        memory_gb: f64,
        #[arg(long, default_value = "1")]
        logical_cpu: u32,
        #[arg(long, default_value = "1")]
        num_workers: u32,
        #[arg(long, default_value = "100")]
        interruption_ceiling_percent: f64,
    },

    /// Report a job's terminal state, freeing its allocation slot
    ReportJobState {
        #[arg(long)]
        instance_address: String,
        #[arg(long)]
        job_id: String,
        /// One of: succeeded, run-request-failed, python-exception, non-zero-return-code
        #[arg(long, default_value = "succeeded")]
        state: String,
    },

    /// Submit a grid job from a list of UTF-8 task arguments
    SubmitGridJob {
        /// Task arguments, one per task
        #[arg(long, num_args = 1..)]
        args: Vec<String>,
    },

    /// Pull the next grid task for a job
    NextGridTask {
        #[arg(long)]
        job_id: String,
    },

    /// Report a grid task's completion
    CompleteGridTask {
        #[arg(long)]
        job_id: String,
        #[arg(long)]
        task_id: u32,
        #[arg(long)]
        attempt: u32,
        #[arg(long, default_value = "succeeded")]
        state: String,
    },

    /// Poll the accumulated results for a grid job
    PollGridResults {
        #[arg(long)]
        job_id: String,
    },

    /// Get cluster-wide instance and job counts
    ClusterStatus,
}

fn parse_state(name: &str) -> proto::process_state::ProcessStateEnum {
    use proto::process_state::ProcessStateEnum as S;
    match name {
        "run-requested" => S::RunRequested,
        "running" => S::Running,
        "succeeded" => S::Succeeded,
        "run-request-failed" => S::RunRequestFailed,
        "python-exception" => S::PythonException,
        "non-zero-return-code" => S::NonZeroReturnCode,
        "resources-not-available" => S::ResourcesNotAvailable,
        "error-getting-state" => S::ErrorGettingState,
        _ => S::Unknown,
    }
}

fn process_state(name: &str) -> ProcessState {
    ProcessState {
        state: parse_state(name) as i32,
        pid: 0,
        container_id: String::new(),
        log_file_name: String::new(),
        pickled_result: Vec::new(),
        return_code: 0,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();

    info!("connecting to scheduler at {}", cli.scheduler);
    let mut client = SchedulerServiceClient::connect(cli.scheduler.clone()).await?;
    info!("connected");

    match cli.command {
        Commands::RegisterInstance {
            address,
            memory_gb,
            logical_cpu,
        } => {
            let response = client
                .register_instance(Request::new(RegisterInstanceRequest {
                    public_address: address,
                    total_resources: Some(Resources {
                        memory_gb,
                        logical_cpu,
                        custom: Default::default(),
                    }),
                }))
                .await?
                .into_inner();

            println!("\nRegisterInstance");
            println!("────────────────");
            println!("success: {}", response.success);
            println!("message: {}", response.message);
        }

        Commands::Allocate {
            memory_gb,
            logical_cpu,
            num_workers,
            interruption_ceiling_percent,
        } => {
            let response = client
                .allocate(Request::new(AllocateRequest {
                    resources_per_worker: Some(Resources {
                        memory_gb,
                        logical_cpu,
                        custom: Default::default(),
                    }),
                    num_workers,
                    interruption_probability_ceiling_percent: interruption_ceiling_percent,
                }))
                .await?
                .into_inner();

            println!("\nAllocate");
            println!("────────");
            println!("requested:       {}", response.requested);
            println!("allocated_count: {}", response.allocated_count);
            for (address, jobs) in response.allocated {
                println!("  {address}: {:?}", jobs.job_ids);
            }
        }

        Commands::ReportJobState {
            instance_address,
            job_id,
            state,
        } => {
            let response = client
                .report_job_state(Request::new(ReportJobStateRequest {
                    update: Some(JobStateUpdate {
                        instance_address,
                        job_id,
                        process_state: Some(process_state(&state)),
                    }),
                }))
                .await?
                .into_inner();

            println!("\nReportJobState");
            println!("──────────────");
            println!("acknowledged: {}", response.acknowledged);
        }

        Commands::SubmitGridJob { args } => {
            let response = client
                .submit_grid_job(Request::new(SubmitGridJobRequest {
                    pickled_args: args.into_iter().map(String::into_bytes).collect(),
                }))
                .await?
                .into_inner();

            println!("\nSubmitGridJob");
            println!("─────────────");
            println!("job_id:    {}", response.job_id);
            println!("num_tasks: {}", response.num_tasks);
        }

        Commands::NextGridTask { job_id } => {
            let response = client
                .next_grid_task(Request::new(NextGridTaskRequest { job_id }))
                .await?
                .into_inner();

            println!("\nNextGridTask");
            println!("────────────");
            if response.has_task {
                println!("task_id: {}", response.task_id);
                println!("attempt: {}", response.attempt);
                println!("arg:     {}", String::from_utf8_lossy(&response.arg));
            } else {
                println!("no tasks available");
            }
        }

        Commands::CompleteGridTask {
            job_id,
            task_id,
            attempt,
            state,
        } => {
            let response = client
                .complete_grid_task(Request::new(CompleteGridTaskRequest {
                    job_id,
                    task_id,
                    attempt,
                    process_state: Some(process_state(&state)),
                }))
                .await?
                .into_inner();

            println!("\nCompleteGridTask");
            println!("────────────────");
            println!("acknowledged: {}", response.acknowledged);
        }

        Commands::PollGridResults { job_id } => {
            let response = client
                .poll_grid_results(Request::new(PollGridResultsRequest { job_id }))
                .await?
                .into_inner();

            println!("\nPollGridResults");
            println!("───────────────");
            for result in response.results {
                let state = result
                    .process_state
                    .map(|p| format!("{:?}", proto::process_state::ProcessStateEnum::try_from(p.state).unwrap_or_default()))
                    .unwrap_or_else(|| "unknown".to_string());
                println!("  task {} attempt {}: {state}", result.task_id, result.attempt);
            }
        }

        Commands::ClusterStatus => {
            let response = client
                .get_cluster_status(Request::new(ClusterStatusRequest {}))
                .await?
                .into_inner();

            println!("\nClusterStatus");
            println!("─────────────");
            println!("total_instances:    {}", response.total_instances);
            println!("total_running_jobs: {}", response.total_running_jobs);
        }
    }

    Ok(())
}
