//! Job Executor: runs a materialized [`mr_dispatch::Job`] in an isolated Docker
//! container and reports back a [`mr_dispatch::ProcessState`]. Container-based
//! interpreter deployments (`container_at_tag`, `container_at_digest`,
//! `server_available_container`) are supported directly; the remaining
//! deployment/job-spec variants need a non-containerized local interpreter or
//! pickled-payload unmarshaling, both out of scope per the specification's
//! "local single-job process runner" and "serialization of user payloads"
//! collaborators, and are reported as [`mr_dispatch::ProcessStateKind::ErrorGettingState`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use mr_dispatch::{InterpreterDeployment, Job, JobSpec, ProcessState, ProcessStateKind};
use tracing::{error, info, warn};

pub struct JobExecutor {
    docker: Docker,
}

impl JobExecutor {
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_socket_defaults().context("failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Resolves the container image a job's interpreter deployment names, or `None`
    /// if the deployment variant needs a non-containerized interpreter.
    fn resolve_image(deployment: &InterpreterDeployment) -> Option<String> {
        match deployment {
            InterpreterDeployment::ContainerAtTag { repository, tag } => {
                Some(format!("{repository}:{tag}"))
            }
            InterpreterDeployment::ContainerAtDigest { repository, digest } => {
                Some(format!("{repository}@{digest}"))
            }
            InterpreterDeployment::ServerAvailableContainer { image_name } => {
                Some(image_name.clone())
            }
            InterpreterDeployment::ServerAvailableInterpreter { .. }
            | InterpreterDeployment::EnvironmentSpecInCode { .. } => None,
        }
    }

    /// `py_command` carries its own argv; `py_function` has none — the container's own
    /// entrypoint is expected to unpickle `MEADOWRUN_PICKLED_FUNCTION` itself.
    fn resolve_command(job_spec: &JobSpec) -> Option<Vec<String>> {
        match job_spec {
            JobSpec::PyCommand { argv, .. } => Some(argv.clone()),
            JobSpec::PyFunction { .. } => None,
        }
    }

    pub async fn execute_job(&self, job: &Job) -> ProcessState {
        let Some(image) = Self::resolve_image(&job.interpreter_deployment) else {
            warn!(job_id = %job.job_id, "interpreter deployment needs a non-containerized interpreter, unsupported by this worker");
            return error_state(ProcessStateKind::ErrorGettingState);
        };

        info!(job_id = %job.job_id, %image, "executing job");

        if let Err(e) = self.pull_image(&image).await {
            error!(job_id = %job.job_id, error = %e, "failed to pull image");
            return error_state(ProcessStateKind::RunRequestFailed);
        }

        let container_id = match self.create_container(job, &image).await {
            Ok(id) => id,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "failed to create container");
                return error_state(ProcessStateKind::RunRequestFailed);
            }
        };

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            error!(job_id = %job.job_id, error = %e, "failed to start container");
            let _ = self.cleanup_container(&container_id).await;
            return error_state(ProcessStateKind::RunRequestFailed);
        }

        let exit_code = match self.wait_for_completion(&container_id).await {
            Ok(code) => code,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "error waiting for container");
                let _ = self.cleanup_container(&container_id).await;
                return error_state(ProcessStateKind::ErrorGettingState);
            }
        };

        let log_file_name = self.write_logs_to_file(&job.job_id, &container_id).await;
        let _ = self.cleanup_container(&container_id).await;

        let state = if exit_code == 0 {
            ProcessStateKind::Succeeded
        } else {
            ProcessStateKind::NonZeroReturnCode
        };

        if state == ProcessStateKind::Succeeded {
            info!(job_id = %job.job_id, "job completed successfully");
        } else {
            error!(job_id = %job.job_id, exit_code, "job failed");
        }

        ProcessState {
            state,
            pid: None,
            container_id: Some(container_id),
            log_file_name,
            pickled_result: None,
            return_code: Some(exit_code as i32),
            python_exception: None,
        }
    }

    /// Runs one grid task: `arg` is an opaque pickled-arguments blob (unmarshaling it is
    /// out of scope, per [`mr_dispatch`]'s doc comment); it's handed to the container
    /// as a bind-mounted file so a real task image can read it directly.
    pub async fn execute_grid_task(&self, image: &str, arg: &[u8]) -> ProcessState {
        if let Err(e) = self.pull_image(image).await {
            error!(error = %e, "failed to pull grid task image");
            return error_state(ProcessStateKind::RunRequestFailed);
        }

        let arg_file = match self.write_grid_task_arg(arg).await {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "failed to stage grid task argument");
                return error_state(ProcessStateKind::RunRequestFailed);
            }
        };

        let container_id = match self.create_grid_task_container(image, &arg_file).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "failed to create grid task container");
                return error_state(ProcessStateKind::RunRequestFailed);
            }
        };

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            error!(error = %e, "failed to start grid task container");
            let _ = self.cleanup_container(&container_id).await;
            return error_state(ProcessStateKind::RunRequestFailed);
        }

        let exit_code = match self.wait_for_completion(&container_id).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "error waiting for grid task container");
                let _ = self.cleanup_container(&container_id).await;
                return error_state(ProcessStateKind::ErrorGettingState);
            }
        };

        let _ = self.cleanup_container(&container_id).await;

        ProcessState {
            state: if exit_code == 0 {
                ProcessStateKind::Succeeded
            } else {
                ProcessStateKind::NonZeroReturnCode
            },
            pid: None,
            container_id: Some(container_id),
            log_file_name: None,
            pickled_result: None,
            return_code: Some(exit_code as i32),
            python_exception: None,
        }
    }

    async fn write_grid_task_arg(&self, arg: &[u8]) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("meadowrun-grid-arg-{}.bin", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, arg).await?;
        Ok(path)
    }

    async fn create_grid_task_container(&self, image: &str, arg_file: &Path) -> Result<String> {
        let binding = format!("{}:/meadowrun/arg:ro", arg_file.display());
        let host_config = HostConfig {
            network_mode: Some("bridge".to_string()),
            binds: Some(vec![binding]),
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            env: Some(vec!["MR_GRID_TASK_ARG_FILE=/meadowrun/arg".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("meadowrun-grid-task-{}", uuid::Uuid::new_v4()),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .context("failed to create grid task container")?;
        Ok(response.id)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        use bollard::image::CreateImageOptions;
        use futures_util::stream::StreamExt;

        info!(%image, "pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                warn!(%image, error = %e, "image pull warning");
            }
        }
        Ok(())
    }

    async fn create_container(&self, job: &Job, image: &str) -> Result<String> {
        let host_config = HostConfig {
            network_mode: Some("bridge".to_string()),
            auto_remove: Some(false),
            ..Default::default()
        };

        let env: Vec<String> = job
            .environment_variables
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = Config {
            image: Some(image.to_string()),
            cmd: Self::resolve_command(&job.job_spec),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("meadowrun-job-{}", job.job_id),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .context("failed to create container")?;
        Ok(response.id)
    }

    async fn wait_for_completion(&self, container_id: &str) -> Result<i64> {
        use futures_util::stream::StreamExt;

        let options = Some(WaitContainerOptions {
            condition: "not-running",
        });
        let mut stream = self.docker.wait_container(container_id, options);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(anyhow::anyhow!("error waiting for container: {e}")),
            None => Ok(0),
        }
    }

    async fn write_logs_to_file(&self, job_id: &str, container_id: &str) -> Option<String> {
        use futures_util::stream::StreamExt;

        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        });
        let mut stream = self.docker.logs(container_id, options);
        let mut logs = String::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => logs.push_str(&output.to_string()),
                Err(e) => warn!(%container_id, error = %e, "error reading logs"),
            }
        }

        let path: PathBuf = std::env::temp_dir().join(format!("meadowrun-job-{job_id}.log"));
        match tokio::fs::write(&path, logs).await {
            Ok(()) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                warn!(%job_id, error = %e, "failed to write log file");
                None
            }
        }
    }

    async fn cleanup_container(&self, container_id: &str) -> Result<()> {
        let _ = self
            .docker
            .stop_container(container_id, None::<StopContainerOptions>)
            .await;

        let options = Some(RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        });
        self.docker
            .remove_container(container_id, options)
            .await
            .context("failed to remove container")?;
        Ok(())
    }
}

fn error_state(kind: ProcessStateKind) -> ProcessState {
    ProcessState {
        state: kind,
        pid: None,
        container_id: None,
        log_file_name: None,
        pickled_result: None,
        return_code: None,
        python_exception: None,
    }
}
