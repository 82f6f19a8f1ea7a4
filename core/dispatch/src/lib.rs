//! Wire types for the job dispatch path: the `Job` message materialized on a chosen
//! host, its terminal `ProcessState`, and the `Dispatcher` trait that puts a `Job` on a
//! specific instance. The SSH/transport mechanics a real dispatcher would need are out
//! of scope; this crate defines the shape callers agree on and the trait seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the job's code gets onto the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CodeDeployment {
    ServerAvailableFolder { path: String },
    GitRepoCommit { url: String, commit: String, path: String },
    GitRepoBranch { url: String, branch: String, path: String },
}

/// How the job's interpreter gets onto the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InterpreterDeployment {
    ServerAvailableInterpreter { path: String },
    ContainerAtDigest { repository: String, digest: String },
    ContainerAtTag { repository: String, tag: String },
    ServerAvailableContainer { image_name: String },
    EnvironmentSpecInCode {
        spec_type: EnvironmentSpecType,
        path: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentSpecType {
    Default,
    Conda,
}

/// What the job actually runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobSpec {
    PyCommand {
        argv: Vec<String>,
        pickled_context: Vec<u8>,
    },
    PyFunction {
        function: PyFunctionRef,
        pickled_args: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PyFunctionRef {
    QualifiedName(String),
    Pickled(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialsService {
    Docker,
    Git,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwsSecretType {
    UsernamePassword,
    SshKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CredentialsSource {
    AwsSecret {
        secret_type: AwsSecretType,
        secret_name: String,
    },
    ServerAvailableFile {
        secret_type: AwsSecretType,
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsSourceMessage {
    pub service: CredentialsService,
    pub url: String,
    pub source: CredentialsSource,
}

/// A single unit of user work scheduled onto one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_friendly_name: String,
    pub code_deployment: CodeDeployment,
    pub interpreter_deployment: InterpreterDeployment,
    pub job_spec: JobSpec,
    pub environment_variables: Vec<(String, String)>,
    pub result_highest_pickle_protocol: i32,
    pub credentials_sources: Vec<CredentialsSourceMessage>,
}

/// Terminal or transient status of a running job; one of nine enum values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStateKind {
    RunRequested,
    Running,
    Succeeded,
    RunRequestFailed,
    PythonException,
    NonZeroReturnCode,
    ResourcesNotAvailable,
    ErrorGettingState,
    Unknown,
}

/// `pickle_exception`'s shape without the pickling: type name, message, and formatted
/// traceback, captured as three strings for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PythonExceptionInfo {
    pub type_name: String,
    pub message: String,
    pub traceback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub state: ProcessStateKind,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub log_file_name: Option<String>,
    pub pickled_result: Option<Vec<u8>>,
    pub return_code: Option<i32>,
    pub python_exception: Option<PythonExceptionInfo>,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        COMPLETED_PROCESS_STATES.contains(&self.state)
    }
}

/// The subset of [`ProcessStateKind`] that are terminal.
pub const COMPLETED_PROCESS_STATES: &[ProcessStateKind] = &[
    ProcessStateKind::Succeeded,
    ProcessStateKind::RunRequestFailed,
    ProcessStateKind::PythonException,
    ProcessStateKind::NonZeroReturnCode,
    ProcessStateKind::ResourcesNotAvailable,
    ProcessStateKind::ErrorGettingState,
];

/// Reported by the worker back to the scheduler when a single job's `ProcessState`
/// changes; feeds the sweeper's liveness check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateUpdate {
    pub instance_address: String,
    pub job_id: String,
    pub process_state: ProcessState,
}

/// Reported by a grid worker when one task's state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridTaskStateResponse {
    pub job_id: String,
    pub task_id: u32,
    pub attempt: u32,
    pub process_state: ProcessState,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to reach host {0}")]
    Unreachable(String),
    #[error("host rejected job: {0}")]
    Rejected(String),
}

/// Materializes a `Job` on a specific instance. SSH transport is out of scope; real
/// implementations connect to the meadowrun agent running on `instance_address`.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, instance_address: &str, job: &Job) -> Result<(), DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_process_states_excludes_transient_states() {
        assert!(!COMPLETED_PROCESS_STATES.contains(&ProcessStateKind::RunRequested));
        assert!(!COMPLETED_PROCESS_STATES.contains(&ProcessStateKind::Running));
        assert!(COMPLETED_PROCESS_STATES.contains(&ProcessStateKind::Succeeded));
    }

    #[test]
    fn test_process_state_is_terminal_matches_completed_set() {
        let running = ProcessState {
            state: ProcessStateKind::Running,
            pid: Some(1),
            container_id: None,
            log_file_name: None,
            pickled_result: None,
            return_code: None,
            python_exception: None,
        };
        assert!(!running.is_terminal());

        let succeeded = ProcessState {
            state: ProcessStateKind::Succeeded,
            ..running.clone()
        };
        assert!(succeeded.is_terminal());
    }
}
