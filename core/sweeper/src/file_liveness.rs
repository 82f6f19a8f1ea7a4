//! The host-side liveness file convention: the local runner (out of scope, §1) writes
//! one JSON file per `(instance_address, job_id)` reporting the job's last-known
//! `ProcessState`. [`FileLivenessCheck`] is the sweeper-side reader; `mr-worker`'s
//! `liveness` module is the writer. Both sides agree only on the file layout and
//! JSON shape below, never on in-process state.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mr_dispatch::ProcessState;
use serde::{Deserialize, Serialize};

use crate::{LivenessCheck, LivenessStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub process_state: ProcessState,
}

/// `{dir}/{instance_address}__{job_id}.json`. `__` is not a valid character in either
/// an address or a job_id (addresses are dotted/hostnames, job_ids are UUIDs), so the
/// join is unambiguous without escaping.
pub fn liveness_file_path(dir: &Path, instance_address: &str, job_id: &str) -> PathBuf {
    dir.join(format!("{instance_address}__{job_id}.json"))
}

pub struct FileLivenessCheck {
    dir: PathBuf,
}

impl FileLivenessCheck {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl LivenessCheck for FileLivenessCheck {
    async fn check(&self, instance_address: &str, job_id: &str) -> LivenessStatus {
        let path = liveness_file_path(&self.dir, instance_address, job_id);
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            return LivenessStatus::NeverObserved;
        };
        match serde_json::from_str::<LivenessRecord>(&contents) {
            Ok(record) if record.process_state.is_terminal() => LivenessStatus::Terminal,
            Ok(_) => LivenessStatus::Running,
            Err(_) => LivenessStatus::NeverObserved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mr_dispatch::ProcessStateKind;
    use tempfile::tempdir;

    fn state(kind: ProcessStateKind) -> ProcessState {
        ProcessState {
            state: kind,
            pid: Some(123),
            container_id: None,
            log_file_name: None,
            pickled_result: None,
            return_code: None,
            python_exception: None,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_never_observed() {
        let dir = tempdir().unwrap();
        let check = FileLivenessCheck::new(dir.path());
        assert_eq!(
            check.check("10.0.0.1", "job-1").await,
            LivenessStatus::NeverObserved
        );
    }

    #[tokio::test]
    async fn test_running_state_reports_running() {
        let dir = tempdir().unwrap();
        let path = liveness_file_path(dir.path(), "10.0.0.1", "job-1");
        let record = LivenessRecord {
            process_state: state(ProcessStateKind::Running),
        };
        tokio::fs::write(&path, serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let check = FileLivenessCheck::new(dir.path());
        assert_eq!(check.check("10.0.0.1", "job-1").await, LivenessStatus::Running);
    }

    #[tokio::test]
    async fn test_terminal_state_reports_terminal() {
        let dir = tempdir().unwrap();
        let path = liveness_file_path(dir.path(), "10.0.0.1", "job-1");
        let record = LivenessRecord {
            process_state: state(ProcessStateKind::Succeeded),
        };
        tokio::fs::write(&path, serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let check = FileLivenessCheck::new(dir.path());
        assert_eq!(check.check("10.0.0.1", "job-1").await, LivenessStatus::Terminal);
    }
}
