//! Writer half of the host-side liveness file convention read by
//! `mr_sweeper::file_liveness::FileLivenessCheck`. Every time a dispatched job's
//! `ProcessState` changes, the worker overwrites its liveness file so the sweeper can
//! reconcile without a direct connection back to this host.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mr_dispatch::ProcessState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LivenessRecord {
    process_state: ProcessState,
}

fn liveness_file_path(dir: &Path, instance_address: &str, job_id: &str) -> PathBuf {
    dir.join(format!("{instance_address}__{job_id}.json"))
}

pub async fn write_liveness(
    dir: &Path,
    instance_address: &str,
    job_id: &str,
    process_state: &ProcessState,
) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .context("failed to create liveness directory")?;
    let path = liveness_file_path(dir, instance_address, job_id);
    let record = LivenessRecord {
        process_state: process_state.clone(),
    };
    let bytes = serde_json::to_vec(&record).context("failed to serialize liveness record")?;
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("failed to write liveness file {}", path.display()))
}
