//! Deallocation Sweeper: a periodic, stateless actor that reconciles [`mr_registry`]
//! state against reality — removing finished jobs, evicting phantom allocations whose
//! client crashed before the worker started, and shutting down instances idle past a
//! grace period.

pub mod file_liveness;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use mr_registry::Registry;

/// What the host-side liveness file (written by the local runner) reports for one
/// `job_id` on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStatus {
    /// The job is still running (or the PID is alive and no terminal state is posted).
    Running,
    /// A terminal `ProcessState` was posted, or the host reports the PID is dead.
    Terminal,
    /// No liveness record has ever been written for this `job_id`.
    NeverObserved,
}

/// The host-side liveness check. Reading the actual liveness file is out of scope for
/// this crate; callers supply a real implementation or a test double.
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn check(&self, instance_address: &str, job_id: &str) -> LivenessStatus;
}

/// Requests the cloud terminate an instance. Out of scope to implement against a real
/// cloud; see [`mr_allocator::InstanceLauncher`] for the symmetric launch-side trait.
#[async_trait]
pub trait InstanceTerminator: Send + Sync {
    async fn terminate(&self, instance_address: &str);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub jobs_reclaimed: u32,
    pub instances_terminated: u32,
}

pub struct Sweeper {
    registry: Arc<dyn Registry>,
    liveness: Arc<dyn LivenessCheck>,
    terminator: Arc<dyn InstanceTerminator>,
    /// How long an allocation may sit with no liveness record before it's treated as
    /// a phantom (client crashed between `allocate` and dispatch).
    client_launch_grace: ChronoDuration,
    /// How long an instance may sit with empty `running_jobs` before shutdown.
    idle_shutdown_grace: ChronoDuration,
}

impl Sweeper {
    pub fn new(
        registry: Arc<dyn Registry>,
        liveness: Arc<dyn LivenessCheck>,
        terminator: Arc<dyn InstanceTerminator>,
    ) -> Self {
        Self {
            registry,
            liveness,
            terminator,
            client_launch_grace: ChronoDuration::minutes(5),
            idle_shutdown_grace: ChronoDuration::minutes(10),
        }
    }

    pub fn with_client_launch_grace(mut self, grace: ChronoDuration) -> Self {
        self.client_launch_grace = grace;
        self
    }

    pub fn with_idle_shutdown_grace(mut self, grace: ChronoDuration) -> Self {
        self.idle_shutdown_grace = grace;
        self
    }

    /// Runs one reconciliation pass over every `InstanceRecord`.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        for record in self.registry.scan().await {
            for (job_id, running_job) in &record.running_jobs {
                let reclaim = match self.liveness.check(&record.public_address, job_id).await {
                    LivenessStatus::Terminal => true,
                    LivenessStatus::NeverObserved => {
                        now - running_job.allocated_at > self.client_launch_grace
                    }
                    LivenessStatus::Running => false,
                };

                if reclaim {
                    tracing::debug!(
                        "Reclaiming job {} on instance {}",
                        job_id,
                        record.public_address
                    );
                    if self
                        .registry
                        .deallocate(&record.public_address, job_id, now)
                        .await
                        .is_ok()
                    {
                        report.jobs_reclaimed += 1;
                    }
                }
            }

            let Some(current) = self.registry.get(&record.public_address).await else {
                continue;
            };
            if current.running_jobs.is_empty()
                && now - current.last_update_time > self.idle_shutdown_grace
                && self
                    .registry
                    .mark_prevent_further_allocation(&record.public_address)
                    .await
                    .is_ok()
            {
                tracing::info!("Terminating idle instance {}", record.public_address);
                self.terminator.terminate(&record.public_address).await;
                let _ = self.registry.remove(&record.public_address).await;
                report.instances_terminated += 1;
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mr_instance_selector::Resources;
    use mr_registry::InMemoryRegistry;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    struct StubLiveness {
        statuses: Mutex<HashMap<String, LivenessStatus>>,
    }

    impl StubLiveness {
        fn new(statuses: Vec<(&str, LivenessStatus)>) -> Self {
            Self {
                statuses: Mutex::new(
                    statuses
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl LivenessCheck for StubLiveness {
        async fn check(&self, _instance_address: &str, job_id: &str) -> LivenessStatus {
            *self
                .statuses
                .lock()
                .await
                .get(job_id)
                .unwrap_or(&LivenessStatus::NeverObserved)
        }
    }

    #[derive(Default)]
    struct CountingTerminator {
        terminated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InstanceTerminator for CountingTerminator {
        async fn terminate(&self, instance_address: &str) {
            self.terminated.lock().await.push(instance_address.to_string());
        }
    }

    #[tokio::test]
    async fn test_terminal_liveness_reclaims_job_and_restores_resources() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .register("A".into(), Resources::new(4.0, 2), vec![], Utc::now())
            .await
            .unwrap();
        registry
            .allocate("A", Resources::new(2.0, 1), vec!["job-1".into()], Utc::now())
            .await
            .unwrap();

        let liveness = Arc::new(StubLiveness::new(vec![("job-1", LivenessStatus::Terminal)]));
        let terminator = Arc::new(CountingTerminator::default());
        let sweeper = Sweeper::new(registry.clone(), liveness, terminator);

        let report = sweeper.sweep_once().await;
        assert_eq!(report.jobs_reclaimed, 1);

        let record = registry.get("A").await.unwrap();
        assert!(record.running_jobs.is_empty());
        assert_eq!(record.available_resources, Resources::new(4.0, 2));
    }

    #[tokio::test]
    async fn test_never_observed_job_within_grace_is_left_alone() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .register("A".into(), Resources::new(4.0, 2), vec![], Utc::now())
            .await
            .unwrap();
        registry
            .allocate("A", Resources::new(2.0, 1), vec!["job-1".into()], Utc::now())
            .await
            .unwrap();

        let liveness = Arc::new(StubLiveness::new(vec![]));
        let terminator = Arc::new(CountingTerminator::default());
        let sweeper = Sweeper::new(registry.clone(), liveness, terminator);

        let report = sweeper.sweep_once().await;
        assert_eq!(report.jobs_reclaimed, 0);
        assert_eq!(registry.get("A").await.unwrap().running_jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_never_observed_job_past_launch_grace_is_reclaimed_as_phantom() {
        let registry = Arc::new(InMemoryRegistry::new());
        let stale = Utc::now() - ChronoDuration::minutes(10);
        registry
            .register("A".into(), Resources::new(4.0, 2), vec![], stale)
            .await
            .unwrap();
        registry
            .allocate("A", Resources::new(2.0, 1), vec!["job-1".into()], stale)
            .await
            .unwrap();

        let liveness = Arc::new(StubLiveness::new(vec![]));
        let terminator = Arc::new(CountingTerminator::default());
        let sweeper = Sweeper::new(registry.clone(), liveness, terminator);

        let report = sweeper.sweep_once().await;
        assert_eq!(report.jobs_reclaimed, 1);
    }

    #[tokio::test]
    async fn test_idle_instance_past_grace_is_terminated_and_removed() {
        let registry = Arc::new(InMemoryRegistry::new());
        let stale = Utc::now() - ChronoDuration::minutes(20);
        registry
            .register("A".into(), Resources::new(4.0, 2), vec![], stale)
            .await
            .unwrap();

        let liveness = Arc::new(StubLiveness::new(vec![]));
        let terminator = Arc::new(CountingTerminator::default());
        let sweeper = Sweeper::new(registry.clone(), liveness, terminator.clone());

        let report = sweeper.sweep_once().await;
        assert_eq!(report.instances_terminated, 1);
        assert!(registry.get("A").await.is_none());
        assert_eq!(*terminator.terminated.lock().await, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_fresh_idle_instance_within_grace_is_left_alone() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .register("A".into(), Resources::new(4.0, 2), vec![], Utc::now())
            .await
            .unwrap();

        let liveness = Arc::new(StubLiveness::new(vec![]));
        let terminator = Arc::new(CountingTerminator::default());
        let sweeper = Sweeper::new(registry.clone(), liveness, terminator);

        let report = sweeper.sweep_once().await;
        assert_eq!(report.instances_terminated, 0);
        assert!(registry.get("A").await.is_some());
    }
}
