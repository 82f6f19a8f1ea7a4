//! Allocation Registry: a strongly-consistent key-value table keyed by instance
//! address, holding available resources and running jobs per instance.
//!
//! All mutation goes through the [`Registry`] trait's conditional operations, which
//! model the compare-and-set semantics a real cloud KV store (DynamoDB, etcd, ...)
//! would provide via conditional expressions. [`InMemoryRegistry`] gives every record
//! a private lock so no caller ever observes a read-then-write window: the lock is
//! held only across the synchronous check-and-mutate, never across an await point.

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mr_instance_selector::Resources;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// One job's allocation on an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningJob {
    pub allocated: Resources,
    pub allocated_at: DateTime<Utc>,
}

/// One row per live VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub public_address: String,
    pub available_resources: Resources,
    pub running_jobs: BTreeMap<String, RunningJob>,
    pub last_update_time: DateTime<Utc>,
    pub prevent_further_allocation: bool,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instance {0} already exists")]
    AlreadyExists(String),
    #[error("conditional update conflict")]
    Conflict,
    #[error("{0} not found")]
    NotFound(String),
    #[error("transient registry error: {0}")]
    Transient(String),
}

/// A strongly-consistent KV table with single-item conditional writes.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Conditional put: fails with `AlreadyExists` if `address` is already registered.
    async fn register(
        &self,
        address: String,
        available: Resources,
        running_jobs: Vec<(String, Resources)>,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// Conditional update: subtracts `per_job * job_ids.len()` from
    /// `available_resources` and inserts each job into `running_jobs`. Fails with
    /// `Conflict` if resources are insufficient, any job_id already exists, or
    /// `prevent_further_allocation` is set.
    async fn allocate(
        &self,
        address: &str,
        per_job: Resources,
        job_ids: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// Conditional update: restores `job_id`'s allocation to `available_resources` and
    /// removes it from `running_jobs`. Fails with `NotFound` if the job is not present.
    async fn deallocate(
        &self,
        address: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// A read-only projection over all live records. Never cached: every call re-reads
    /// current state, per the "no in-process Registry replicas" design note.
    async fn scan(&self) -> Vec<InstanceRecord>;

    async fn get(&self, address: &str) -> Option<InstanceRecord>;

    /// Sets `prevent_further_allocation`, guarded on `running_jobs` being empty.
    async fn mark_prevent_further_allocation(&self, address: &str) -> Result<(), RegistryError>;

    /// Deletes the record outright (used by the sweeper after termination).
    async fn remove(&self, address: &str) -> Result<(), RegistryError>;
}

#[derive(Default)]
pub struct InMemoryRegistry {
    records: RwLock<HashMap<String, Mutex<InstanceRecord>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register(
        &self,
        address: String,
        available: Resources,
        running_jobs: Vec<(String, Resources)>,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&address) {
            return Err(RegistryError::AlreadyExists(address));
        }

        tracing::info!("Registering instance: {}", address);

        let running_jobs = running_jobs
            .into_iter()
            .map(|(job_id, allocated)| {
                (
                    job_id,
                    RunningJob {
                        allocated,
                        allocated_at: now,
                    },
                )
            })
            .collect();

        records.insert(
            address.clone(),
            Mutex::new(InstanceRecord {
                public_address: address,
                available_resources: available,
                running_jobs,
                last_update_time: now,
                prevent_further_allocation: false,
            }),
        );
        Ok(())
    }

    async fn allocate(
        &self,
        address: &str,
        per_job: Resources,
        job_ids: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        if job_ids.is_empty() {
            return Ok(());
        }

        let records = self.records.read().await;
        let record_lock = records
            .get(address)
            .ok_or_else(|| RegistryError::NotFound(address.to_string()))?;
        let mut record = record_lock.lock().await;

        if record.prevent_further_allocation {
            tracing::debug!("Instance {} not accepting further allocations", address);
            return Err(RegistryError::Conflict);
        }
        if job_ids.iter().any(|id| record.running_jobs.contains_key(id)) {
            tracing::debug!("Instance {} already running one of {:?}", address, job_ids);
            return Err(RegistryError::Conflict);
        }

        let mut remaining = record.available_resources.clone();
        for _ in &job_ids {
            remaining = remaining.subtract(&per_job).ok_or_else(|| {
                tracing::debug!("Instance {} has insufficient resources for {:?}", address, job_ids);
                RegistryError::Conflict
            })?;
        }

        tracing::info!("Allocating {:?} to instance {}", job_ids, address);
        record.available_resources = remaining;
        for job_id in job_ids {
            record.running_jobs.insert(
                job_id,
                RunningJob {
                    allocated: per_job.clone(),
                    allocated_at: now,
                },
            );
        }
        record.last_update_time = now;
        Ok(())
    }

    async fn deallocate(
        &self,
        address: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let records = self.records.read().await;
        let record_lock = records
            .get(address)
            .ok_or_else(|| RegistryError::NotFound(address.to_string()))?;
        let mut record = record_lock.lock().await;

        let job = record
            .running_jobs
            .remove(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;

        tracing::info!("Deallocating job {} from instance {}", job_id, address);
        record.available_resources = record.available_resources.add(&job.allocated);
        record.last_update_time = now;
        Ok(())
    }

    async fn scan(&self) -> Vec<InstanceRecord> {
        let records = self.records.read().await;
        let mut out = Vec::with_capacity(records.len());
        for lock in records.values() {
            out.push(lock.lock().await.clone());
        }
        out
    }

    async fn get(&self, address: &str) -> Option<InstanceRecord> {
        let records = self.records.read().await;
        match records.get(address) {
            Some(lock) => Some(lock.lock().await.clone()),
            None => None,
        }
    }

    async fn mark_prevent_further_allocation(&self, address: &str) -> Result<(), RegistryError> {
        let records = self.records.read().await;
        let record_lock = records
            .get(address)
            .ok_or_else(|| RegistryError::NotFound(address.to_string()))?;
        let mut record = record_lock.lock().await;

        if !record.running_jobs.is_empty() {
            return Err(RegistryError::Conflict);
        }
        record.prevent_further_allocation = true;
        Ok(())
    }

    async fn remove(&self, address: &str) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        records
            .remove(address)
            .ok_or_else(|| RegistryError::NotFound(address.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_address() {
        let registry = InMemoryRegistry::new();
        registry
            .register("host-1".into(), Resources::new(8.0, 4), vec![], now())
            .await
            .unwrap();

        let err = registry
            .register("host-1".into(), Resources::new(8.0, 4), vec![], now())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_allocate_then_deallocate_restores_available_resources() {
        let registry = InMemoryRegistry::new();
        registry
            .register("host-1".into(), Resources::new(8.0, 4), vec![], now())
            .await
            .unwrap();

        let per_job = Resources::new(2.0, 1);
        registry
            .allocate(
                "host-1",
                per_job.clone(),
                vec!["job-a".into()],
                now(),
            )
            .await
            .unwrap();

        let record = registry.get("host-1").await.unwrap();
        assert_eq!(record.available_resources, Resources::new(6.0, 3));
        assert_eq!(record.running_jobs.len(), 1);

        registry.deallocate("host-1", "job-a", now()).await.unwrap();

        let record = registry.get("host-1").await.unwrap();
        assert_eq!(record.available_resources, Resources::new(8.0, 4));
        assert!(record.running_jobs.is_empty());
    }

    #[tokio::test]
    async fn test_allocate_conflicts_on_insufficient_resources() {
        let registry = InMemoryRegistry::new();
        registry
            .register("host-1".into(), Resources::new(1.0, 1), vec![], now())
            .await
            .unwrap();

        let err = registry
            .allocate(
                "host-1",
                Resources::new(2.0, 1),
                vec!["job-a".into()],
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict));

        let record = registry.get("host-1").await.unwrap();
        assert_eq!(record.available_resources, Resources::new(1.0, 1));
    }

    #[tokio::test]
    async fn test_allocate_rejects_duplicate_job_id() {
        let registry = InMemoryRegistry::new();
        registry
            .register("host-1".into(), Resources::new(8.0, 4), vec![], now())
            .await
            .unwrap();

        registry
            .allocate(
                "host-1",
                Resources::new(1.0, 1),
                vec!["job-a".into()],
                now(),
            )
            .await
            .unwrap();

        let err = registry
            .allocate(
                "host-1",
                Resources::new(1.0, 1),
                vec!["job-a".into()],
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict));
    }

    #[tokio::test]
    async fn test_mark_prevent_further_allocation_blocks_subsequent_allocate() {
        let registry = InMemoryRegistry::new();
        registry
            .register("host-1".into(), Resources::new(8.0, 4), vec![], now())
            .await
            .unwrap();

        registry.mark_prevent_further_allocation("host-1").await.unwrap();

        let err = registry
            .allocate(
                "host-1",
                Resources::new(1.0, 1),
                vec!["job-a".into()],
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict));
    }

    #[tokio::test]
    async fn test_mark_prevent_further_allocation_requires_empty_running_jobs() {
        let registry = InMemoryRegistry::new();
        registry
            .register("host-1".into(), Resources::new(8.0, 4), vec![], now())
            .await
            .unwrap();
        registry
            .allocate(
                "host-1",
                Resources::new(1.0, 1),
                vec!["job-a".into()],
                now(),
            )
            .await
            .unwrap();

        let err = registry
            .mark_prevent_further_allocation("host-1")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict));
    }

    #[tokio::test]
    async fn test_concurrent_allocate_to_same_instance_yields_exactly_one_winner() {
        let registry = std::sync::Arc::new(InMemoryRegistry::new());
        registry
            .register("host-1".into(), Resources::new(1.0, 1), vec![], now())
            .await
            .unwrap();

        let per_job = Resources::new(1.0, 1);
        let (r1, r2) = tokio::join!(
            registry.allocate("host-1", per_job.clone(), vec!["job-a".into()], now()),
            registry.allocate("host-1", per_job.clone(), vec!["job-b".into()], now()),
        );

        // exactly one succeeds
        assert_ne!(r1.is_ok(), r2.is_ok());
    }
}
