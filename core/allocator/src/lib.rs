//! Instance Allocator: stateless logic that bin-packs job requests onto a pool of live
//! cloud instances, launches new ones from the cheapest market when the pool is
//! insufficient, and registers them with the [`mr_registry::Registry`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mr_instance_selector::{Catalog, InstanceTypeInfo, Resources, SelectorError};
use mr_registry::Registry;
use thiserror::Error;
use uuid::Uuid;

/// Launches new cloud instances of a given shape. This is the boundary to the cloud
/// SDK, out of scope for this crate: callers supply a real implementation (EC2,
/// GCE, ...) or a test double.
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    /// Launches `count` instances of `shape` and returns the addresses of the
    /// instances that came up reachable. May return fewer than `count` addresses if
    /// the cloud partially fails to launch.
    async fn launch(&self, shape: &InstanceTypeInfo, count: u32) -> Vec<String>;
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("no instance shape satisfies the resource requirements and interruption ceiling")]
    NoSuitableShape,
    #[error("only {allocated}/{requested} workers were allocated")]
    PartialAllocation {
        partial: HashMap<String, Vec<String>>,
        allocated: u32,
        requested: u32,
    },
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<SelectorError> for AllocatorError {
    fn from(_: SelectorError) -> Self {
        AllocatorError::NoSuitableShape
    }
}

/// Fitness key for Phase A instance reuse: `0` (fits) sorts before `1` (doesn't fit);
/// among instances that fit, lower `score` (tighter residual after one worker) sorts
/// first; custom resources break remaining ties lexicographically by name.
#[derive(Debug, Clone, PartialEq)]
struct FitnessKey {
    indicator: u8,
    score: f64,
    custom: Vec<(String, f64)>,
}

impl FitnessKey {
    fn compute(available: &Resources, required: &Resources) -> Self {
        let fits = available.dominates(required);
        let indicator = if fits { 0 } else { 1 };
        let remaining = if fits {
            available
                .subtract(required)
                .unwrap_or_else(|| available.clone())
        } else {
            available.clone()
        };

        let cpu_norm = if required.logical_cpu > 0 {
            remaining.logical_cpu as f64 / required.logical_cpu as f64
        } else {
            0.0
        };
        let mem_norm = if required.memory_gb > 0.0 {
            remaining.memory_gb / required.memory_gb
        } else {
            0.0
        };
        let score = (cpu_norm + mem_norm) / 2.0;

        let mut custom: Vec<(String, f64)> = remaining.custom.into_iter().collect();
        custom.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            indicator,
            score,
            custom,
        }
    }
}

impl Eq for FitnessKey {}

impl PartialOrd for FitnessKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FitnessKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.indicator
            .cmp(&other.indicator)
            .then_with(|| self.score.partial_cmp(&other.score).unwrap_or(Ordering::Equal))
            .then_with(|| {
                for ((an, av), (bn, bv)) in self.custom.iter().zip(other.custom.iter()) {
                    let ord = an
                        .cmp(bn)
                        .then_with(|| av.partial_cmp(bv).unwrap_or(Ordering::Equal));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            })
    }
}

pub struct Allocator {
    registry: Arc<dyn Registry>,
    catalog: Catalog,
    launcher: Arc<dyn InstanceLauncher>,
    /// How many times Phase A retries on CAS conflict before falling through to
    /// Phase B. The source retries exactly three times; left configurable since
    /// whether three is load-bearing is an open question.
    phase_a_retries: usize,
}

impl Allocator {
    pub fn new(
        registry: Arc<dyn Registry>,
        catalog: Catalog,
        launcher: Arc<dyn InstanceLauncher>,
    ) -> Self {
        Self {
            registry,
            catalog,
            launcher,
            phase_a_retries: 3,
        }
    }

    pub fn with_phase_a_retries(mut self, retries: usize) -> Self {
        self.phase_a_retries = retries;
        self
    }

    /// The public allocation operation. Returns `{instance_address -> [job_id]}`.
    pub async fn allocate(
        &self,
        resources_per_worker: Resources,
        num_workers: u32,
        interruption_ceiling_pct: f64,
    ) -> Result<HashMap<String, Vec<String>>, AllocatorError> {
        if num_workers == 0 {
            return Ok(HashMap::new());
        }

        let now = Utc::now();
        let (mut allocated, remaining) = self
            .phase_a(&resources_per_worker, num_workers, now)
            .await;

        if remaining == 0 {
            return Ok(allocated);
        }

        match self
            .phase_b(&resources_per_worker, remaining, interruption_ceiling_pct, now)
            .await
        {
            Ok(phase_b_allocated) => {
                for (address, jobs) in phase_b_allocated {
                    allocated.entry(address).or_default().extend(jobs);
                }
                Ok(allocated)
            }
            Err(AllocatorError::PartialAllocation { partial, .. }) => {
                for (address, jobs) in partial {
                    allocated.entry(address).or_default().extend(jobs);
                }
                let total_allocated: u32 = allocated.values().map(|v| v.len() as u32).sum();
                tracing::warn!(
                    requested = num_workers,
                    allocated = total_allocated,
                    "partial allocation: short by {} workers",
                    num_workers - total_allocated
                );
                Err(AllocatorError::PartialAllocation {
                    partial: allocated,
                    allocated: total_allocated,
                    requested: num_workers,
                })
            }
            Err(AllocatorError::NoSuitableShape) if !allocated.is_empty() => {
                let total_allocated: u32 = allocated.values().map(|v| v.len() as u32).sum();
                Err(AllocatorError::PartialAllocation {
                    partial: allocated,
                    allocated: total_allocated,
                    requested: num_workers,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Phase A: bin-pack onto existing instances, retrying on CAS conflict.
    async fn phase_a(
        &self,
        resources_per_worker: &Resources,
        num_workers: u32,
        now: DateTime<Utc>,
    ) -> (HashMap<String, Vec<String>>, u32) {
        let mut allocated: HashMap<String, Vec<String>> = HashMap::new();
        let mut num_allocated = 0u32;

        for _pass in 0..self.phase_a_retries {
            if num_allocated >= num_workers {
                break;
            }

            let records = self.registry.scan().await;
            let mut candidates: Vec<(String, Resources)> = records
                .into_iter()
                .map(|r| (r.public_address, r.available_resources))
                .collect();
            // deterministic tie-break: lowest address first
            candidates.sort_by(|a, b| a.0.cmp(&b.0));

            let mut proposed: Vec<(String, Vec<String>)> = Vec::new();
            let mut index_of: HashMap<String, usize> = HashMap::new();
            let mut num_proposed = 0u32;

            while num_allocated + num_proposed < num_workers {
                let mut best: Option<(usize, FitnessKey)> = None;
                for (i, (_, available)) in candidates.iter().enumerate() {
                    let key = FitnessKey::compute(available, resources_per_worker);
                    if key.indicator == 1 {
                        continue;
                    }
                    match &best {
                        None => best = Some((i, key)),
                        Some((_, best_key)) if key < *best_key => best = Some((i, key)),
                        _ => {}
                    }
                }

                let Some((idx, _)) = best else {
                    break;
                };

                let (address, available) = &mut candidates[idx];
                *available = available
                    .subtract(resources_per_worker)
                    .expect("fitness key indicator 0 implies available dominates required");

                let job_id = Uuid::new_v4().to_string();
                let entry_idx = *index_of.entry(address.clone()).or_insert_with(|| {
                    proposed.push((address.clone(), Vec::new()));
                    proposed.len() - 1
                });
                proposed[entry_idx].1.push(job_id);
                num_proposed += 1;
            }

            if proposed.is_empty() {
                break;
            }

            let results = futures::future::join_all(proposed.iter().map(|(address, job_ids)| {
                self.registry
                    .allocate(address, resources_per_worker.clone(), job_ids.clone(), now)
            }))
            .await;

            let mut any_conflict = false;
            for (result, (address, job_ids)) in results.into_iter().zip(proposed) {
                match result {
                    Ok(()) => {
                        num_allocated += job_ids.len() as u32;
                        allocated.entry(address).or_default().extend(job_ids);
                    }
                    Err(_) => any_conflict = true,
                }
            }

            if !any_conflict {
                break;
            }
        }

        (allocated, num_workers.saturating_sub(num_allocated))
    }

    /// Phase B: launch new instances to cover whatever Phase A couldn't place.
    async fn phase_b(
        &self,
        resources_per_worker: &Resources,
        num_workers: u32,
        interruption_ceiling_pct: f64,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<String>>, AllocatorError> {
        let choices = self
            .catalog
            .choose(resources_per_worker, num_workers, interruption_ceiling_pct)?;

        let mut allocated = HashMap::new();
        let mut shortfall = 0u32;

        for choice in choices {
            let addresses = self.launcher.launch(&choice.instance_type, 1).await;
            if addresses.is_empty() {
                shortfall += choice.workers_per_instance_actual;
                continue;
            }

            for address in addresses {
                let job_ids: Vec<String> = (0..choice.workers_per_instance_actual)
                    .map(|_| Uuid::new_v4().to_string())
                    .collect();

                let mut available = choice.instance_type.total_resources();
                for _ in 0..choice.workers_per_instance_actual {
                    available = available.subtract(resources_per_worker).expect(
                        "instance selector chose this shape to fit workers_per_instance_actual",
                    );
                }

                let running_jobs: Vec<(String, Resources)> = job_ids
                    .iter()
                    .cloned()
                    .map(|id| (id, resources_per_worker.clone()))
                    .collect();

                self.registry
                    .register(address.clone(), available, running_jobs, now)
                    .await
                    .map_err(|e| {
                        AllocatorError::Protocol(format!(
                            "failed to register newly launched instance {address}: {e}"
                        ))
                    })?;

                allocated.insert(address, job_ids);
            }
        }

        if shortfall > 0 {
            let total_allocated: u32 = allocated.values().map(|v| v.len() as u32).sum();
            Err(AllocatorError::PartialAllocation {
                partial: allocated,
                allocated: total_allocated,
                requested: num_workers,
            })
        } else {
            Ok(allocated)
        }
    }
}
