//! Grid-Task Queue: fans `T` tasks across `W <= T` workers through a byte-range
//! argument blob, a request queue with a visibility timeout, and a result store polled
//! by the client. Grounded on the argument-blob/result-key/`receive_results`
//! polling-backoff algorithm: one pickled-arguments blob per job, ranged reads per
//! task, and results keyed so lexical order equals `(task_id, attempt)` order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mr_dispatch::ProcessState;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

/// The visibility timeout `V`: how long a worker has to `complete` a task before its
/// message reappears in the queue.
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum GridError {
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("task {0} is not in flight")]
    TaskNotInFlight(u32),
}

/// A byte-range blob store: `task-args/{job_id}` holds one blob per job, read back by
/// range; `task-results/{job_id}/{task_id:06}/{attempt:03}` holds one blob per attempt.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: String, bytes: Vec<u8>);
    async fn get_range(&self, key: &str, range: Option<(usize, usize)>) -> Option<Vec<u8>>;
    async fn list(&self, prefix: &str) -> Vec<String>;
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: String, bytes: Vec<u8>) {
        self.objects.write().await.insert(key, bytes);
    }

    async fn get_range(&self, key: &str, range: Option<(usize, usize)>) -> Option<Vec<u8>> {
        let objects = self.objects.read().await;
        let blob = objects.get(key)?;
        match range {
            Some((from, to)) => Some(blob.get(from..=to)?.to_vec()),
            None => Some(blob.clone()),
        }
    }

    async fn list(&self, prefix: &str) -> Vec<String> {
        self.objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

fn args_key(job_id: &str) -> String {
    format!("task-args/{job_id}")
}

fn results_prefix(job_id: &str) -> String {
    format!("task-results/{job_id}/")
}

fn result_key(job_id: &str, task_id: u32, attempt: u32) -> String {
    format!("{}{:06}/{:03}", results_prefix(job_id), task_id, attempt)
}

fn parse_result_key(key: &str, prefix: &str) -> Option<(u32, u32)> {
    let rest = key.strip_prefix(prefix)?;
    let (task_id, attempt) = rest.split_once('/')?;
    Some((task_id.parse().ok()?, attempt.parse().ok()?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

struct TaskRecord {
    arg_range: (usize, usize),
    attempt: u32,
    state: TaskState,
    visibility_deadline: Option<Instant>,
}

struct JobRecord {
    tasks: Vec<TaskRecord>,
    pending: VecDeque<u32>,
}

/// `submit` → `job_handle`; workers `next_task`/`complete`; clients `receive_results`.
pub struct GridQueue<S: ObjectStore> {
    store: Arc<S>,
    jobs: Mutex<HashMap<String, JobRecord>>,
    retry_ceiling: u32,
}

impl<S: ObjectStore + 'static> GridQueue<S> {
    pub fn new(store: Arc<S>, retry_ceiling: u32) -> Self {
        Self {
            store,
            jobs: Mutex::new(HashMap::new()),
            retry_ceiling,
        }
    }

    /// Pickles each arg into one blob keyed `task-args/{job_id}` and records per-task
    /// byte ranges, then returns the new job's handle.
    pub async fn submit(&self, tasks: Vec<Vec<u8>>) -> String {
        let job_id = Uuid::new_v4().to_string();

        let mut blob = Vec::new();
        let mut records = Vec::with_capacity(tasks.len());
        let mut pending = VecDeque::with_capacity(tasks.len());
        for (task_id, arg) in tasks.into_iter().enumerate() {
            let from = blob.len();
            blob.extend_from_slice(&arg);
            let to = blob.len().saturating_sub(1);
            records.push(TaskRecord {
                arg_range: (from, to),
                attempt: 1,
                state: TaskState::Pending,
                visibility_deadline: None,
            });
            pending.push_back(task_id as u32);
        }

        let task_count = records.len();
        self.store.put(args_key(&job_id), blob).await;
        self.jobs.lock().await.insert(
            job_id.clone(),
            JobRecord {
                tasks: records,
                pending,
            },
        );
        tracing::info!("Submitted grid job {} with {} tasks", job_id, task_count);
        job_id
    }

    /// Reclaims any task whose visibility timeout has elapsed: below the retry
    /// ceiling it goes back to `Pending` with `attempt` incremented, otherwise it's
    /// marked terminally `Failed`. Must be driven periodically by the caller — there
    /// is no background timer here, matching the rest of this crate's no-hidden-tasks
    /// design.
    pub async fn reclaim_expired(&self, job_id: &str) -> Result<(), GridError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| GridError::JobNotFound(job_id.to_string()))?;
        let now = Instant::now();

        for (task_id, task) in job.tasks.iter_mut().enumerate() {
            if task.state != TaskState::InFlight {
                continue;
            }
            let Some(deadline) = task.visibility_deadline else {
                continue;
            };
            if now < deadline {
                continue;
            }

            task.visibility_deadline = None;
            if task.attempt < self.retry_ceiling {
                task.attempt += 1;
                task.state = TaskState::Pending;
                job.pending.push_back(task_id as u32);
                tracing::debug!(
                    "Requeuing job {} task {} (attempt {})",
                    job_id,
                    task_id,
                    task.attempt
                );
            } else {
                task.state = TaskState::Failed;
                tracing::warn!(
                    "Job {} task {} failed past the retry ceiling of {}",
                    job_id,
                    task_id,
                    self.retry_ceiling
                );
            }
        }
        Ok(())
    }

    /// Worker-side: dequeue the next pending task and fetch its argument by ranged GET.
    pub async fn next_task(&self, job_id: &str) -> Result<Option<(u32, u32, Vec<u8>)>, GridError> {
        let (task_id, attempt, range) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| GridError::JobNotFound(job_id.to_string()))?;
            let Some(task_id) = job.pending.pop_front() else {
                return Ok(None);
            };
            let task = &mut job.tasks[task_id as usize];
            task.state = TaskState::InFlight;
            task.visibility_deadline = Some(Instant::now() + VISIBILITY_TIMEOUT);
            (task_id, task.attempt, task.arg_range)
        };

        let arg = self
            .store
            .get_range(&args_key(job_id), Some(range))
            .await
            .unwrap_or_default();
        Ok(Some((task_id, attempt, arg)))
    }

    /// Worker-side: writes the result object and marks the task terminal.
    pub async fn complete(
        &self,
        job_id: &str,
        task_id: u32,
        attempt: u32,
        process_state: ProcessState,
    ) -> Result<(), GridError> {
        {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| GridError::JobNotFound(job_id.to_string()))?;
            let task = job
                .tasks
                .get_mut(task_id as usize)
                .ok_or(GridError::TaskNotInFlight(task_id))?;
            if task.state != TaskState::InFlight {
                return Err(GridError::TaskNotInFlight(task_id));
            }
            task.state = if process_state.is_terminal_success() {
                TaskState::Succeeded
            } else {
                TaskState::Failed
            };
            task.visibility_deadline = None;
        }

        tracing::info!(
            "Job {} task {} attempt {} completed as {:?}",
            job_id,
            task_id,
            attempt,
            process_state.state
        );
        let bytes = serde_json::to_vec(&process_state).unwrap_or_default();
        self.store
            .put(result_key(job_id, task_id, attempt), bytes)
            .await;
        Ok(())
    }

    /// One-shot variant of the polling loop inside [`GridQueue::receive_results`]: lists
    /// every result object under the job's prefix and parses it. Used by callers (e.g.
    /// a gRPC facade) that already have their own polling cadence and just want
    /// "what's done right now", keeping the dedup-by-key bookkeeping on their side.
    pub async fn poll_results(&self, job_id: &str) -> Vec<(u32, u32, mr_dispatch::ProcessState)> {
        let prefix = results_prefix(job_id);
        let mut out = Vec::new();
        for key in self.store.list(&prefix).await {
            let Some((task_id, attempt)) = parse_result_key(&key, &prefix) else {
                continue;
            };
            if let Some(bytes) = self.store.get_range(&key, None).await {
                if let Ok(state) = serde_json::from_slice(&bytes) {
                    out.push((task_id, attempt, state));
                }
            }
        }
        out
    }

    /// Streams completions to a channel in arrival order, polling with exponential
    /// backoff bounded by `receive_message_wait_seconds`. Exits when `stop` fires, or
    /// when `workers_exited` has fired and three additional 1s polls produce nothing
    /// new.
    pub fn receive_results(
        self: Arc<Self>,
        job_id: String,
        mut stop: mpsc::Receiver<()>,
        mut workers_exited: mpsc::Receiver<()>,
        receive_message_wait_seconds: u64,
    ) -> mpsc::UnboundedReceiver<Vec<(u32, u32, ProcessState)>> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let prefix = results_prefix(&job_id);
            let mut seen: HashSet<String> = HashSet::new();
            let mut wait = Duration::from_secs(1);
            let mut workers_exited_flag = false;
            let mut workers_exited_wait_count = 0u32;

            loop {
                if stop.try_recv().is_ok() {
                    return;
                }
                if !workers_exited_flag && workers_exited.try_recv().is_ok() {
                    workers_exited_flag = true;
                }

                let keys = self.store.list(&prefix).await;
                let mut new_results = Vec::new();
                for key in &keys {
                    if seen.contains(key) {
                        continue;
                    }
                    if let Some((task_id, attempt)) = parse_result_key(key, &prefix) {
                        if let Some(bytes) = self.store.get_range(key, None).await {
                            if let Ok(state) = serde_json::from_slice::<ProcessState>(&bytes) {
                                new_results.push((task_id, attempt, state));
                            }
                        }
                    }
                }
                seen.extend(keys);

                if new_results.is_empty() {
                    if workers_exited_flag {
                        workers_exited_wait_count += 1;
                        if workers_exited_wait_count >= 3 {
                            return;
                        }
                        wait = Duration::from_secs(1);
                    } else {
                        wait = (wait * 2).min(Duration::from_secs(receive_message_wait_seconds));
                    }
                } else {
                    workers_exited_wait_count = 0;
                    wait = Duration::from_secs(0);
                    if tx.send(new_results).is_err() {
                        return;
                    }
                }

                tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
            }
        });

        rx
    }
}

trait TerminalSuccess {
    fn is_terminal_success(&self) -> bool;
}

impl TerminalSuccess for ProcessState {
    fn is_terminal_success(&self) -> bool {
        self.state == mr_dispatch::ProcessStateKind::Succeeded
    }
}
