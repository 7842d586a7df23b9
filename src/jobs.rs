use crate::{
    autopilot::{BatchOrchestrator, BatchReport, BatchTrigger},
    models::ApiError,
    pipeline::PipelineErrorKind,
};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_JITTER_MS: u64 = 250;
const STATUS_TTL_SECS: u64 = 3600;

/// In-process queue of "run the next batch for this run" messages.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    max_attempts: u32,
    /// How long a finished job stays visible to `GET /jobs/{id}`.
    status_ttl: Duration,
}

/// Receiving half; becomes the worker task once an orchestrator exists.
pub struct JobWorker {
    rx: mpsc::Receiver<Job>,
    queue: JobQueue,
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    run_id: Uuid,
    attempt: u32,
}

struct JobEntry {
    run_id: Uuid,
    state: JobState,
    updated: Instant,
}

impl JobEntry {
    fn expired(&self, ttl: Duration) -> bool {
        self.state.is_finished() && self.updated.elapsed() >= ttl
    }
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued { attempt: u32 },
    Running { attempt: u32 },
    Completed { report: BatchReport },
    Failed { error: String, stage: String, attempts: u32 },
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub run_id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    /// The queue exists before the worker so the orchestrator can hold the
    /// queue as its continuation trigger.
    pub fn channel(
        capacity: usize,
        max_attempts: u32,
        status_ttl: Duration,
    ) -> (Self, JobWorker) {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let queue = Self {
            tx,
            statuses: Arc::new(Mutex::new(HashMap::new())),
            max_attempts: max_attempts.max(1),
            status_ttl,
        };
        let worker = JobWorker {
            rx,
            queue: queue.clone(),
        };
        (queue, worker)
    }

    pub fn from_env() -> (Self, JobWorker) {
        Self::channel(
            queue_capacity_from_env(),
            max_attempts_from_env(),
            status_ttl_from_env(),
        )
    }

    pub async fn enqueue_batch(&self, run_id: Uuid) -> Result<Uuid, ApiError> {
        let job = Job {
            id: Uuid::new_v4(),
            run_id,
            attempt: 1,
        };
        let id = job.id;
        self.set_state(&job, JobState::Queued { attempt: 1 }).await;
        self.tx.send(job).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard
            .get(&id)
            .filter(|entry| !entry.expired(self.status_ttl))
            .map(|entry| JobInfo {
                id: id.to_string(),
                run_id: entry.run_id.to_string(),
                state: entry.state.clone(),
            })
    }

    /// Records a transition and drops finished jobs older than the TTL.
    async fn set_state(&self, job: &Job, state: JobState) {
        let mut guard = self.statuses.lock().await;
        let before = guard.len();
        guard.retain(|_, entry| !entry.expired(self.status_ttl));
        let pruned = before - guard.len();
        if pruned > 0 {
            debug!(target = "relist.jobs", pruned, "statuses_pruned");
        }
        guard.insert(
            job.id,
            JobEntry {
                run_id: job.run_id,
                state,
                updated: Instant::now(),
            },
        );
    }

    /// Re-sends a job after a jittered exponential delay, off the worker
    /// task so the worker never waits on its own channel.
    fn redeliver(&self, mut job: Job) {
        let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << (job.attempt - 1).min(6));
        let delay = Duration::from_millis(exp + rand::rng().random_range(0..BACKOFF_JITTER_MS));
        job.attempt += 1;
        let queue = self.clone();
        tokio::spawn(async move {
            queue
                .set_state(&job, JobState::Queued { attempt: job.attempt })
                .await;
            tokio::time::sleep(delay).await;
            if queue.tx.send(job).await.is_err() {
                warn!(target = "relist.jobs", "redelivery_dropped");
            }
        });
    }
}

#[async_trait]
impl BatchTrigger for JobQueue {
    async fn schedule(&self, run_id: Uuid) {
        // Called from inside the worker; a full channel must not block it.
        let queue = self.clone();
        tokio::spawn(async move {
            match queue.enqueue_batch(run_id).await {
                Ok(job_id) => info!(
                    target = "relist.jobs",
                    run_id = %run_id,
                    job_id = %job_id,
                    "continuation_enqueued"
                ),
                Err(err) => warn!(
                    target = "relist.jobs",
                    run_id = %run_id,
                    error = %err.error,
                    "continuation_dropped"
                ),
            }
        });
    }
}

impl JobWorker {
    pub fn spawn(self, orchestrator: BatchOrchestrator) -> JoinHandle<()> {
        let Self { mut rx, queue } = self;
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                queue
                    .set_state(&job, JobState::Running { attempt: job.attempt })
                    .await;

                match orchestrator.run_batch(job.run_id).await {
                    Ok(report) => {
                        queue.set_state(&job, JobState::Completed { report }).await;
                    }
                    Err(err)
                        if err.kind() == PipelineErrorKind::Internal
                            && job.attempt < queue.max_attempts =>
                    {
                        warn!(
                            target = "relist.jobs",
                            job_id = %job.id,
                            attempt = job.attempt,
                            error = %err,
                            "batch_step_retrying"
                        );
                        queue.redeliver(job);
                    }
                    Err(err) => {
                        warn!(
                            target = "relist.jobs",
                            job_id = %job.id,
                            error = %err,
                            "batch_step_failed"
                        );
                        let state = JobState::Failed {
                            error: err.detail().to_string(),
                            stage: err.stage().to_string(),
                            attempts: job.attempt,
                        };
                        queue.set_state(&job, state).await;
                    }
                }
            }
        })
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

fn status_ttl_from_env() -> Duration {
    let secs = std::env::var("JOB_STATUS_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(STATUS_TTL_SECS);
    Duration::from_secs(secs)
}

fn max_attempts_from_env() -> u32 {
    std::env::var("JOB_MAX_ATTEMPTS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(3)
}
