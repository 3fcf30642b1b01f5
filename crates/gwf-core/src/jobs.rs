use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::errors::EvalError;
use crate::status::StatusCode;

/// Retained job records, per repository.
const HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Re-evaluate one pull request.
    PullRequest { pr_id: u64 },
    /// A commit landed on some branch; find the PRs it affects.
    Commit { sha: String, branch: String },
    /// A build finished on some commit.
    BuildStatus { sha: String, branch: String },
    QueueRebuild,
    ForceMerge,
    DeleteQueues,
    CreateBranch { branch: String, from: String },
    DeleteBranch { branch: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    #[serde(flatten)]
    pub kind: JobKind,
    /// Who asked, for jobs that came through the API.
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub details: Option<String>,
    #[serde(default)]
    pub attempt: u32,
}

/// Exponential backoff with jitter for transient host failures.
pub fn retry_delay(attempt: u32) -> Duration {
    let base = 2u64.saturating_pow(attempt).min(300);
    let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
    Duration::from_secs(base + jitter)
}

struct QueueInner {
    pending: VecDeque<Job>,
    history: VecDeque<Job>,
    next_id: u64,
}

/// FIFO job queue for one repository, with deduplication and a bounded
/// history ring. All state sits behind one short critical section.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    wake: mpsc::UnboundedSender<()>,
}

impl JobQueue {
    pub fn new() -> (Arc<JobQueue>, mpsc::UnboundedReceiver<()>) {
        let (wake, rx) = mpsc::unbounded_channel();
        (
            Arc::new(JobQueue {
                inner: Mutex::new(QueueInner {
                    pending: VecDeque::new(),
                    history: VecDeque::new(),
                    next_id: 1,
                }),
                wake,
            }),
            rx,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue a job. A `PullRequest` job is dropped when the same PR
    /// already has one pending; returns the job id otherwise.
    pub fn enqueue(&self, kind: JobKind, user: Option<String>) -> Option<u64> {
        let mut inner = self.lock();
        if let JobKind::PullRequest { pr_id } = &kind {
            let duplicate = inner
                .pending
                .iter()
                .any(|j| matches!(&j.kind, JobKind::PullRequest { pr_id: p } if p == pr_id));
            if duplicate {
                return None;
            }
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.push_back(Job {
            id,
            kind,
            user,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: JobStatus::Queued,
            details: None,
            attempt: 0,
        });
        drop(inner);
        let _ = self.wake.send(());
        Some(id)
    }

    /// Put a retried job back at the end of the line.
    fn requeue(&self, job: Job) {
        self.lock().pending.push_back(job);
        let _ = self.wake.send(());
    }

    fn pop(&self) -> Option<Job> {
        self.lock().pending.pop_front()
    }

    fn record(&self, job: Job) {
        let mut inner = self.lock();
        inner.history.push_back(job);
        while inner.history.len() > HISTORY_LIMIT {
            inner.history.pop_front();
        }
    }

    /// Most recent first.
    pub fn history(&self) -> Vec<Job> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner.history.iter().cloned().collect();
        jobs.extend(inner.pending.iter().cloned());
        jobs.reverse();
        jobs
    }

    pub fn get(&self, id: u64) -> Option<Job> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .chain(inner.pending.iter())
            .find(|j| j.id == id)
            .cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Wake the worker without enqueuing anything (used at shutdown so it
    /// can observe the flag).
    pub fn kick(&self) {
        let _ = self.wake.send(());
    }
}

/// What the worker hands each job to. Implemented by the per-repository
/// robot; kept as a trait so the loop needs nothing but the seam.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one job. `Ok` carries a human-readable outcome.
    async fn process(&self, job: &Job) -> Result<String, EvalError>;

    /// A check failed with a user-facing status: post it (idempotently).
    async fn report(&self, job: &Job, code: StatusCode, context: &serde_json::Value);

    /// Something broke: leave a generic internal-error note, best effort.
    async fn report_internal_error(&self, job: &Job);
}

/// Single background worker for one repository. Jobs are strictly
/// serialized; the workspace has exactly one writer.
pub async fn run_worker(
    queue: Arc<JobQueue>,
    mut wake: mpsc::UnboundedReceiver<()>,
    handler: Arc<dyn JobHandler>,
    shutdown: Arc<AtomicBool>,
    max_retries: u32,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            info!("worker shutting down");
            return;
        }
        while let Some(mut job) = queue.pop() {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());

            match handler.process(&job).await {
                Ok(details) => {
                    job.status = JobStatus::Completed;
                    job.details = Some(details);
                }
                Err(EvalError::UserFacing { code, context }) => {
                    handler.report(&job, code, &context).await;
                    job.status = JobStatus::Completed;
                    job.details = Some(format!("status {}", code.code()));
                }
                Err(EvalError::NotMyJob(reason)) => {
                    job.status = JobStatus::Completed;
                    job.details = Some(format!("not my job: {reason}"));
                }
                Err(EvalError::Transient(e)) => {
                    if job.attempt < max_retries {
                        job.attempt += 1;
                        let delay = retry_delay(job.attempt);
                        warn!(
                            "job #{} transient failure (attempt {}), retrying in {:?}: {e:#}",
                            job.id, job.attempt, delay
                        );
                        let queue = Arc::clone(&queue);
                        let retry = Job {
                            status: JobStatus::Queued,
                            started_at: None,
                            ..job
                        };
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            queue.requeue(retry);
                        });
                        continue;
                    }
                    job.status = JobStatus::Failed;
                    job.details = Some(format!("gave up after {} attempts: {e:#}", job.attempt));
                    error!("job #{} exhausted retries: {e:#}", job.id);
                }
                Err(EvalError::Fatal(e)) => {
                    error!("job #{} fatal error: {e:#}", job.id);
                    handler.report_internal_error(&job).await;
                    job.status = JobStatus::Failed;
                    job.details = Some(format!("{e:#}"));
                }
            }

            job.finished_at = Some(Utc::now());
            queue.record(job);

            if shutdown.load(Ordering::Acquire) {
                info!("worker shutting down");
                return;
            }
        }
        if wake.recv().await.is_none() {
            return;
        }
    }
}
