//! In-process, non-durable job queue with a fixed pool of workers.
//!
//! Each job runs on the blocking thread pool. A worker cancels the job's token at the
//! soft time limit and stops waiting at the hard limit, recording a time-limit failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::pipeline::{JobPipeline, ProgressReporter};
use crate::types::{JobDescriptor, JobResult, JobStatus, WebhookPayload};
use crate::webhook::WebhookNotifier;

/// Builds a fresh pipeline for one job. Called on a blocking thread.
pub type PipelineFactory = Arc<dyn Fn() -> anyhow::Result<JobPipeline> + Send + Sync>;

/// Builds the notifier used when a job's pipeline cannot be built. Called on a blocking thread.
pub type NotifierFactory = Arc<dyn Fn() -> anyhow::Result<WebhookNotifier> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub capacity: usize,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    /// Finished records older than this are dropped on the next submission.
    pub retention: Duration,
}

impl From<&WorkerConfig> for QueueSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            capacity: config.queue_capacity,
            soft_time_limit: Duration::from_secs(config.soft_time_limit_secs),
            hard_time_limit: Duration::from_secs(config.hard_time_limit_secs),
            retention: Duration::from_secs(config.result_retention_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_id: String,
    pub model_name: String,
    pub status: JobStatus,
    pub progress: String,
    pub error: Option<String>,
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    cancel_token: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue_depth: usize,
    pub active_workers: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("job queue is full")]
    Full,
    #[error("job queue is not accepting jobs")]
    Closed,
}

struct QueuedJob {
    id: Uuid,
    descriptor: JobDescriptor,
}

struct QueueShared {
    records: DashMap<Uuid, JobRecord>,
    failure_notifier: Option<NotifierFactory>,
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl QueueShared {
    fn update(&self, id: &Uuid, apply: impl FnOnce(&mut JobRecord)) {
        if let Some(mut record) = self.records.get_mut(id) {
            apply(&mut record);
            record.updated_at = Utc::now();
        }
    }

    fn evict_expired(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        let before = self.records.len();
        self.records
            .retain(|_, record| !(record.status.is_terminal() && record.updated_at <= cutoff));
        before.saturating_sub(self.records.len())
    }

    fn finish(&self, id: &Uuid, outcome: Result<JobResult, String>) {
        match outcome {
            Ok(result) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                self.update(id, |record| {
                    record.status = JobStatus::Completed;
                    record.progress = JobStatus::Completed.progress_label().to_string();
                    record.result = Some(result);
                });
            }
            Err(message) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.update(id, |record| {
                    record.status = JobStatus::Failed;
                    record.progress = JobStatus::Failed.progress_label().to_string();
                    record.error = Some(message);
                });
            }
        }
    }
}

/// Mirrors pipeline transitions into the job record. Terminal records are left alone,
/// so a job abandoned at the hard limit cannot overwrite its recorded failure.
struct RecordProgress {
    shared: Arc<QueueShared>,
    id: Uuid,
}

impl ProgressReporter for RecordProgress {
    fn report(&self, job_id: &str, status: JobStatus, label: &str) {
        let mut applied = false;
        self.shared.update(&self.id, |record| {
            if !record.status.is_terminal() {
                record.status = status;
                record.progress = label.to_string();
                applied = true;
            }
        });
        if applied {
            info!(job_id, status = %status, "{label}");
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<QueueShared>,
    sender: mpsc::Sender<QueuedJob>,
    retention: Duration,
}

impl JobQueue {
    /// Spawns the worker tasks on the current tokio runtime.
    pub fn start(settings: QueueSettings, factory: PipelineFactory) -> Self {
        Self::spawn_workers(settings, factory, None)
    }

    /// Like [`JobQueue::start`], and sends a signed `failed` webhook for jobs whose pipeline
    /// cannot be built.
    pub fn start_with_failure_notifier(
        settings: QueueSettings,
        factory: PipelineFactory,
        notifier: NotifierFactory,
    ) -> Self {
        Self::spawn_workers(settings, factory, Some(notifier))
    }

    fn spawn_workers(
        settings: QueueSettings,
        factory: PipelineFactory,
        failure_notifier: Option<NotifierFactory>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<QueuedJob>(settings.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let shared = Arc::new(QueueShared {
            records: DashMap::new(),
            failure_notifier,
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });

        for worker in 0..settings.concurrency.max(1) {
            let receiver = Arc::clone(&receiver);
            let shared = Arc::clone(&shared);
            let factory = Arc::clone(&factory);
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(job) = next else {
                        break;
                    };
                    shared.queued.fetch_sub(1, Ordering::SeqCst);
                    shared.active.fetch_add(1, Ordering::SeqCst);
                    let span = tracing::info_span!("worker", worker, job_id = %job.descriptor.job_id);
                    run_job(&shared, &factory, settings, job)
                        .instrument(span)
                        .await;
                    shared.active.fetch_sub(1, Ordering::SeqCst);
                }
                info!(worker, "Worker stopped");
            });
        }

        info!(
            concurrency = settings.concurrency.max(1),
            capacity = settings.capacity.max(1),
            retention_secs = settings.retention.as_secs(),
            "Job queue started"
        );
        Self {
            shared,
            sender,
            retention: settings.retention,
        }
    }

    /// Records the job as `Queued` and hands it to the workers. Returns the record id.
    pub fn submit(&self, descriptor: JobDescriptor) -> Result<Uuid, SubmitError> {
        let evicted = self.shared.evict_expired(self.retention);
        if evicted > 0 {
            debug!(evicted, "Dropped expired job records");
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        self.shared.records.insert(
            id,
            JobRecord {
                id,
                job_id: descriptor.job_id.clone(),
                model_name: descriptor.model_name.clone(),
                status: JobStatus::Queued,
                progress: JobStatus::Queued.progress_label().to_string(),
                error: None,
                result: None,
                created_at: now,
                updated_at: now,
                cancel_token: CancellationToken::new(),
            },
        );

        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(QueuedJob { id, descriptor }) {
            Ok(()) => Ok(id),
            Err(error) => {
                self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                self.shared.records.remove(&id);
                Err(match error {
                    mpsc::error::TrySendError::Full(_) => SubmitError::Full,
                    mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
                })
            }
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<JobRecord> {
        self.shared.records.get(id).map(|record| record.clone())
    }

    /// Requests cancellation; the job stops at its next step boundary.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.shared.records.get(id) {
            Some(record) if !record.status.is_terminal() => {
                record.cancel_token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_depth: self.shared.queued.load(Ordering::SeqCst),
            active_workers: self.shared.active.load(Ordering::SeqCst),
            completed_jobs: self.shared.completed.load(Ordering::SeqCst),
            failed_jobs: self.shared.failed.load(Ordering::SeqCst),
        }
    }
}

async fn run_job(
    shared: &Arc<QueueShared>,
    factory: &PipelineFactory,
    settings: QueueSettings,
    job: QueuedJob,
) {
    let QueuedJob { id, descriptor } = job;
    let Some(cancel) = shared
        .records
        .get(&id)
        .map(|record| record.cancel_token.clone())
    else {
        return;
    };

    let reporter = Arc::new(RecordProgress {
        shared: Arc::clone(shared),
        id,
    });
    let factory = Arc::clone(factory);
    let failure_notifier = shared.failure_notifier.clone();
    let token = cancel.clone();
    let span = tracing::Span::current();
    let mut handle = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let pipeline = match factory() {
            Ok(pipeline) => pipeline.with_progress(reporter),
            Err(error) => {
                let message = format!("failed to prepare pipeline: {error:#}");
                notify_unprepared(failure_notifier.as_ref(), &descriptor, &message);
                return Err(message);
            }
        };
        pipeline
            .run(&descriptor, &token)
            .map_err(|failure| failure.to_string())
    });

    let joined = tokio::select! {
        joined = &mut handle => Some(joined),
        _ = tokio::time::sleep(settings.soft_time_limit) => None,
    };

    let joined = match joined {
        Some(joined) => joined,
        None => {
            warn!(
                limit_secs = settings.soft_time_limit.as_secs_f64(),
                "Soft time limit reached; cancelling job"
            );
            cancel.cancel();
            let remaining = settings
                .hard_time_limit
                .saturating_sub(settings.soft_time_limit);
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    error!(
                        limit_secs = settings.hard_time_limit.as_secs_f64(),
                        "Hard time limit reached; abandoning job"
                    );
                    shared.finish(
                        &id,
                        Err(format!(
                            "job exceeded hard time limit of {}s",
                            settings.hard_time_limit.as_secs_f64()
                        )),
                    );
                    return;
                }
            }
        }
    };

    let outcome = joined.unwrap_or_else(|join_error| Err(format!("job worker crashed: {join_error}")));
    if let Err(message) = &outcome {
        warn!(error = %message, "Job finished with failure");
    }
    shared.finish(&id, outcome);
}

/// Best-effort `failed` webhook for a job that never reached its pipeline.
fn notify_unprepared(notifier: Option<&NotifierFactory>, descriptor: &JobDescriptor, message: &str) {
    let Some(build) = notifier else {
        warn!("No notifier available; failure webhook not sent");
        return;
    };
    match build() {
        Ok(notifier) => {
            let payload = WebhookPayload::failed(&descriptor.job_id, message, 0);
            if !notifier.send_with_retry(&descriptor.callback_url, &payload) {
                warn!("Failure webhook was not delivered");
            }
        }
        Err(error) => warn!(error = %format!("{error:#}"), "Could not build webhook notifier"),
    }
}
