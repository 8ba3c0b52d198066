//! The per-job state machine.
//!
//! `Queued -> Downloading -> ModelLoading -> Separating -> Uploading -> Notifying -> Completed`,
//! with any step failure moving straight to `Failed`. Every exit path removes the job's
//! workspace, and every failure sends a best-effort `failed` webhook before the error is
//! handed back to the caller.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use crate::config::AppConfig;
use crate::download::{InputFetcher, InputLocator};
use crate::probe::{DurationProbe, FfprobeDuration};
use crate::separator::{resolve_model, separator_from_config, stem_output_path, ModelSpec, Separator};
use crate::signing::RequestSigner;
use crate::storage::StorageClient;
use crate::types::{JobDescriptor, JobResult, JobStatus, OutcomeStatus, Stem, StemType, WebhookPayload};
use crate::webhook::WebhookNotifier;

const WORKSPACE_PREFIX: &str = "stemsplit-";
const SEPARATED_DIR_NAME: &str = "separated";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to prepare job workspace: {0}")]
    Workspace(#[source] io::Error),
    #[error("download failed: {0:#}")]
    Download(anyhow::Error),
    #[error("model loading failed: {0:#}")]
    ModelLoad(anyhow::Error),
    #[error("separation failed: {0:#}")]
    Separation(anyhow::Error),
    #[error("upload failed: {0:#}")]
    Upload(anyhow::Error),
    #[error("job was cancelled before {0}")]
    Cancelled(JobStatus),
}

impl PipelineError {
    /// The step that was running (or about to run) when the job failed.
    pub fn step(&self) -> JobStatus {
        match self {
            Self::Workspace(_) => JobStatus::Queued,
            Self::Download(_) => JobStatus::Downloading,
            Self::ModelLoad(_) => JobStatus::ModelLoading,
            Self::Separation(_) => JobStatus::Separating,
            Self::Upload(_) => JobStatus::Uploading,
            Self::Cancelled(step) => *step,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Workspace(_) => "workspace",
            Self::Download(_) => "download",
            Self::ModelLoad(_) => "model_load",
            Self::Separation(_) => "separation",
            Self::Upload(_) => "upload",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

/// Receives every status transition with its human-readable label.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, job_id: &str, status: JobStatus, label: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, job_id: &str, status: JobStatus, label: &str) {
        info!(job_id, status = %status, "{label}");
    }
}

/// A uniquely named scratch directory owned by one job. Removed on drop; removal
/// failures are logged.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    pub fn create(root: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn separated_dir(&self) -> PathBuf {
        self.path.join(SEPARATED_DIR_NAME)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(error) = dir.close() {
                warn!(path = %self.path.display(), error = %error, "Failed to remove job workspace");
            }
        }
    }
}

pub struct JobPipeline {
    storage: StorageClient,
    fetcher: InputFetcher,
    separator: Arc<dyn Separator>,
    probe: Arc<dyn DurationProbe>,
    notifier: WebhookNotifier,
    progress: Arc<dyn ProgressReporter>,
    workspace_root: Option<PathBuf>,
}

impl JobPipeline {
    pub fn new(
        storage: StorageClient,
        fetcher: InputFetcher,
        separator: Arc<dyn Separator>,
        probe: Arc<dyn DurationProbe>,
        notifier: WebhookNotifier,
    ) -> Self {
        Self {
            storage,
            fetcher,
            separator,
            probe,
            notifier,
            progress: Arc::new(LogProgress),
            workspace_root: None,
        }
    }

    /// Wires the production collaborators from configuration. Must be called from a
    /// blocking context: it builds blocking HTTP clients.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let storage = StorageClient::from_config(&config.storage, config.retry.storage.clone())
            .context("failed to set up object storage")?;
        let fetcher = InputFetcher::new(storage.clone(), config.retry.download.clone())?;
        let signer = RequestSigner::new(&config.security.token);
        let notifier = WebhookNotifier::new(signer, &config.webhook)?;

        Ok(Self::new(
            storage,
            fetcher,
            separator_from_config(&config.separator),
            Arc::new(FfprobeDuration::default()),
            notifier,
        )
        .with_workspace_root(config.worker.workspace_root.clone()))
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_workspace_root(mut self, root: Option<PathBuf>) -> Self {
        self.workspace_root = root;
        self
    }

    /// Runs the job to a terminal state. The terminal webhook is attempted on every
    /// path; its failure never changes the outcome.
    pub fn run(
        &self,
        descriptor: &JobDescriptor,
        cancel: &CancellationToken,
    ) -> Result<JobResult, PipelineError> {
        let started = Instant::now();
        let span = info_span!(
            "job",
            job_id = %descriptor.job_id,
            correlation_id = descriptor.correlation_id.as_deref().unwrap_or("")
        );
        let _entered = span.enter();
        info!(model = %descriptor.model_name, "Job started");

        match self.process(descriptor, cancel) {
            Ok(stems) => {
                let elapsed_ms = elapsed_ms(started);
                let stem_count = stems.len();
                let payload = WebhookPayload::completed(&descriptor.job_id, stems, elapsed_ms);

                self.transition(descriptor, JobStatus::Notifying);
                if !self
                    .notifier
                    .send_with_retry(&descriptor.callback_url, &payload)
                {
                    warn!("Completion webhook was not delivered");
                }
                self.transition(descriptor, JobStatus::Completed);

                info!(processing_time_ms = elapsed_ms, stem_count, "Job completed");
                Ok(JobResult {
                    status: OutcomeStatus::Completed,
                    job_id: descriptor.job_id.clone(),
                    processing_time_ms: elapsed_ms,
                    stem_count,
                })
            }
            Err(failure) => {
                let elapsed_ms = elapsed_ms(started);
                error!(
                    step = %failure.step(),
                    kind = failure.kind(),
                    error = %failure,
                    "Job failed"
                );

                let payload =
                    WebhookPayload::failed(&descriptor.job_id, failure.to_string(), elapsed_ms);
                if !self
                    .notifier
                    .send_with_retry(&descriptor.callback_url, &payload)
                {
                    warn!("Failure webhook was not delivered");
                }
                self.transition(descriptor, JobStatus::Failed);
                Err(failure)
            }
        }
    }

    /// Steps up to and including the upload. The workspace lives exactly as long as this call.
    fn process(
        &self,
        descriptor: &JobDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<Stem>, PipelineError> {
        let workspace =
            Workspace::create(self.workspace_root.as_deref()).map_err(PipelineError::Workspace)?;

        self.begin(descriptor, cancel, JobStatus::Downloading)?;
        let input = InputLocator::parse(&descriptor.input_locator)
            .and_then(|locator| self.fetcher.fetch(&locator, workspace.path()))
            .map_err(PipelineError::Download)?;

        self.begin(descriptor, cancel, JobStatus::ModelLoading)?;
        let model = resolve_model(&descriptor.model_name)
            .and_then(|model| self.separator.load_model(&model).map(|()| model))
            .map_err(PipelineError::ModelLoad)?;

        self.begin(descriptor, cancel, JobStatus::Separating)?;
        let out_dir = workspace.separated_dir();
        self.separator
            .separate(&input, &model, &out_dir)
            .map_err(PipelineError::Separation)?;
        let produced = collect_stems(&out_dir, &model);
        if produced.is_empty() {
            return Err(PipelineError::Separation(anyhow::anyhow!(
                "separator produced no stems for model {}",
                model.name
            )));
        }
        info!(
            backend = self.separator.name(),
            stems = ?produced.iter().map(|(stem, _)| stem.as_str()).collect::<Vec<_>>(),
            "Separation finished"
        );

        self.begin(descriptor, cancel, JobStatus::Uploading)?;
        produced
            .iter()
            .map(|(stem_type, path)| self.upload_stem(&descriptor.job_id, *stem_type, path))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(PipelineError::Upload)
    }

    fn upload_stem(&self, job_id: &str, stem_type: StemType, path: &Path) -> anyhow::Result<Stem> {
        let size_bytes = fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        let checksum = sha256_checksum(path)?;
        let duration_seconds = self.probe.duration_seconds(path);
        let key = format!("{job_id}/{}", stem_type.file_name());

        let storage_url = self
            .storage
            .upload_file(path, &key, Some("audio/wav"))
            .with_context(|| format!("failed to upload {key}"))?;

        Ok(Stem {
            stem_type,
            display_name: stem_type.display_name().to_string(),
            storage_url,
            size_bytes,
            duration_seconds,
            checksum,
        })
    }

    fn begin(
        &self,
        descriptor: &JobDescriptor,
        cancel: &CancellationToken,
        status: JobStatus,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(status));
        }
        self.transition(descriptor, status);
        Ok(())
    }

    fn transition(&self, descriptor: &JobDescriptor, status: JobStatus) {
        self.progress
            .report(&descriptor.job_id, status, status.progress_label());
    }
}

/// Stems present under `<out>/<model>/`, in canonical order.
fn collect_stems(out_dir: &Path, model: &ModelSpec) -> Vec<(StemType, PathBuf)> {
    let mut stems: Vec<(StemType, PathBuf)> = model
        .stems
        .iter()
        .map(|stem| (*stem, stem_output_path(out_dir, model, *stem)))
        .filter(|(_, path)| path.is_file())
        .collect();
    stems.sort_by_key(|(stem, _)| *stem);
    stems
}

/// `sha256:<lowercase hex>` of the file's bytes.
pub fn sha256_checksum(path: &Path) -> anyhow::Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
