//! Request-level pipeline: build, purge, execute, resolve, hand off.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::downloader::errors::{DownloadError, EngineFailure, Result, RetentionWarning};
use crate::downloader::job::{JobBuilder, JobOptions};
use crate::downloader::models::{JobDescriptor, OutcomeStatus, RetentionPolicy};
use crate::downloader::orchestrator::{ArtifactJournal, ExecutionAdapter, Operation};
use crate::downloader::resolver::ArtifactResolver;
use crate::downloader::retention::{OutputDirectory, RetentionManager};
use crate::downloader::traits::ExtractionEngine;
use crate::downloader::utils::mime_type_for;
use crate::ytdlp::YtDlpEngine;

/// What a submitted job produced
#[derive(Debug)]
pub enum JobResult {
    /// Sanitized metadata document (`info` mode)
    Metadata(Value),
    Artifact(ServedArtifact),
    /// The filter vetoed the download; nothing was transferred
    Filtered { reason: String },
}

/// A resolved artifact ready to be streamed to the caller.
///
/// Holds the directory gate (when the retention policy needs one) until
/// [`finish`](Self::finish) is called or the value is dropped. Dropping
/// without `finish` never deletes the file.
#[derive(Debug)]
pub struct ServedArtifact {
    path: PathBuf,
    file_name: String,
    content_type: &'static str,
    output_dir: OutputDirectory,
    retention: RetentionManager,
    _gate: Option<OwnedMutexGuard<()>>,
}

impl ServedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// Call once the artifact has been fully handed over
    pub fn finish(self) -> Vec<RetentionWarning> {
        self.retention.after_serve(&self.path, &self.output_dir)
    }
}

/// Removes whatever the engine reported if the job does not reach hand-off,
/// including when the job future is dropped mid-transfer
struct PartialCleanup<'a> {
    journal: ArtifactJournal,
    retention: &'a RetentionManager,
    armed: bool,
}

impl<'a> PartialCleanup<'a> {
    fn new(journal: ArtifactJournal, retention: &'a RetentionManager) -> Self {
        Self {
            journal,
            retention,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialCleanup<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let paths = self.journal.paths();
        if !paths.is_empty() {
            info!(count = paths.len(), "removing partial artifacts");
            self.retention.cleanup_partial(&paths);
        }
    }
}

pub struct DownloadService {
    builder: JobBuilder,
    adapter: ExecutionAdapter,
    output_dir: OutputDirectory,
    retention: RetentionManager,
}

impl DownloadService {
    pub fn new(config: &ServiceConfig, engine: Arc<dyn ExtractionEngine>) -> Self {
        Self {
            builder: JobBuilder::new(config.output_dir.clone()),
            adapter: ExecutionAdapter::new(engine),
            output_dir: OutputDirectory::new(config.output_dir.clone()),
            retention: RetentionManager::new(config.retention, config.manifest_exceptions.clone()),
        }
    }

    /// Service backed by the yt-dlp binary
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config, Arc::new(YtDlpEngine::new(config.engine.clone())))
    }

    pub fn output_dir(&self) -> &OutputDirectory {
        &self.output_dir
    }

    /// Build a job from request input and run it to completion.
    ///
    /// The `delete_after` flag additionally deletes this job's artifact once
    /// served. The configured policy still governs the purge before the job.
    pub async fn submit_job(&self, url: &str, mode: &str, options: &JobOptions) -> Result<JobResult> {
        let job = self.builder.build(url, mode, options)?;
        let hand_off = if options.flag("delete_after") {
            RetentionManager::new(RetentionPolicy::DeleteAfterServe, self.retention.exceptions().to_vec())
        } else {
            self.retention.clone()
        };
        self.run(job, hand_off).await
    }

    /// `hand_off` decides what happens to the artifact once it is served
    async fn run(&self, job: JobDescriptor, hand_off: RetentionManager) -> Result<JobResult> {
        info!(mode = %job.mode(), url = job.source_url(), engine = self.adapter.engine_name(), "job submitted");

        if !job.mode().produces_file() {
            let outcome = self.adapter.execute(&job, Operation::MetadataOnly).await;
            return match (outcome.status, outcome.info_record) {
                (OutcomeStatus::Success, Some(info)) => Ok(JobResult::Metadata(info.into_value())),
                _ => Err(engine_error(outcome.error_detail)),
            };
        }

        self.output_dir.ensure_exists()?;
        // purge and hand-off happen under one gate acquisition
        let gate = if self.retention.requires_gate() {
            Some(self.output_dir.lock().await)
        } else {
            None
        };
        self.retention.before_job(&self.output_dir);

        let journal = ArtifactJournal::new();
        let mut cleanup = PartialCleanup::new(journal.clone(), &self.retention);
        let outcome = self
            .adapter
            .execute_journaled(&job, Operation::MetadataAndDownload, &journal)
            .await;

        match outcome.status {
            OutcomeStatus::Success => {}
            OutcomeStatus::Filtered => {
                cleanup.disarm();
                let reason = outcome.error_detail.unwrap_or_default();
                return Ok(JobResult::Filtered { reason });
            }
            OutcomeStatus::Failed => return Err(engine_error(outcome.error_detail)),
        }

        let path = ArtifactResolver::resolve(&outcome, &job)?;
        if !self.output_dir.contains(&path) {
            warn!(path = %path.display(), "resolved artifact is missing or outside the output directory");
            return Err(DownloadError::Resolution(format!(
                "{} does not exist inside {}",
                path.display(),
                self.output_dir.root().display()
            )));
        }
        cleanup.disarm();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        info!(path = %path.display(), "artifact ready");

        Ok(JobResult::Artifact(ServedArtifact {
            content_type: mime_type_for(ext),
            file_name,
            path,
            output_dir: self.output_dir.clone(),
            retention: hand_off,
            _gate: gate,
        }))
    }
}

fn engine_error(detail: Option<String>) -> DownloadError {
    EngineFailure::from(detail.unwrap_or_else(|| "engine failed without a message".to_string())).into()
}
