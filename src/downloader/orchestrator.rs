// Execution adapter: drives the extraction engine for one job

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::format_selector::FormatSelector;
use super::models::{ExtractionOutcome, JobDescriptor};
use super::traits::{EngineCall, ExtractionEngine, FanoutSink, LogEvent, LogSink, NullSink};

/// How far a job should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    MetadataOnly,
    MetadataAndDownload,
}

/// Paths the engine created while a job ran, in report order.
///
/// A path that already exists when first reported (`has already been
/// downloaded`) belongs to an earlier job and is never recorded. Clones share
/// the same record, so a cleanup guard can hold one while the adapter writes
/// through another.
#[derive(Debug, Clone, Default)]
pub struct ArtifactJournal {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl ArtifactJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: PathBuf) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        if paths.contains(&path) {
            return;
        }
        if path.exists() {
            debug!(path = %path.display(), "not journaling pre-existing file");
            return;
        }
        paths.push(path);
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl LogSink for ArtifactJournal {
    fn on_event(&self, event: &LogEvent) {
        if let LogEvent::Artifact(reported) = event {
            self.record(reported.path.clone());
        }
    }

    fn describe(&self) -> String {
        "journal".to_string()
    }
}

pub struct ExecutionAdapter {
    engine: Arc<dyn ExtractionEngine>,
}

impl ExecutionAdapter {
    pub fn new(engine: Arc<dyn ExtractionEngine>) -> Self {
        Self { engine }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Run `job` up to `operation`. Failures are reported in the outcome, never retried.
    pub async fn execute(&self, job: &JobDescriptor, operation: Operation) -> ExtractionOutcome {
        self.run(job, operation, None).await
    }

    /// Like [`execute`](Self::execute), also recording every reported path in `journal`
    pub async fn execute_journaled(
        &self,
        job: &JobDescriptor,
        operation: Operation,
        journal: &ArtifactJournal,
    ) -> ExtractionOutcome {
        self.run(job, operation, Some(journal)).await
    }

    async fn run(
        &self,
        job: &JobDescriptor,
        operation: Operation,
        journal: Option<&ArtifactJournal>,
    ) -> ExtractionOutcome {
        let null = NullSink;
        let mut sinks: Vec<&dyn LogSink> = vec![job.log_sink().map(|s| s.as_ref()).unwrap_or(&null)];
        if let Some(journal) = journal {
            sinks.push(journal);
        }
        let sink = FanoutSink { sinks };

        debug!(engine = self.engine.name(), url = job.source_url(), "resolving metadata");
        let info = match self.engine.extract(job, EngineCall::Metadata, &sink).await {
            Ok(response) => match response.info {
                Some(info) => info,
                None => return ExtractionOutcome::failed("engine returned no metadata", None),
            },
            Err(e) => {
                warn!(engine = self.engine.name(), kind = %e.kind, "metadata failed: {}", e.message);
                return ExtractionOutcome::failed(e.message, None);
            }
        };

        if operation == Operation::MetadataOnly {
            return ExtractionOutcome::success(info, Vec::new());
        }

        let item = info.primary_item();
        if let Some(filter) = job.filter() {
            if let Some(reason) = filter.evaluate(&item, item.is_incomplete()) {
                info!(url = job.source_url(), "skipping: {}", reason);
                sink.on_event(&LogEvent::Info(reason.clone()));
                return ExtractionOutcome::filtered(reason, info);
            }
        }

        let resolved = match FormatSelector::resolve(job.format_rule(), &item.formats()) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(url = job.source_url(), "{}", e);
                return ExtractionOutcome::failed(e.to_string(), Some(info));
            }
        };

        info!(
            engine = self.engine.name(),
            format = %resolved.expression,
            steps = job.post_processors().len(),
            "downloading"
        );
        let call = EngineCall::Download {
            format: resolved.expression,
        };
        match self.engine.extract(job, call, &sink).await {
            Ok(response) => {
                let info = response.info.unwrap_or(info);
                ExtractionOutcome::success(info, response.reported_paths)
            }
            Err(e) => {
                warn!(engine = self.engine.name(), kind = %e.kind, "download failed: {}", e.message);
                ExtractionOutcome::failed(e.message, Some(info))
            }
        }
    }
}
