// Collaborator traits: extraction engine, log sinks, filters, stream selectors

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::errors::{EngineFailure, Result};
use super::models::{CandidateStream, DownloadProgress, InfoRecord, JobDescriptor, PathStage, ReportedPath};

/// Which engine operation to run for a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    /// Resolve metadata without transferring any stream
    Metadata,
    /// Transfer and post-process using a concrete format expression
    Download { format: String },
}

/// Raw engine reply before the adapter normalizes it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineResponse {
    pub info: Option<InfoRecord>,
    pub reported_paths: Vec<ReportedPath>,
}

/// External media-extraction engine (yt-dlp or a test double)
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    /// Name of the engine (for logging)
    fn name(&self) -> &'static str;

    /// Run one call for `job`, emitting events to `events` in engine order
    async fn extract(
        &self,
        job: &JobDescriptor,
        call: EngineCall,
        events: &dyn LogSink,
    ) -> std::result::Result<EngineResponse, EngineFailure>;
}

/// Structured events emitted while a job runs
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Debug(String),
    Info(String),
    Warning(String),
    Error(String),
    Progress(DownloadProgress),
    /// The engine wrote (or is about to write) a file
    Artifact(ReportedPath),
    /// A stream transfer completed; post-processing follows
    Finished { path: Option<PathBuf> },
}

impl LogEvent {
    /// Classify a raw engine output line by its prefix
    pub fn from_line(line: &str) -> Self {
        if line.starts_with("[debug] ") {
            Self::Debug(line.to_string())
        } else if let Some(rest) = line.strip_prefix("WARNING:") {
            Self::Warning(rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix("ERROR:") {
            Self::Error(rest.trim().to_string())
        } else {
            Self::Info(line.to_string())
        }
    }
}

/// Receiver of job progress and diagnostics. Called synchronously, in order.
pub trait LogSink: Send + Sync {
    fn on_event(&self, event: &LogEvent);

    /// Stable description; descriptors compare sinks by it
    fn describe(&self) -> String;
}

impl<'a> PartialEq for dyn LogSink + 'a {
    fn eq(&self, other: &Self) -> bool {
        self.describe() == other.describe()
    }
}

impl<'a> fmt::Debug for dyn LogSink + 'a {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogSink({})", self.describe())
    }
}

/// Decides whether a resource should be downloaded at all. Must be pure.
pub trait FilterPredicate: Send + Sync {
    /// `None` to proceed, or a human-readable rejection reason
    fn evaluate(&self, attributes: &InfoRecord, incomplete: bool) -> Option<String>;

    fn describe(&self) -> String;

    /// Equivalent engine-side match filters, any one of which admits an entry.
    /// Needed when the engine expands a playlist the adapter never sees.
    fn engine_match_filters(&self) -> Vec<String> {
        Vec::new()
    }
}

impl<'a> PartialEq for dyn FilterPredicate + 'a {
    fn eq(&self, other: &Self) -> bool {
        self.describe() == other.describe()
    }
}

impl<'a> fmt::Debug for dyn FilterPredicate + 'a {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterPredicate({})", self.describe())
    }
}

/// Picks concrete streams from the engine's candidate list
pub trait StreamSelector: Send + Sync {
    fn select(&self, candidates: &[CandidateStream]) -> Result<StreamSelection>;

    fn describe(&self) -> String;
}

impl<'a> PartialEq for dyn StreamSelector + 'a {
    fn eq(&self, other: &Self) -> bool {
        self.describe() == other.describe()
    }
}

impl<'a> fmt::Debug for dyn StreamSelector + 'a {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamSelector({})", self.describe())
    }
}

/// Streams chosen by a programmatic selector
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSelection {
    /// Combined identifier handed to the engine (`"137+140"`)
    pub format_id: String,
    pub streams: Vec<CandidateStream>,
}

/// Sink used when a job has none; drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn on_event(&self, _event: &LogEvent) {}

    fn describe(&self) -> String {
        "null".to_string()
    }
}

/// Routes engine output to `tracing`, hiding `[debug] ` lines unless enabled
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink {
    debug: bool,
}

impl TracingLogSink {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }
}

impl LogSink for TracingLogSink {
    fn on_event(&self, event: &LogEvent) {
        match event {
            LogEvent::Debug(msg) => {
                if self.debug {
                    debug!(target: "engine", "{}", msg);
                }
            }
            LogEvent::Info(msg) => info!(target: "engine", "{}", msg),
            LogEvent::Warning(msg) => warn!(target: "engine", "{}", msg),
            LogEvent::Error(msg) => error!(target: "engine", "{}", msg),
            LogEvent::Progress(progress) => {
                debug!(target: "engine", percent = progress.percent, "{}", progress.status)
            }
            LogEvent::Artifact(reported) => {
                info!(target: "engine", stage = ?reported.stage, "{}", reported.path.display())
            }
            LogEvent::Finished { .. } => {
                info!(target: "engine", "Done downloading, now post-processing ...")
            }
        }
    }

    fn describe(&self) -> String {
        format!("tracing(debug={})", self.debug)
    }
}

/// Fans one event out to the job's sink and any extra observers
pub(crate) struct FanoutSink<'a> {
    pub(crate) sinks: Vec<&'a dyn LogSink>,
}

impl LogSink for FanoutSink<'_> {
    fn on_event(&self, event: &LogEvent) {
        for sink in &self.sinks {
            sink.on_event(event);
        }
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.sinks.iter().map(|s| s.describe()).collect();
        format!("fanout({})", parts.join(","))
    }
}

/// Destination helper for events carrying a reported path
pub(crate) fn artifact_event(path: impl Into<PathBuf>, stage: PathStage) -> LogEvent {
    LogEvent::Artifact(ReportedPath {
        path: path.into(),
        stage,
    })
}
