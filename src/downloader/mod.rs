// Downloader module - job configuration and execution pipeline

pub mod errors;
pub mod filter;
pub mod format_selector;
pub mod job;
pub mod models;
pub mod orchestrator;
pub mod postprocess;
pub mod resolver;
pub mod retention;
pub mod traits;
pub mod utils;

pub use errors::{DownloadError, EngineFailure, RetentionWarning};
pub use job::{JobBuilder, JobMode, JobOptions};
pub use models::{ExtractionOutcome, JobDescriptor, OutcomeStatus, RetentionPolicy};
pub use orchestrator::{ArtifactJournal, ExecutionAdapter, Operation};
pub use traits::{ExtractionEngine, LogEvent, LogSink};
