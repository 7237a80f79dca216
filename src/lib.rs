pub mod cli;
pub mod config;
pub mod downloader;
pub mod http;
pub mod service;
pub mod ytdlp;

pub use config::ServiceConfig;
pub use downloader::DownloadError;
pub use service::{DownloadService, JobResult, ServedArtifact};
