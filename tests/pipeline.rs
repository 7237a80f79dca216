use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::header;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use media_downloader_lib::downloader::errors::EngineFailure;
use media_downloader_lib::downloader::job::JobOptions;
use media_downloader_lib::downloader::models::{InfoRecord, JobDescriptor, PathStage, ReportedPath, RetentionPolicy};
use media_downloader_lib::downloader::resolver::expand_template;
use media_downloader_lib::downloader::traits::{EngineCall, EngineResponse, ExtractionEngine, LogEvent, LogSink};
use media_downloader_lib::http::serve_artifact;
use media_downloader_lib::{DownloadError, DownloadService, JobResult, ServiceConfig};

const URL: &str = "https://www.youtube.com/watch?v=jNQXAC9IVRw";

/// Container the fake engine actually downloads, unlike the metadata's `webm`
const STREAM_EXT: &str = "mp4";

#[derive(Debug, Clone)]
enum Script {
    Succeed,
    /// Writes a `.part` file, then fails
    Fail(String),
    /// Reports the stream as already downloaded, then fails
    AlreadyThenFail(String),
    /// Writes a `.part` file and never returns
    Hang,
}

/// Writes files the way yt-dlp would, but reports only the pre-conversion stream
struct FakeEngine {
    info: Value,
    script: Script,
    downloads: AtomicUsize,
}

impl FakeEngine {
    fn new(info: Value) -> Arc<Self> {
        Self::scripted(info, Script::Succeed)
    }

    fn scripted(info: Value, script: Script) -> Arc<Self> {
        Arc::new(Self {
            info,
            script,
            downloads: AtomicUsize::new(0),
        })
    }

    fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

fn part_of(path: &Path) -> PathBuf {
    let mut part = path.to_path_buf().into_os_string();
    part.push(".part");
    PathBuf::from(part)
}

#[async_trait]
impl ExtractionEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn extract(
        &self,
        job: &JobDescriptor,
        call: EngineCall,
        events: &dyn LogSink,
    ) -> Result<EngineResponse, EngineFailure> {
        let info = InfoRecord::from_value(self.info.clone()).expect("object");
        if call == EngineCall::Metadata {
            return Ok(EngineResponse {
                info: Some(info),
                reported_paths: Vec::new(),
            });
        }

        self.downloads.fetch_add(1, Ordering::SeqCst);
        let stream = PathBuf::from(expand_template(job.output_template(), &info)).with_extension(STREAM_EXT);
        let reported = ReportedPath {
            path: stream.clone(),
            stage: PathStage::Stream,
        };
        events.on_event(&LogEvent::Artifact(reported.clone()));

        match &self.script {
            Script::Succeed => {}
            Script::Fail(message) => {
                fs::write(part_of(&stream), b"half").expect("write part");
                return Err(EngineFailure::from(message.as_str()));
            }
            Script::AlreadyThenFail(message) => return Err(EngineFailure::from(message.as_str())),
            Script::Hang => {
                fs::write(part_of(&stream), b"half").expect("write part");
                std::future::pending::<()>().await;
            }
        }

        let written = match job.extract_audio_codec() {
            Some(codec) => stream.with_extension(codec.extension()),
            None => stream,
        };
        fs::write(&written, b"media").expect("write artifact");

        Ok(EngineResponse {
            info: None,
            reported_paths: vec![reported],
        })
    }
}

fn info() -> Value {
    json!({
        "id": "jNQXAC9IVRw",
        "title": "Me at the zoo",
        "ext": "webm",
        "duration": 19,
        "formats": [
            {"format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none"},
            {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2"}
        ]
    })
}

fn config(root: &Path, retention: RetentionPolicy) -> ServiceConfig {
    ServiceConfig {
        output_dir: root.join("downloads"),
        retention,
        ..ServiceConfig::default()
    }
}

fn options(pairs: &[(&str, &str)]) -> JobOptions {
    JobOptions::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
}

fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn audio_job_with_purge_serves_mp3_and_leaves_only_manifest() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), RetentionPolicy::PurgeDirectoryBeforeNextJob);
    fs::create_dir_all(&config.output_dir).unwrap();
    fs::write(config.output_dir.join("README.md"), b"kept").unwrap();
    fs::write(config.output_dir.join("previous.mp4"), b"old").unwrap();
    fs::create_dir(config.output_dir.join("thumbs")).unwrap();

    let service = DownloadService::new(&config, FakeEngine::new(info()));
    let result = service
        .submit_job(URL, "audio", &options(&[("codec", "mp3")]))
        .await
        .unwrap();

    let JobResult::Artifact(artifact) = result else {
        panic!("expected an artifact");
    };
    assert!(artifact.path().to_string_lossy().ends_with(".mp3"));
    assert_eq!(artifact.file_name(), "Me at the zoo.mp3");
    assert_eq!(artifact.content_type(), "audio/mpeg");

    assert!(artifact.finish().is_empty());
    assert_eq!(names(&config.output_dir), vec!["Me at the zoo.mp3", "README.md"]);
}

#[tokio::test]
async fn info_mode_returns_metadata_without_download() {
    let tmp = TempDir::new().unwrap();
    let engine = FakeEngine::new(info());
    let service = DownloadService::new(&config(tmp.path(), RetentionPolicy::Keep), engine.clone());

    match service.submit_job(URL, "info", &JobOptions::new()).await.unwrap() {
        JobResult::Metadata(value) => assert_eq!(value["title"], "Me at the zoo"),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(engine.downloads(), 0);
}

#[tokio::test]
async fn short_video_is_filtered_not_failed() {
    let tmp = TempDir::new().unwrap();
    let engine = FakeEngine::new(info());
    let service = DownloadService::new(&config(tmp.path(), RetentionPolicy::Keep), engine.clone());

    match service.submit_job(URL, "filter", &options(&[("min_duration", "60")])).await.unwrap() {
        JobResult::Filtered { reason } => assert_eq!(reason, "Video shorter than 60s"),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(engine.downloads(), 0);
}

#[tokio::test]
async fn engine_failure_is_verbatim_and_partial_files_are_removed() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), RetentionPolicy::Keep);
    let message = "ERROR: [youtube] jNQXAC9IVRw: Unable to download video data: HTTP Error 403: Forbidden";
    let service = DownloadService::new(&config, FakeEngine::scripted(info(), Script::Fail(message.to_string())));

    let err = service.submit_job(URL, "best_video", &JobOptions::new()).await.unwrap_err();

    assert!(matches!(err, DownloadError::Engine(_)));
    assert!(!err.is_client_error());
    assert_eq!(err.to_string(), message);
    assert!(names(&config.output_dir).is_empty());
}

#[tokio::test]
async fn delete_after_flag_removes_served_file() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), RetentionPolicy::Keep);
    let service = DownloadService::new(&config, FakeEngine::new(info()));

    let form = JobOptions::from_pairs(vec![
        ("format".to_string(), "mp3".to_string()),
        ("options".to_string(), "delete_after".to_string()),
    ]);
    let JobResult::Artifact(artifact) = service.submit_job(URL, "download", &form).await.unwrap() else {
        panic!("expected an artifact");
    };
    let path = artifact.path().to_path_buf();
    assert!(path.exists());

    artifact.finish();
    assert!(!path.exists());
}

#[tokio::test]
async fn bad_requests_are_client_errors() {
    let tmp = TempDir::new().unwrap();
    let engine = FakeEngine::new(info());
    let service = DownloadService::new(&config(tmp.path(), RetentionPolicy::Keep), engine.clone());

    let missing = service.submit_job("", "audio", &JobOptions::new()).await.unwrap_err();
    assert!(matches!(missing, DownloadError::MissingUrl));

    let mode = service.submit_job(URL, "torrent", &JobOptions::new()).await.unwrap_err();
    assert!(mode.is_client_error());

    let option = service
        .submit_job(URL, "filter", &options(&[("min_duration", "soon")]))
        .await
        .unwrap_err();
    assert!(option.is_client_error());

    assert_eq!(engine.downloads(), 0);
}

#[tokio::test]
async fn purge_waits_for_previous_artifact_hand_off() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), RetentionPolicy::PurgeDirectoryBeforeNextJob);
    let service = Arc::new(DownloadService::new(&config, FakeEngine::new(info())));

    let JobResult::Artifact(first) = service.submit_job(URL, "best_video", &JobOptions::new()).await.unwrap() else {
        panic!("expected an artifact");
    };
    let first_path = first.path().to_path_buf();

    let second = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .submit_job(URL, "audio", &options(&[("codec", "mp3")]))
                .await
        })
    };

    // the second job cannot purge while the first artifact is being served
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.is_finished());
    assert!(first_path.exists());

    first.finish();
    let JobResult::Artifact(second) = second.await.unwrap().unwrap() else {
        panic!("expected an artifact");
    };
    assert!(!first_path.exists());
    assert!(second.path().exists());
}

#[tokio::test]
async fn downloaded_container_wins_over_metadata_extension() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), RetentionPolicy::Keep);
    let service = DownloadService::new(&config, FakeEngine::new(info()));

    let JobResult::Artifact(artifact) = service
        .submit_job(URL, "download", &options(&[("format", "best")]))
        .await
        .unwrap()
    else {
        panic!("expected an artifact");
    };

    assert_eq!(artifact.file_name(), "Me at the zoo.mp4");
    assert_eq!(artifact.content_type(), "video/mp4");
    assert!(artifact.path().exists());
}

#[tokio::test]
async fn delete_after_still_purges_under_purge_policy() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), RetentionPolicy::PurgeDirectoryBeforeNextJob);
    fs::create_dir_all(&config.output_dir).unwrap();
    fs::write(config.output_dir.join("stale.mp4"), b"old").unwrap();
    let service = DownloadService::new(&config, FakeEngine::new(info()));

    let JobResult::Artifact(artifact) = service
        .submit_job(URL, "best_video", &options(&[("delete_after", "true")]))
        .await
        .unwrap()
    else {
        panic!("expected an artifact");
    };
    assert_eq!(names(&config.output_dir), vec!["Me at the zoo.mp4"]);

    artifact.finish();
    assert!(names(&config.output_dir).is_empty());
}

#[tokio::test]
async fn failed_rerun_keeps_previously_downloaded_file() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), RetentionPolicy::Keep);
    fs::create_dir_all(&config.output_dir).unwrap();
    fs::write(config.output_dir.join("Me at the zoo.mp4"), b"kept").unwrap();

    let message = "ERROR: Postprocessing: Conversion failed!";
    let engine = FakeEngine::scripted(info(), Script::AlreadyThenFail(message.to_string()));
    let service = DownloadService::new(&config, engine);

    let err = service.submit_job(URL, "best_video", &JobOptions::new()).await.unwrap_err();
    assert_eq!(err.to_string(), message);
    assert_eq!(fs::read(config.output_dir.join("Me at the zoo.mp4")).unwrap(), b"kept");
}

#[tokio::test]
async fn cancelled_job_removes_partial_files() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), RetentionPolicy::PurgeDirectoryBeforeNextJob);
    let service = DownloadService::new(&config, FakeEngine::scripted(info(), Script::Hang));

    let options = JobOptions::new();
    let job = service.submit_job(URL, "best_video", &options);
    let timed_out = tokio::time::timeout(Duration::from_millis(200), job).await;

    assert!(timed_out.is_err());
    assert!(names(&config.output_dir).is_empty());
    // the gate was released with the dropped job
    let _gate = tokio::time::timeout(Duration::from_secs(1), service.output_dir().lock())
        .await
        .unwrap();
}

#[tokio::test]
async fn served_body_streams_then_deletes() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), RetentionPolicy::DeleteAfterServe);
    let service = DownloadService::new(&config, FakeEngine::new(info()));

    let JobResult::Artifact(artifact) = service.submit_job(URL, "best_video", &JobOptions::new()).await.unwrap() else {
        panic!("expected an artifact");
    };
    let path = artifact.path().to_path_buf();

    let response = serve_artifact(artifact).await;
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    assert!(response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .starts_with("attachment; filename=\"Me at the zoo.mp4\""));
    assert!(path.exists());

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"media");
    assert!(!path.exists());
}

