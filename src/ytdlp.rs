// yt-dlp command-line engine

use std::path::PathBuf;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Command as StdCommand;
use tracing::{debug, info, warn};

use crate::downloader::errors::EngineFailure;
use crate::downloader::models::{
    DownloadProgress, InfoRecord, JobDescriptor, PathStage, PostProcessingStep, ReportedPath, StepKind,
};
use crate::downloader::traits::{artifact_event, EngineCall, EngineResponse, ExtractionEngine, LogEvent, LogSink};
use crate::downloader::utils::{run_streaming_with_timeout, Stream};

lazy_static! {
    // [download]   6.2% of ~ 343.72MiB at  420.30KiB/s ETA 12:32 (frag 29/454)
    static ref PROGRESS_RE: Regex = Regex::new(
        r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\d+\.?\d*\s*\w+)(?:\s+in\s+\S+)?(?:\s+at\s+(\d+\.?\d*\s*\w+/s))?(?:\s+ETA\s+(\S+))?(?:\s+\(frag\s+(\d+)/(\d+)\))?"
    ).unwrap();
    static ref DEST_RE: Regex = Regex::new(r"^\[download\]\s+Destination:\s+(.+)$").unwrap();
    static ref ALREADY_RE: Regex = Regex::new(r"^\[download\]\s+(.+?)\s+has already been downloaded").unwrap();
    static ref MERGE_RE: Regex = Regex::new(r#"^\[Merger\]\s+Merging formats into "(.+)"$"#).unwrap();
    static ref PP_DEST_RE: Regex =
        Regex::new(r"^\[(?:ExtractAudio|VideoConvertor|VideoRemuxer)\]\s+(?:.*?;\s+)?Destination:\s+(.+)$").unwrap();
    static ref NOT_CONVERTING_RE: Regex =
        Regex::new(r"^\[ExtractAudio\]\s+Not converting audio\s+(.+?);\s+file is already in target format").unwrap();
}

/// Settings for the yt-dlp process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Explicit binary path; discovered on the system when unset
    pub binary: Option<String>,
    /// Wall-clock limit for one engine invocation
    pub timeout_seconds: u64,
    pub socket_timeout: u64,
    pub retries: u32,
    pub proxy: Option<String>,
    pub cookies_path: Option<PathBuf>,
    /// Appended verbatim before the URL
    pub extra_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: None,
            timeout_seconds: 3600,
            socket_timeout: 30,
            retries: 5,
            proxy: None,
            cookies_path: None,
            extra_args: Vec::new(),
        }
    }
}

/// Find yt-dlp executable in common paths
pub fn find_ytdlp() -> String {
    let common_paths = [
        "/opt/homebrew/bin/yt-dlp", // Homebrew on Apple Silicon
        "/usr/local/bin/yt-dlp",
        "/usr/bin/yt-dlp",
    ];

    for path in common_paths {
        if std::path::Path::new(path).exists() {
            return path.to_string();
        }
    }

    if let Ok(output) = StdCommand::new("which").arg("yt-dlp").output() {
        if output.status.success() {
            if let Ok(path) = String::from_utf8(output.stdout) {
                let trimmed = path.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
    }

    // hope it's in PATH
    "yt-dlp".to_string()
}

/// Parse a yt-dlp progress line into a percentage and a short status
pub fn parse_progress(line: &str) -> Option<DownloadProgress> {
    let caps = PROGRESS_RE.captures(line)?;
    let percent: f32 = caps.get(1)?.as_str().parse().ok()?;
    let size = caps.get(2).map(|m| m.as_str()).unwrap_or("?");
    let speed = caps.get(3).map(|m| m.as_str());
    let eta = caps.get(4).map(|m| m.as_str());
    let frag = caps.get(5).zip(caps.get(6)).map(|(c, t)| (c.as_str(), t.as_str()));

    let mut status = format!("{:.1}% of {}", percent, size);
    if let Some(speed) = speed {
        status.push_str(&format!(" @ {}", speed));
    }
    if let Some(eta) = eta {
        status.push_str(&format!(" ETA {}", eta));
    }
    if let Some((current, total)) = frag {
        status.push_str(&format!(" (frag {}/{})", current, total));
    }

    Some(DownloadProgress { percent, status })
}

/// Path announced by a yt-dlp output line, tagged with the stage that wrote it
pub fn parse_reported_path(line: &str) -> Option<ReportedPath> {
    let line = line.trim_end();
    let (caps, stage) = if let Some(caps) = MERGE_RE.captures(line) {
        (caps, PathStage::Merged)
    } else if let Some(caps) = PP_DEST_RE.captures(line) {
        (caps, PathStage::PostProcessed)
    } else if let Some(caps) = NOT_CONVERTING_RE.captures(line) {
        (caps, PathStage::PostProcessed)
    } else if let Some(caps) = DEST_RE.captures(line) {
        (caps, PathStage::Stream)
    } else if let Some(caps) = ALREADY_RE.captures(line) {
        (caps, PathStage::Stream)
    } else {
        return None;
    };

    let path = caps.get(1)?.as_str().trim();
    if path.is_empty() {
        return None;
    }
    Some(ReportedPath {
        path: PathBuf::from(path),
        stage,
    })
}

/// Turns raw output lines into log events, remembering what the engine wrote
#[derive(Debug, Default)]
struct LineParser {
    current_stream: Option<PathBuf>,
    reported: Vec<ReportedPath>,
    last_error: Option<String>,
}

impl LineParser {
    fn feed(&mut self, line: &str) -> Vec<LogEvent> {
        if let Some(progress) = parse_progress(line) {
            let done = progress.percent >= 100.0;
            let mut events = vec![LogEvent::Progress(progress)];
            if done {
                events.push(LogEvent::Finished {
                    path: self.current_stream.clone(),
                });
            }
            return events;
        }

        if let Some(reported) = parse_reported_path(line) {
            let mut events = vec![artifact_event(reported.path.clone(), reported.stage)];
            if reported.stage == PathStage::Stream {
                self.current_stream = Some(reported.path.clone());
                if ALREADY_RE.is_match(line) {
                    events.push(LogEvent::Finished {
                        path: Some(reported.path.clone()),
                    });
                }
            }
            self.reported.push(reported);
            return events;
        }

        let event = LogEvent::from_line(line);
        if line.starts_with("ERROR:") {
            self.last_error = Some(line.trim().to_string());
        }
        vec![event]
    }
}

/// Extraction engine backed by the `yt-dlp` binary
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    program: String,
    config: EngineConfig,
}

impl YtDlpEngine {
    /// `YTDLP_PATH` wins over the configured binary, which wins over discovery
    pub fn new(config: EngineConfig) -> Self {
        let program = std::env::var("YTDLP_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| config.binary.clone())
            .unwrap_or_else(find_ytdlp);
        Self::with_program(program, config)
    }

    pub fn with_program(program: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    fn common_args(&self, job: &JobDescriptor) -> Vec<String> {
        let mut args = vec![
            "--no-update".to_string(),
            "--socket-timeout".to_string(),
            self.config.socket_timeout.to_string(),
            "--retries".to_string(),
            self.config.retries.to_string(),
        ];

        if job.single_item_only() {
            args.push("--no-playlist".to_string());
            args.push("--playlist-items".to_string());
            args.push("1".to_string());
        }
        if let Some(proxy) = &self.config.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(cookies) = &self.config.cookies_path {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args
    }

    fn finish_args(&self, mut args: Vec<String>, job: &JobDescriptor) -> Vec<String> {
        args.extend(self.config.extra_args.iter().cloned());
        args.push("--".to_string());
        args.push(job.source_url().to_string());
        args
    }

    /// Arguments for a metadata-only call
    pub fn metadata_args(&self, job: &JobDescriptor) -> Vec<String> {
        let mut args = vec!["--dump-single-json".to_string()];
        args.extend(self.common_args(job));
        self.finish_args(args, job)
    }

    /// Arguments for transfer plus post-processing with a concrete format
    pub fn download_args(&self, job: &JobDescriptor, format: &str) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            format.to_string(),
            "-o".to_string(),
            job.output_template().to_string(),
            "--newline".to_string(),
        ];
        args.extend(self.common_args(job));

        if job.write_subtitles() {
            args.push("--write-subs".to_string());
            args.push("--sub-langs".to_string());
            let langs: Vec<&str> = job.subtitle_languages().iter().map(String::as_str).collect();
            args.push(langs.join(","));
        }
        if job.write_thumbnail() {
            args.push("--write-thumbnail".to_string());
        }
        // the adapter only vets the first entry; the engine vets the rest
        if !job.single_item_only() {
            if let Some(filter) = job.filter() {
                for expr in filter.engine_match_filters() {
                    args.push("--match-filter".to_string());
                    args.push(expr);
                }
            }
        }
        for step in job.post_processors() {
            args.extend(postprocessor_args(step));
        }

        self.finish_args(args, job)
    }

    async fn run(
        &self,
        args: Vec<String>,
        events: &dyn LogSink,
        capture_stdout: bool,
    ) -> Result<(String, Vec<ReportedPath>), EngineFailure> {
        let mut parser = LineParser::default();
        let mut stdout = String::new();

        let status = run_streaming_with_timeout(&self.program, &args, self.config.timeout_seconds, |stream, line| {
            if capture_stdout && stream == Stream::Stdout {
                stdout.push_str(&line);
                stdout.push('\n');
                return;
            }
            for event in parser.feed(&line) {
                events.on_event(&event);
            }
        })
        .await?;

        if !status.success() {
            let message = parser.last_error.unwrap_or_else(|| match status.code() {
                Some(code) => format!("yt-dlp exited with status {}", code),
                None => "yt-dlp was terminated by a signal".to_string(),
            });
            warn!(program = %self.program, "{}", message);
            return Err(EngineFailure::from(message));
        }

        Ok((stdout, parser.reported))
    }
}

/// Command-line flags for one post-processing step
fn postprocessor_args(step: &PostProcessingStep) -> Vec<String> {
    match step.kind {
        StepKind::ExtractAudio => {
            let mut args = vec!["--extract-audio".to_string()];
            if let Some(codec) = step.audio_codec() {
                args.push("--audio-format".to_string());
                args.push(codec.as_str().to_string());
            }
            args
        }
        StepKind::EmbedThumbnail => vec!["--embed-thumbnail".to_string()],
        StepKind::AddMetadata => vec!["--embed-metadata".to_string()],
        StepKind::Custom => {
            let name = step.params.get("name").cloned().unwrap_or_default();
            let mut spec = format!("{}:when={}", name, step.attach_point.as_engine_str());
            for (key, value) in step.params.iter().filter(|(k, _)| k.as_str() != "name") {
                spec.push_str(&format!(";{}={}", key, value));
            }
            vec!["--use-postprocessor".to_string(), spec]
        }
    }
}

#[async_trait]
impl ExtractionEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn extract(
        &self,
        job: &JobDescriptor,
        call: EngineCall,
        events: &dyn LogSink,
    ) -> Result<EngineResponse, EngineFailure> {
        match call {
            EngineCall::Metadata => {
                debug!(url = job.source_url(), "resolving metadata");
                let (stdout, _) = self.run(self.metadata_args(job), events, true).await?;
                let value: serde_json::Value = serde_json::from_str(stdout.trim())
                    .map_err(|e| EngineFailure::parse(format!("Failed to parse yt-dlp JSON: {}", e)))?;
                let info = InfoRecord::from_value(value)
                    .ok_or_else(|| EngineFailure::parse("yt-dlp metadata is not a JSON object"))?;
                Ok(EngineResponse {
                    info: Some(info),
                    reported_paths: Vec::new(),
                })
            }
            EngineCall::Download { format } => {
                info!(url = job.source_url(), format = %format, "starting download");
                let (_, reported_paths) = self.run(self.download_args(job, &format), events, false).await?;
                Ok(EngineResponse {
                    info: None,
                    reported_paths,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::job::{JobBuilder, JobOptions};

    fn job(mode: &str, pairs: &[(&str, &str)]) -> JobDescriptor {
        let options = JobOptions::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        JobBuilder::new("/srv/downloads")
            .build("https://www.youtube.com/watch?v=abc", mode, &options)
            .unwrap()
    }

    fn engine() -> YtDlpEngine {
        YtDlpEngine::with_program("yt-dlp", EngineConfig::default())
    }

    fn position(args: &[String], flag: &str) -> Option<usize> {
        args.iter().position(|a| a == flag)
    }

    #[test]
    fn parses_progress_lines() {
        let progress =
            parse_progress("[download]   6.2% of ~ 343.72MiB at  420.30KiB/s ETA 12:32 (frag 29/454)").unwrap();
        assert!((progress.percent - 6.2).abs() < f32::EPSILON);
        assert_eq!(progress.status, "6.2% of 343.72MiB @ 420.30KiB/s ETA 12:32 (frag 29/454)");

        let done = parse_progress("[download] 100% of    3.40MiB in 00:00:01 at 2.61MiB/s").unwrap();
        assert_eq!(done.percent, 100.0);

        assert!(parse_progress("[youtube] abc: Downloading webpage").is_none());
    }

    #[test]
    fn parses_reported_paths() {
        let cases = [
            ("[download] Destination: /d/Clip.f137.mp4", "/d/Clip.f137.mp4", PathStage::Stream),
            ("[download] /d/Clip.mp4 has already been downloaded", "/d/Clip.mp4", PathStage::Stream),
            (r#"[Merger] Merging formats into "/d/Clip.mp4""#, "/d/Clip.mp4", PathStage::Merged),
            ("[ExtractAudio] Destination: /d/Clip.mp3", "/d/Clip.mp3", PathStage::PostProcessed),
            (
                "[VideoRemuxer] Remuxing video from webm to mp4; Destination: /d/Clip.mp4",
                "/d/Clip.mp4",
                PathStage::PostProcessed,
            ),
            (
                "[ExtractAudio] Not converting audio /d/Clip.mp3; file is already in target format mp3",
                "/d/Clip.mp3",
                PathStage::PostProcessed,
            ),
        ];

        for (line, path, stage) in cases {
            let reported = parse_reported_path(line).unwrap_or_else(|| panic!("no path in {line}"));
            assert_eq!(reported.path, PathBuf::from(path), "{line}");
            assert_eq!(reported.stage, stage, "{line}");
        }
        assert!(parse_reported_path("[info] Downloading 1 format(s): 251").is_none());
    }

    #[test]
    fn line_parser_emits_finished_after_full_progress() {
        let mut parser = LineParser::default();
        parser.feed("[download] Destination: /d/Clip.webm");
        let events = parser.feed("[download] 100.0% of 3.00MiB at 1.00MiB/s ETA 00:00");

        assert!(matches!(events[0], LogEvent::Progress(_)));
        assert_eq!(
            events[1],
            LogEvent::Finished {
                path: Some(PathBuf::from("/d/Clip.webm"))
            }
        );

        parser.feed("ERROR: [youtube] abc: Video unavailable");
        assert_eq!(parser.last_error.as_deref(), Some("ERROR: [youtube] abc: Video unavailable"));
        assert_eq!(parser.reported.len(), 1);
    }

    #[test]
    fn audio_job_download_args() {
        let job = job("audio", &[("codec", "mp3"), ("embed_thumbnail", "true")]);
        let args = engine().download_args(&job, "bestaudio/best");

        let f = position(&args, "-f").unwrap();
        assert_eq!(args[f + 1], "bestaudio/best");
        let o = position(&args, "-o").unwrap();
        assert_eq!(args[o + 1], "/srv/downloads/%(title)s.%(ext)s");
        let codec = position(&args, "--audio-format").unwrap();
        assert_eq!(args[codec + 1], "mp3");
        assert!(position(&args, "--extract-audio").unwrap() < position(&args, "--embed-thumbnail").unwrap());
        assert!(args.contains(&"--no-playlist".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://www.youtube.com/watch?v=abc"));
        assert_eq!(args[args.len() - 2], "--");
    }

    #[test]
    fn custom_step_args() {
        let job = job(
            "postprocessor",
            &[("postprocessors", "custom:SponsorBlock;categories=sponsor")],
        );
        let args = engine().download_args(&job, "best");
        let pp = position(&args, "--use-postprocessor").unwrap();
        assert_eq!(args[pp + 1], "SponsorBlock:when=pre_process;categories=sponsor");
    }

    #[test]
    fn subtitle_and_proxy_args() {
        let job = job("download", &[("write_subs", "true"), ("sub_langs", "en,de"), ("playlist", "true")]);
        let config = EngineConfig {
            proxy: Some("socks5h://127.0.0.1:1080".into()),
            ..EngineConfig::default()
        };
        let args = YtDlpEngine::with_program("yt-dlp", config).download_args(&job, "best");

        let langs = position(&args, "--sub-langs").unwrap();
        assert_eq!(args[langs + 1], "de,en");
        let proxy = position(&args, "--proxy").unwrap();
        assert_eq!(args[proxy + 1], "socks5h://127.0.0.1:1080");
        assert!(!args.contains(&"--no-playlist".to_string()));
    }

    #[test]
    fn playlist_filter_reaches_every_entry() {
        let playlist = job("filter", &[("min_duration", "120"), ("playlist", "true")]);
        let args = engine().download_args(&playlist, "best");
        let filters: Vec<&str> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| a.as_str() == "--match-filter")
            .map(|(i, _)| args[i + 1].as_str())
            .collect();
        assert_eq!(filters, vec!["!duration", "duration >= 120"]);

        let single = job("filter", &[("min_duration", "120")]);
        assert!(position(&engine().download_args(&single, "best"), "--match-filter").is_none());
    }

    #[test]
    fn metadata_args_dump_json_only() {
        let args = engine().metadata_args(&job("info", &[]));
        assert_eq!(args[0], "--dump-single-json");
        assert!(position(&args, "-f").is_none());
        assert!(position(&args, "-o").is_none());
    }
}
