// Common data models for the download pipeline

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::DownloadError;
use super::format_selector::FormatRule;
use super::job::JobMode;
use super::traits::{FilterPredicate, LogSink};

/// Where a post-processing step hooks into the engine's pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPoint {
    /// Runs after extraction, before any stream is transferred
    PreProcess,
    /// Runs on the transferred file
    PostProcess,
}

impl AttachPoint {
    /// Value understood by yt-dlp's `when=` post-processor argument
    pub fn as_engine_str(&self) -> &'static str {
        match self {
            Self::PreProcess => "pre_process",
            Self::PostProcess => "post_process",
        }
    }
}

impl FromStr for AttachPoint {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pre" | "pre_process" => Ok(Self::PreProcess),
            "post" | "post_process" => Ok(Self::PostProcess),
            other => Err(DownloadError::invalid_option(
                "postprocessors",
                format!("unknown attach point '{}'", other),
            )),
        }
    }
}

/// Kinds of transform the engine can apply to a downloaded artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ExtractAudio,
    EmbedThumbnail,
    AddMetadata,
    Custom,
}

impl FromStr for StepKind {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "extract_audio" => Ok(Self::ExtractAudio),
            "embed_thumbnail" => Ok(Self::EmbedThumbnail),
            "add_metadata" | "embed_metadata" => Ok(Self::AddMetadata),
            "custom" => Ok(Self::Custom),
            other => Err(DownloadError::invalid_option(
                "postprocessors",
                format!("unknown post-processing step '{}'", other),
            )),
        }
    }
}

/// Target codecs accepted by audio extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Mp3,
    Aac,
    M4a,
    Opus,
    Vorbis,
    Flac,
    Alac,
    Wav,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::M4a => "m4a",
            Self::Opus => "opus",
            Self::Vorbis => "vorbis",
            Self::Flac => "flac",
            Self::Alac => "alac",
            Self::Wav => "wav",
        }
    }

    /// File extension the engine writes after converting to this codec
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac | Self::M4a | Self::Alac => "m4a",
            Self::Opus => "opus",
            Self::Vorbis => "ogg",
            Self::Flac => "flac",
            Self::Wav => "wav",
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioCodec {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "aac" => Ok(Self::Aac),
            "m4a" => Ok(Self::M4a),
            "opus" => Ok(Self::Opus),
            "vorbis" => Ok(Self::Vorbis),
            "flac" => Ok(Self::Flac),
            "alac" => Ok(Self::Alac),
            "wav" => Ok(Self::Wav),
            other => Err(DownloadError::invalid_option(
                "codec",
                format!("unsupported audio codec '{}'", other),
            )),
        }
    }
}

/// One transform in a job's post-processing chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessingStep {
    pub kind: StepKind,
    pub params: BTreeMap<String, String>,
    pub attach_point: AttachPoint,
}

impl PostProcessingStep {
    pub fn extract_audio(codec: AudioCodec) -> Self {
        Self {
            kind: StepKind::ExtractAudio,
            params: BTreeMap::from([("codec".to_string(), codec.as_str().to_string())]),
            attach_point: AttachPoint::PostProcess,
        }
    }

    pub fn embed_thumbnail() -> Self {
        Self {
            kind: StepKind::EmbedThumbnail,
            params: BTreeMap::new(),
            attach_point: AttachPoint::PostProcess,
        }
    }

    pub fn add_metadata() -> Self {
        Self {
            kind: StepKind::AddMetadata,
            params: BTreeMap::new(),
            attach_point: AttachPoint::PostProcess,
        }
    }

    pub fn custom(name: impl Into<String>, attach_point: AttachPoint) -> Self {
        Self {
            kind: StepKind::Custom,
            params: BTreeMap::from([("name".to_string(), name.into())]),
            attach_point,
        }
    }

    /// Target codec of an audio extraction step, if one was given
    pub fn audio_codec(&self) -> Option<AudioCodec> {
        if self.kind != StepKind::ExtractAudio {
            return None;
        }
        self.params.get("codec").and_then(|c| c.parse().ok())
    }
}

/// Immutable description of one download attempt.
///
/// Only [`JobBuilder`](super::job::JobBuilder) constructs descriptors; a new
/// request always produces a new descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub(crate) mode: JobMode,
    pub(crate) source_url: String,
    pub(crate) output_template: String,
    pub(crate) format_rule: FormatRule,
    pub(crate) post_processors: Vec<PostProcessingStep>,
    pub(crate) filter: Option<Arc<dyn FilterPredicate>>,
    pub(crate) write_subtitles: bool,
    pub(crate) subtitle_languages: BTreeSet<String>,
    pub(crate) write_thumbnail: bool,
    pub(crate) single_item_only: bool,
    pub(crate) log_sink: Option<Arc<dyn LogSink>>,
}

impl JobDescriptor {
    pub fn mode(&self) -> JobMode {
        self.mode
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn output_template(&self) -> &str {
        &self.output_template
    }

    pub fn format_rule(&self) -> &FormatRule {
        &self.format_rule
    }

    pub fn post_processors(&self) -> &[PostProcessingStep] {
        &self.post_processors
    }

    pub fn filter(&self) -> Option<&Arc<dyn FilterPredicate>> {
        self.filter.as_ref()
    }

    pub fn write_subtitles(&self) -> bool {
        self.write_subtitles
    }

    pub fn subtitle_languages(&self) -> &BTreeSet<String> {
        &self.subtitle_languages
    }

    pub fn write_thumbnail(&self) -> bool {
        self.write_thumbnail
    }

    pub fn single_item_only(&self) -> bool {
        self.single_item_only
    }

    pub fn log_sink(&self) -> Option<&Arc<dyn LogSink>> {
        self.log_sink.as_ref()
    }

    /// Consume the descriptor and return one that reports to `sink`
    pub fn with_log_sink(self, sink: Arc<dyn LogSink>) -> Self {
        Self {
            log_sink: Some(sink),
            ..self
        }
    }

    /// Codec of the audio extraction step, if the chain converts audio
    pub fn extract_audio_codec(&self) -> Option<AudioCodec> {
        self.post_processors.iter().find_map(|step| step.audio_codec())
    }
}

/// Sanitized metadata mapping returned by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InfoRecord(pub Map<String, Value>);

impl InfoRecord {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn title(&self) -> Option<&str> {
        self.str_field("title")
    }

    pub fn ext(&self) -> Option<&str> {
        self.str_field("ext")
    }

    /// Duration in seconds, when the engine knows it
    pub fn duration(&self) -> Option<f64> {
        self.0.get("duration").and_then(Value::as_f64)
    }

    pub fn is_playlist(&self) -> bool {
        self.str_field("_type") == Some("playlist")
    }

    /// Live and upcoming streams have no final duration or size yet
    pub fn is_incomplete(&self) -> bool {
        if self.0.get("is_live").and_then(Value::as_bool) == Some(true) {
            return true;
        }
        matches!(
            self.str_field("live_status"),
            Some("is_live") | Some("is_upcoming") | Some("post_live")
        )
    }

    /// First entry of a playlist, or the record itself for a single item
    pub fn primary_item(&self) -> InfoRecord {
        if self.is_playlist() {
            let first = self
                .0
                .get("entries")
                .and_then(Value::as_array)
                .and_then(|entries| entries.iter().find_map(|e| e.as_object().cloned()));
            if let Some(entry) = first {
                return InfoRecord(entry);
            }
        }
        self.clone()
    }

    /// Candidate streams listed under `formats`
    pub fn formats(&self) -> Vec<CandidateStream> {
        self.0
            .get("formats")
            .and_then(Value::as_array)
            .map(|formats| {
                formats
                    .iter()
                    .filter_map(|f| serde_json::from_value(f.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// One stream the engine can fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateStream {
    pub format_id: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
}

fn codec_present(codec: &Option<String>) -> bool {
    codec
        .as_deref()
        .map_or(false, |c| !c.is_empty() && c != "none")
}

impl CandidateStream {
    pub fn has_video(&self) -> bool {
        codec_present(&self.vcodec)
    }

    pub fn has_audio(&self) -> bool {
        codec_present(&self.acodec)
    }

    pub fn is_video_only(&self) -> bool {
        self.has_video() && !self.has_audio()
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }
}

/// Pipeline stage at which the engine reported a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStage {
    /// A single stream written by the downloader
    Stream,
    /// Streams muxed into one container
    Merged,
    /// Output of a post-processor (audio extraction, remux, ...)
    PostProcessed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedPath {
    pub path: PathBuf,
    pub stage: PathStage,
}

/// Subtitle files the engine downloads next to the media stream
const SIDECAR_EXTENSIONS: &[&str] = &["vtt", "srt", "ass", "ssa", "ttml", "srv1", "srv2", "srv3", "json3", "lrc"];

impl ReportedPath {
    pub fn is_final(&self) -> bool {
        matches!(self.stage, PathStage::Merged | PathStage::PostProcessed)
    }

    pub fn is_sidecar(&self) -> bool {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| SIDECAR_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
    /// The filter predicate vetoed the download before any transfer
    Filtered,
}

/// Normalized result of one engine execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub status: OutcomeStatus,
    pub info_record: Option<InfoRecord>,
    pub reported_paths: Vec<ReportedPath>,
    /// Engine message for `Failed`, rejection reason for `Filtered`
    pub error_detail: Option<String>,
}

impl ExtractionOutcome {
    pub fn success(info_record: InfoRecord, reported_paths: Vec<ReportedPath>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            info_record: Some(info_record),
            reported_paths,
            error_detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>, info_record: Option<InfoRecord>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            info_record,
            reported_paths: Vec::new(),
            error_detail: Some(detail.into()),
        }
    }

    pub fn filtered(reason: impl Into<String>, info_record: InfoRecord) -> Self {
        Self {
            status: OutcomeStatus::Filtered,
            info_record: Some(info_record),
            reported_paths: Vec::new(),
            error_detail: Some(reason.into()),
        }
    }

    /// Last path the engine reported as muxed or post-processed
    pub fn final_reported_path(&self) -> Option<&PathBuf> {
        self.reported_paths
            .iter()
            .rev()
            .find(|p| p.is_final())
            .map(|p| &p.path)
    }

    /// The stream path, when the engine wrote exactly one distinct stream
    pub fn sole_stream_path(&self) -> Option<&PathBuf> {
        let mut streams = self
            .reported_paths
            .iter()
            .filter(|p| p.stage == PathStage::Stream && !p.is_sidecar())
            .map(|p| &p.path);
        let first = streams.next()?;
        if streams.all(|p| p == first) {
            Some(first)
        } else {
            None
        }
    }
}

/// What happens to artifacts once a job is served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Keep,
    PurgeDirectoryBeforeNextJob,
    DeleteAfterServe,
}

/// Download progress information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub percent: f32,
    pub status: String,
}
