//! Job descriptor construction.
//!
//! [`JobBuilder::build`] turns a request's mode and raw option flags into a
//! complete [`JobDescriptor`]. Construction is pure: the same
//! `(url, mode, options)` always yields equal descriptors, and nothing touches
//! the filesystem or the network.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::errors::{DownloadError, Result};
use super::filter::DurationFilter;
use super::format_selector::{FormatRule, PairedStreamSelector};
use super::models::JobDescriptor;
use super::postprocess;
use super::traits::{FilterPredicate, LogSink, TracingLogSink};

/// Output template used when the request does not supply one
pub const DEFAULT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Minimum duration for `filter` mode when none is given
pub const DEFAULT_MIN_DURATION: u64 = 60;

/// Expression for `best_video`: MP4 video with M4A audio, falling back to any best
pub const BEST_VIDEO_FORMAT: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Metadata only, nothing is downloaded
    Info,
    /// Audio extraction with a selectable codec
    Audio,
    /// Best MP4-compatible video + audio
    BestVideo,
    /// Download only when the resource is long enough
    Filter,
    /// Download with structured logging and progress notifications
    Logger,
    /// Download through a caller-supplied post-processing chain
    #[serde(rename = "postprocessor")]
    PostProcess,
    /// Download with programmatic stream pairing
    CustomFormat,
    /// Generic download driven entirely by option flags
    Download,
}

impl JobMode {
    pub const ALL: [JobMode; 8] = [
        JobMode::Info,
        JobMode::Audio,
        JobMode::BestVideo,
        JobMode::Filter,
        JobMode::Logger,
        JobMode::PostProcess,
        JobMode::CustomFormat,
        JobMode::Download,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Audio => "audio",
            Self::BestVideo => "best_video",
            Self::Filter => "filter",
            Self::Logger => "logger",
            Self::PostProcess => "postprocessor",
            Self::CustomFormat => "custom_format",
            Self::Download => "download",
        }
    }

    /// Whether the job materializes a file
    pub fn produces_file(&self) -> bool {
        !matches!(self, Self::Info)
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobMode {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == wanted)
            .ok_or_else(|| DownloadError::InvalidMode(s.to_string()))
    }
}

/// Raw request options, as submitted by a form or JSON body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobOptions(BTreeMap<String, String>);

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold form pairs; repeated `options=<flag>` entries become `<flag>=true`
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = BTreeMap::new();
        for (key, value) in pairs {
            if key == "options" {
                map.insert(value, "true".to_string());
            } else {
                map.insert(key, value);
            }
        }
        Self(map)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Trimmed non-empty value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(|v| v.to_lowercase()).as_deref(),
            Some("true" | "on" | "1" | "yes")
        )
    }

    /// Comma-separated list, empty items dropped
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn integer(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                DownloadError::invalid_option(key, format!("expected a non-negative integer, got '{}'", raw))
            }),
        }
    }
}

/// Composes mode and options into descriptors rooted under one output directory
#[derive(Debug, Clone)]
pub struct JobBuilder {
    output_dir: PathBuf,
}

impl JobBuilder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn build(&self, url: &str, mode: &str, options: &JobOptions) -> Result<JobDescriptor> {
        let source_url = url.trim();
        if source_url.is_empty() {
            return Err(DownloadError::MissingUrl);
        }
        let mode: JobMode = mode.parse()?;

        let template = options.0.get("template").map(String::as_str).unwrap_or(DEFAULT_TEMPLATE);
        let template = self.output_template(template)?;
        let format_rule = format_rule_for(mode, options)?;
        let post_processors = postprocess::build(mode, options)?;
        let filter = filter_for(mode, options)?;
        let log_sink = sink_for(mode, options);

        let produces_file = mode.produces_file();
        let subtitle_languages: BTreeSet<String> = if produces_file && options.flag("write_subs") {
            let langs = options.list("sub_langs");
            if langs.is_empty() {
                BTreeSet::from(["en".to_string()])
            } else {
                langs.into_iter().collect()
            }
        } else {
            BTreeSet::new()
        };

        Ok(JobDescriptor {
            mode,
            source_url: source_url.to_string(),
            output_template: template,
            format_rule,
            post_processors,
            filter,
            write_subtitles: !subtitle_languages.is_empty(),
            subtitle_languages,
            write_thumbnail: produces_file && options.flag("write_thumbnail"),
            single_item_only: !options.flag("playlist"),
            log_sink,
        })
    }

    /// Root `template` under the output directory, refusing anything that escapes it
    fn output_template(&self, template: &str) -> Result<String> {
        let template = template.trim();
        if template.is_empty() {
            return Err(DownloadError::invalid_option("template", "template is empty"));
        }
        if template.starts_with('/') || template.starts_with('\\') || template.contains('\0') {
            return Err(DownloadError::invalid_option("template", "template must be relative"));
        }

        let path = Path::new(template);
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(DownloadError::invalid_option(
                        "template",
                        "template must not leave the output directory",
                    ))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(DownloadError::invalid_option("template", "template must be relative"))
                }
            }
        }
        // `..` split by the other separator is not a component on this platform
        if template.split(['/', '\\']).any(|part| part == "..") {
            return Err(DownloadError::invalid_option(
                "template",
                "template must not leave the output directory",
            ));
        }

        Ok(self.output_dir.join(path).to_string_lossy().into_owned())
    }
}

fn format_rule_for(mode: JobMode, options: &JobOptions) -> Result<FormatRule> {
    match mode {
        JobMode::Info => Ok(FormatRule::Preset("best".to_string())),
        JobMode::Audio => Ok(FormatRule::Declarative("bestaudio/best".to_string())),
        JobMode::BestVideo => Ok(FormatRule::Declarative(BEST_VIDEO_FORMAT.to_string())),
        JobMode::CustomFormat => {
            let ext = options.get("ext").unwrap_or("mp4");
            Ok(FormatRule::Programmatic(Arc::new(PairedStreamSelector::new(ext))))
        }
        JobMode::Download => match options.get("format") {
            Some("mp3") => Ok(FormatRule::Declarative("bestaudio/best".to_string())),
            _ => generic_format_rule(options),
        },
        JobMode::Filter | JobMode::Logger | JobMode::PostProcess => generic_format_rule(options),
    }
}

/// `quality` wins over `format`; `best` when neither is given
fn generic_format_rule(options: &JobOptions) -> Result<FormatRule> {
    if let Some(quality) = options.get("quality") {
        return FormatRule::for_quality(quality);
    }
    match options.0.get("format") {
        Some(raw) => FormatRule::parse(raw),
        None => Ok(FormatRule::Preset("best".to_string())),
    }
}

fn filter_for(mode: JobMode, options: &JobOptions) -> Result<Option<Arc<dyn FilterPredicate>>> {
    if mode != JobMode::Filter {
        return Ok(None);
    }
    let min_duration = options.integer("min_duration", DEFAULT_MIN_DURATION)?;
    Ok(Some(Arc::new(DurationFilter::new(min_duration))))
}

fn sink_for(mode: JobMode, options: &JobOptions) -> Option<Arc<dyn LogSink>> {
    match mode {
        JobMode::Logger => Some(Arc::new(TracingLogSink::new(options.flag("debug")))),
        _ => None,
    }
}
