// FormatSelector - turns a format rule into the expression handed to the engine
//
// Handles:
// - Named presets and declarative expressions (passed through unchanged)
// - Quality ladder expressions (1080p, 720p, ...)
// - Programmatic selection: pair one video-only and one audio-only stream

use std::fmt;
use std::sync::Arc;

use super::errors::{DownloadError, Result};
use super::models::CandidateStream;
use super::traits::{StreamSelection, StreamSelector};

/// Named presets the engine understands without further parsing
pub const PRESETS: &[&str] = &[
    "best",
    "bestaudio",
    "bestvideo",
    "worst",
    "worstaudio",
    "worstvideo",
];

/// Which source stream(s) a job fetches
#[derive(Clone, PartialEq)]
pub enum FormatRule {
    Preset(String),
    Declarative(String),
    Programmatic(Arc<dyn StreamSelector>),
}

impl fmt::Debug for FormatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preset(name) => write!(f, "Preset({:?})", name),
            Self::Declarative(expr) => write!(f, "Declarative({:?})", expr),
            Self::Programmatic(selector) => write!(f, "Programmatic({})", selector.describe()),
        }
    }
}

impl FormatRule {
    /// Preset when `value` names one, declarative expression otherwise
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(DownloadError::invalid_option("format", "format rule is empty"));
        }
        if PRESETS.contains(&value) {
            Ok(Self::Preset(value.to_string()))
        } else {
            Ok(Self::Declarative(value.to_string()))
        }
    }

    /// Expression for a quality ladder value
    pub fn for_quality(quality: &str) -> Result<Self> {
        let expr = match quality {
            "best" => "bv*+ba/best",
            "1080p" => "bv*[height<=1080]+ba/b[height<=1080]/bv*+ba/best",
            "720p" => "bv*[height<=720]+ba/b[height<=720]/bv*+ba/best",
            "480p" => "bv*[height<=480]+ba/b[height<=480]/bv*+ba/best",
            "360p" => "bv*[height<=360]+ba/b[height<=360]/bv*+ba/best",
            "audio" => "ba/b",
            other => {
                return Err(DownloadError::invalid_option(
                    "quality",
                    format!("unknown quality '{}'", other),
                ))
            }
        };
        Ok(Self::Declarative(expr.to_string()))
    }
}

/// Concrete format expression plus the streams it was derived from, if any
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFormat {
    pub expression: String,
    pub selection: Option<StreamSelection>,
}

pub struct FormatSelector;

impl FormatSelector {
    /// Resolve `rule` against the engine's candidate list
    pub fn resolve(rule: &FormatRule, candidates: &[CandidateStream]) -> Result<ResolvedFormat> {
        match rule {
            FormatRule::Preset(expr) | FormatRule::Declarative(expr) => {
                if expr.trim().is_empty() {
                    return Err(DownloadError::invalid_option("format", "format rule is empty"));
                }
                Ok(ResolvedFormat {
                    expression: expr.clone(),
                    selection: None,
                })
            }
            FormatRule::Programmatic(selector) => {
                let selection = selector.select(candidates)?;
                Ok(ResolvedFormat {
                    expression: selection.format_id.clone(),
                    selection: Some(selection),
                })
            }
        }
    }
}

/// Audio container that muxes cleanly into the requested output container
pub fn audio_container_for(preferred_ext: &str) -> Option<&'static str> {
    match preferred_ext {
        "mp4" => Some("m4a"),
        "webm" => Some("webm"),
        _ => None,
    }
}

/// Pairs the best video-only stream with a container-compatible audio-only stream.
///
/// The engine lists formats worst-to-best, so the scan runs over the reversed
/// list and the first match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedStreamSelector {
    preferred_ext: String,
}

impl PairedStreamSelector {
    pub fn new(preferred_ext: impl Into<String>) -> Self {
        Self {
            preferred_ext: preferred_ext.into().trim().to_lowercase(),
        }
    }

    pub fn preferred_ext(&self) -> &str {
        &self.preferred_ext
    }
}

impl StreamSelector for PairedStreamSelector {
    fn select(&self, candidates: &[CandidateStream]) -> Result<StreamSelection> {
        let audio_ext = audio_container_for(&self.preferred_ext).ok_or_else(|| {
            DownloadError::Selection(format!(
                "no audio container is known for output extension '{}'",
                self.preferred_ext
            ))
        })?;

        let best_video = candidates
            .iter()
            .rev()
            .find(|f| f.is_video_only())
            .ok_or_else(|| DownloadError::Selection("no video-only stream available".to_string()))?;

        let best_audio = candidates
            .iter()
            .rev()
            .find(|f| f.is_audio_only() && f.ext == audio_ext)
            .ok_or_else(|| {
                DownloadError::Selection(format!("no audio-only {} stream available", audio_ext))
            })?;

        Ok(StreamSelection {
            format_id: format!("{}+{}", best_video.format_id, best_audio.format_id),
            streams: vec![best_video.clone(), best_audio.clone()],
        })
    }

    fn describe(&self) -> String {
        format!("paired(ext={})", self.preferred_ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_stream(id: &str, ext: &str, vcodec: &str, acodec: &str) -> CandidateStream {
        CandidateStream {
            format_id: id.to_string(),
            ext: ext.to_string(),
            vcodec: Some(vcodec.to_string()),
            acodec: Some(acodec.to_string()),
            ..Default::default()
        }
    }

    fn programmatic(ext: &str) -> FormatRule {
        FormatRule::Programmatic(Arc::new(PairedStreamSelector::new(ext)))
    }

    #[test]
    fn pairs_video_only_and_audio_only_for_mp4() {
        let formats = vec![
            make_stream("137", "mp4", "h264", "none"),
            make_stream("140", "m4a", "none", "aac"),
        ];

        let resolved = FormatSelector::resolve(&programmatic("mp4"), &formats).unwrap();

        assert_eq!(resolved.expression, "137+140");
        let selection = resolved.selection.unwrap();
        assert_eq!(selection.streams[0].format_id, "137");
        assert_eq!(selection.streams[1].format_id, "140");
    }

    #[test]
    fn last_listed_candidate_wins() {
        let formats = vec![
            make_stream("18", "mp4", "avc1", "mp4a"),
            make_stream("134", "mp4", "avc1", "none"),
            make_stream("139", "m4a", "none", "mp4a"),
            make_stream("251", "webm", "none", "opus"),
            make_stream("137", "mp4", "avc1", "none"),
            make_stream("140", "m4a", "none", "mp4a"),
        ];

        let resolved = FormatSelector::resolve(&programmatic("mp4"), &formats).unwrap();
        assert_eq!(resolved.expression, "137+140");

        let resolved = FormatSelector::resolve(&programmatic("webm"), &formats).unwrap();
        assert_eq!(resolved.expression, "137+251");
    }

    #[test]
    fn unmapped_extension_fails_selection() {
        let formats = vec![
            make_stream("137", "mp4", "h264", "none"),
            make_stream("140", "m4a", "none", "aac"),
        ];

        let err = FormatSelector::resolve(&programmatic("ogg"), &formats).unwrap_err();
        assert!(matches!(err, DownloadError::Selection(_)));
    }

    #[test]
    fn missing_audio_container_fails_selection() {
        let formats = vec![
            make_stream("137", "mp4", "h264", "none"),
            make_stream("251", "webm", "none", "opus"),
        ];

        let err = FormatSelector::resolve(&programmatic("mp4"), &formats).unwrap_err();
        assert!(matches!(err, DownloadError::Selection(_)));
    }

    #[test]
    fn presets_and_expressions_pass_through() {
        let rule = FormatRule::parse("bestaudio").unwrap();
        assert_eq!(rule, FormatRule::Preset("bestaudio".into()));

        let expr = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best";
        let resolved = FormatSelector::resolve(&FormatRule::parse(expr).unwrap(), &[]).unwrap();
        assert_eq!(resolved.expression, expr);
        assert!(resolved.selection.is_none());

        assert!(FormatRule::parse("  ").is_err());
        assert!(FormatSelector::resolve(&FormatRule::Declarative(String::new()), &[]).is_err());
    }

    #[test]
    fn quality_ladder() {
        assert_eq!(
            FormatRule::for_quality("720p").unwrap(),
            FormatRule::Declarative("bv*[height<=720]+ba/b[height<=720]/bv*+ba/best".into())
        );
        assert!(FormatRule::for_quality("8k").is_err());
    }
}
