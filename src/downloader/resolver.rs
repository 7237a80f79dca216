// Artifact resolver: where did the engine actually put the file?

use std::path::PathBuf;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;

use super::errors::{DownloadError, Result};
use super::models::{ExtractionOutcome, InfoRecord, JobDescriptor, OutcomeStatus};

lazy_static! {
    static ref FIELD_RE: Regex = Regex::new(r"%%|%\(([A-Za-z0-9_]+)\)(0?\d*)([sdf])").unwrap();
}

/// Placeholder for fields the metadata does not carry
pub const MISSING_FIELD: &str = "NA";

pub struct ArtifactResolver;

impl ArtifactResolver {
    /// Final on-disk path for a successful outcome.
    ///
    /// Precedence, first match wins:
    /// 1. the last muxed or post-processed path the engine reported
    /// 2. the only stream path the engine reported
    /// 3. the job's output template expanded against the metadata
    ///
    /// The extension is then forced to the audio codec's container when the
    /// chain extracts audio, since both the stream path and the metadata
    /// name the pre-conversion container.
    pub fn resolve(outcome: &ExtractionOutcome, job: &JobDescriptor) -> Result<PathBuf> {
        if outcome.status != OutcomeStatus::Success {
            let detail = outcome.error_detail.as_deref().unwrap_or("no detail");
            return Err(DownloadError::Resolution(format!(
                "job did not succeed ({:?}): {}",
                outcome.status, detail
            )));
        }

        let path = match outcome.final_reported_path().or_else(|| outcome.sole_stream_path()) {
            Some(path) => path.clone(),
            None => {
                let info = outcome.info_record.as_ref().ok_or_else(|| {
                    DownloadError::Resolution("no reported path and no metadata to expand".to_string())
                })?;
                PathBuf::from(expand_template(job.output_template(), &info.primary_item()))
            }
        };

        if path.file_name().is_none() {
            return Err(DownloadError::Resolution(format!(
                "resolved path has no file name: {}",
                path.display()
            )));
        }

        Ok(match job.extract_audio_codec() {
            Some(codec) => path.with_extension(codec.extension()),
            None => path,
        })
    }
}

/// Expand `%(field)s`, `%(field)d` and `%(field)f` placeholders the way the engine names files
pub fn expand_template(template: &str, info: &InfoRecord) -> String {
    FIELD_RE
        .replace_all(template, |caps: &Captures| {
            let Some(field) = caps.get(1) else {
                return "%".to_string();
            };
            let width = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let conversion = caps.get(3).map(|m| m.as_str()).unwrap_or("s");
            render_field(info.get(field.as_str()), width, conversion)
        })
        .into_owned()
}

fn render_field(value: Option<&Value>, width: &str, conversion: &str) -> String {
    let rendered = match (value, conversion) {
        (None | Some(Value::Null), _) => return MISSING_FIELD.to_string(),
        (Some(Value::Number(n)), "d") => match n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)) {
            Some(i) => pad(i.to_string(), width),
            None => MISSING_FIELD.to_string(),
        },
        (Some(Value::Number(n)), "f") => n.as_f64().map(|f| format!("{:.6}", f)).unwrap_or_default(),
        (Some(Value::Number(n)), _) => n.to_string(),
        (Some(Value::String(s)), _) => s.clone(),
        (Some(Value::Bool(b)), _) => b.to_string(),
        (Some(other), _) => other.to_string(),
    };
    sanitize_filename(&rendered)
}

/// Zero-pad to `width` when the placeholder asks for it (`%(autonumber)03d`)
fn pad(digits: String, width: &str) -> String {
    let Some(width) = width.strip_prefix('0').and_then(|w| w.parse::<usize>().ok()) else {
        return digits;
    };
    format!("{:0>width$}", digits, width = width)
}

/// Replace characters that cannot appear in a file name with look-alikes
pub fn sanitize_filename(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' => '\u{29F8}',
            '\\' => '\u{29F9}',
            '"' | '*' | ':' | '<' | '>' | '?' | '|' => char::from_u32(c as u32 + 0xFEE0).unwrap_or('_'),
            other => other,
        })
        .collect()
}
