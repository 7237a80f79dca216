// Post-processing chain builder

use super::errors::{DownloadError, Result};
use super::job::{JobMode, JobOptions};
use super::models::{AttachPoint, AudioCodec, PostProcessingStep, StepKind};

/// Default codec when a caller asks for audio extraction without naming one
pub const DEFAULT_EXTRACT_CODEC: AudioCodec = AudioCodec::Mp3;

/// Build the ordered post-processing chain for `mode`.
///
/// Steps come from the `postprocessors` option (`kind[:arg][@when]`, comma
/// separated), then the `embed_thumbnail` / `add_metadata` flags, plus any
/// audio extraction the mode implies. Audio extraction always runs first
/// because the embedding steps operate on the final container.
pub fn build(mode: JobMode, options: &JobOptions) -> Result<Vec<PostProcessingStep>> {
    if mode == JobMode::Info {
        return Ok(Vec::new());
    }

    let mut steps: Vec<PostProcessingStep> = Vec::new();

    for spec in split_steps(options.get("postprocessors").unwrap_or_default()) {
        push_step(&mut steps, parse_step(&spec)?)?;
    }

    if mode == JobMode::PostProcess && steps.is_empty() {
        return Err(DownloadError::invalid_option(
            "postprocessors",
            "at least one post-processing step is required",
        ));
    }

    if let Some(codec) = implied_audio_codec(mode, options)? {
        push_step(&mut steps, PostProcessingStep::extract_audio(codec))?;
    }
    if options.flag("embed_thumbnail") {
        push_step(&mut steps, PostProcessingStep::embed_thumbnail())?;
    }
    if options.flag("add_metadata") {
        push_step(&mut steps, PostProcessingStep::add_metadata())?;
    }

    if let Some(idx) = steps.iter().position(|s| s.kind == StepKind::ExtractAudio) {
        let extract = steps.remove(idx);
        steps.insert(0, extract);
    }

    Ok(steps)
}

/// Audio extraction requested through mode-level options rather than the chain spec
fn implied_audio_codec(mode: JobMode, options: &JobOptions) -> Result<Option<AudioCodec>> {
    match mode {
        JobMode::Audio => {
            let codec = options.get("codec").unwrap_or("m4a");
            Ok(Some(codec.parse()?))
        }
        JobMode::Download => {
            if options.get("format") == Some("mp3") {
                return Ok(Some(AudioCodec::Mp3));
            }
            if options.flag("extract_audio") {
                let codec = match options.get("codec") {
                    Some(codec) => codec.parse()?,
                    None => DEFAULT_EXTRACT_CODEC,
                };
                return Ok(Some(codec));
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

/// Append `step`, skipping exact duplicates and rejecting conflicting audio targets
fn push_step(steps: &mut Vec<PostProcessingStep>, step: PostProcessingStep) -> Result<()> {
    if step.kind == StepKind::ExtractAudio {
        if let Some(existing) = steps.iter().find(|s| s.kind == StepKind::ExtractAudio) {
            if existing != &step {
                return Err(DownloadError::invalid_option(
                    "postprocessors",
                    "conflicting audio extraction targets",
                ));
            }
            return Ok(());
        }
    }
    if !steps.contains(&step) {
        steps.push(step);
    }
    Ok(())
}

/// Split the chain at commas that start a new step.
///
/// A segment whose head is not a step kind belongs to the preceding custom
/// step, so `custom:SponsorBlock;categories=sponsor,intro` stays one item.
fn split_steps(raw: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for segment in raw.split(',') {
        let head = segment.split(|c| c == ':' || c == '@').next().unwrap_or_default();
        let starts_step = head.parse::<StepKind>().is_ok();
        match items.last_mut() {
            Some(last) if !starts_step && is_custom(last) => {
                last.push(',');
                last.push_str(segment);
            }
            _ => items.push(segment.to_string()),
        }
    }
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn is_custom(item: &str) -> bool {
    matches!(item.trim().split_once(':'), Some((kind, _)) if matches!(kind.parse::<StepKind>(), Ok(StepKind::Custom)))
}

/// Parse one `kind[:arg][@when]` item
fn parse_step(spec: &str) -> Result<PostProcessingStep> {
    let (body, when) = match spec.split_once('@') {
        Some((body, when)) => (body.trim(), Some(when.parse::<AttachPoint>()?)),
        None => (spec.trim(), None),
    };
    let (kind, arg) = match body.split_once(':') {
        Some((kind, arg)) => (kind.parse::<StepKind>()?, Some(arg.trim())),
        None => (body.parse::<StepKind>()?, None),
    };

    if kind != StepKind::Custom && when.is_some() {
        return Err(DownloadError::invalid_option(
            "postprocessors",
            format!("attach point can only be set on custom steps: '{}'", spec),
        ));
    }

    match kind {
        StepKind::ExtractAudio => {
            let codec = match arg {
                Some(codec) if !codec.is_empty() => codec.parse()?,
                _ => DEFAULT_EXTRACT_CODEC,
            };
            Ok(PostProcessingStep::extract_audio(codec))
        }
        StepKind::EmbedThumbnail => Ok(PostProcessingStep::embed_thumbnail()),
        StepKind::AddMetadata => Ok(PostProcessingStep::add_metadata()),
        StepKind::Custom => {
            let arg = arg.filter(|a| !a.is_empty()).ok_or_else(|| {
                DownloadError::invalid_option("postprocessors", "custom step needs a name")
            })?;
            parse_custom(arg, when.unwrap_or(AttachPoint::PreProcess))
        }
    }
}

/// `Name;key=value;key=value`
fn parse_custom(arg: &str, attach_point: AttachPoint) -> Result<PostProcessingStep> {
    let mut parts = arg.split(';');
    let name = parts.next().unwrap_or_default().trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DownloadError::invalid_option(
            "postprocessors",
            format!("invalid custom step name '{}'", name),
        ));
    }

    let mut step = PostProcessingStep::custom(name, attach_point);
    for pair in parts.filter(|p| !p.trim().is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            DownloadError::invalid_option(
                "postprocessors",
                format!("custom step argument must be key=value: '{}'", pair),
            )
        })?;
        let key = key.trim();
        if key == "name" || key == "when" {
            return Err(DownloadError::invalid_option(
                "postprocessors",
                format!("reserved custom step argument '{}'", key),
            ));
        }
        step.params.insert(key.to_string(), value.trim().to_string());
    }
    Ok(step)
}
