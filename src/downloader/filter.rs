// Match filters evaluated against resolved metadata before any transfer

use super::models::InfoRecord;
use super::traits::FilterPredicate;

/// Rejects resources shorter than a minimum duration.
///
/// Unknown or zero durations never reject: live and in-progress sources do
/// not have a final duration yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationFilter {
    min_seconds: u64,
}

impl DurationFilter {
    pub fn new(min_seconds: u64) -> Self {
        Self { min_seconds }
    }

    pub fn min_seconds(&self) -> u64 {
        self.min_seconds
    }
}

impl FilterPredicate for DurationFilter {
    fn evaluate(&self, attributes: &InfoRecord, _incomplete: bool) -> Option<String> {
        let duration = attributes.duration().filter(|d| *d > 0.0)?;
        if duration < self.min_seconds as f64 {
            Some(format!("Video shorter than {}s", self.min_seconds))
        } else {
            None
        }
    }

    fn describe(&self) -> String {
        format!("duration>={}", self.min_seconds)
    }

    fn engine_match_filters(&self) -> Vec<String> {
        vec!["!duration".to_string(), format!("duration >= {}", self.min_seconds)]
    }
}
