use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scope key for the single bot-wide row in `default_settings`.
pub const BOT_SCOPE: &str = "bot";

/// What a queued job asks the backend to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// Fresh generation from a user prompt.
    New { prompt: String },
    /// Regenerate the whole batch behind a previous result message.
    Reroll,
    /// Nudge one image of a previous batch with a fresh subseed.
    Variation { index: i64 },
    /// Regenerate one image of a previous batch and upscale it.
    Upscale { index: i64 },
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::New { .. } => "new",
            JobKind::Reroll => "reroll",
            JobKind::Variation { .. } => "variation",
            JobKind::Upscale { .. } => "upscale",
        }
    }

    /// Batch position the job derives its parameters from, if any.
    /// Reroll reuses the lead record, so its index is 0.
    pub fn source_index(&self) -> Option<i64> {
        match self {
            JobKind::New { .. } => None,
            JobKind::Reroll => Some(0),
            JobKind::Variation { index } | JobKind::Upscale { index } => Some(*index),
        }
    }
}

/// Lifecycle of a job once it has been handed to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

/// Submission-time failures, reported to the caller rather than the worker.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("generation queue is full")]
    QueueFull,
}

/// Failures of a single job. Caught at the job boundary; never unwinds the
/// worker loop.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("could not parse prompt: {0}")]
    Prompt(anyhow::Error),
    #[error("backend request failed: {0}")]
    Backend(anyhow::Error),
    #[error("no generation found for message {message_id} at position {index}")]
    NotFound { message_id: String, index: i64 },
    #[error("failed to persist generation record: {0}")]
    Persistence(anyhow::Error),
    #[error("failed to deliver response: {0}")]
    Delivery(anyhow::Error),
}

/// One row of the `image_generations` table.
///
/// `sort_order` 0 is the lead record snapshotting the request; 1..N are the
/// per-image records carrying the seeds the backend actually used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageGeneration {
    pub id: i64,
    pub interaction_id: String,
    pub message_id: String,
    pub member_id: String,
    pub sort_order: i64,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: i64,
    pub height: i64,
    pub restore_faces: bool,
    pub enable_hr: bool,
    pub hires_width: i64,
    pub hires_height: i64,
    pub denoising_strength: f64,
    pub batch_count: i64,
    pub batch_size: i64,
    pub seed: i64,
    pub subseed: i64,
    pub subseed_strength: f64,
    pub sampler_name: String,
    pub cfg_scale: f64,
    pub steps: i64,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

/// Bot-wide generation defaults, one row per scope key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefaultSettings {
    pub scope_key: String,
    pub width: i64,
    pub height: i64,
    pub batch_count: i64,
    pub batch_size: i64,
}

impl DefaultSettings {
    /// Values written on first access, before any settings command ran.
    pub fn bootstrap(scope_key: &str) -> Self {
        Self {
            scope_key: scope_key.to_string(),
            width: 768,
            height: 768,
            batch_count: 4,
            batch_size: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_index_per_kind() {
        assert_eq!(JobKind::New { prompt: "cat".into() }.source_index(), None);
        assert_eq!(JobKind::Reroll.source_index(), Some(0));
        assert_eq!(JobKind::Variation { index: 3 }.source_index(), Some(3));
        assert_eq!(JobKind::Upscale { index: 1 }.source_index(), Some(1));
    }
}
