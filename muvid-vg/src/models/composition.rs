//! Composition job state machine and the finished artifact record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Composition pipeline state
///
/// queued -> validating -> downloading -> normalizing -> beat_aligning?
/// -> concatenating -> applying_effects? -> muxing -> verifying ->
/// uploading -> completed. Any non-terminal state may transition to
/// failed, or to canceled at the next checkpoint after a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionState {
    Queued,
    Validating,
    Downloading,
    Normalizing,
    BeatAligning,
    Concatenating,
    ApplyingEffects,
    Muxing,
    Verifying,
    Uploading,
    Completed,
    Failed,
    Canceled,
}

impl CompositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompositionState::Queued => "queued",
            CompositionState::Validating => "validating",
            CompositionState::Downloading => "downloading",
            CompositionState::Normalizing => "normalizing",
            CompositionState::BeatAligning => "beat_aligning",
            CompositionState::Concatenating => "concatenating",
            CompositionState::ApplyingEffects => "applying_effects",
            CompositionState::Muxing => "muxing",
            CompositionState::Verifying => "verifying",
            CompositionState::Uploading => "uploading",
            CompositionState::Completed => "completed",
            CompositionState::Failed => "failed",
            CompositionState::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(CompositionState::Queued),
            "validating" => Some(CompositionState::Validating),
            "downloading" => Some(CompositionState::Downloading),
            "normalizing" => Some(CompositionState::Normalizing),
            "beat_aligning" => Some(CompositionState::BeatAligning),
            "concatenating" => Some(CompositionState::Concatenating),
            "applying_effects" => Some(CompositionState::ApplyingEffects),
            "muxing" => Some(CompositionState::Muxing),
            "verifying" => Some(CompositionState::Verifying),
            "uploading" => Some(CompositionState::Uploading),
            "completed" => Some(CompositionState::Completed),
            "failed" => Some(CompositionState::Failed),
            "canceled" => Some(CompositionState::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CompositionState::Completed | CompositionState::Failed | CompositionState::Canceled
        )
    }

    /// Nominal overall progress percent on entering this state
    ///
    /// Monotonic non-decreasing along the happy path; the job row carries
    /// the exact value so reconnecting clients resume from it.
    pub fn progress_percent(&self) -> f64 {
        match self {
            CompositionState::Queued => 0.0,
            CompositionState::Validating => 5.0,
            CompositionState::Downloading => 15.0,
            CompositionState::Normalizing => 30.0,
            CompositionState::BeatAligning => 55.0,
            CompositionState::Concatenating => 65.0,
            CompositionState::ApplyingEffects => 75.0,
            CompositionState::Muxing => 85.0,
            CompositionState::Verifying => 92.0,
            CompositionState::Uploading => 96.0,
            CompositionState::Completed => 100.0,
            CompositionState::Failed | CompositionState::Canceled => 0.0,
        }
    }

    /// Coarse status for the user-facing job endpoint
    pub fn coarse_status(&self) -> &'static str {
        match self {
            CompositionState::Queued => "queued",
            CompositionState::Completed => "completed",
            CompositionState::Failed => "failed",
            CompositionState::Canceled => "canceled",
            _ => "processing",
        }
    }
}

/// One composition run for a song
///
/// At most one non-terminal composition exists per song.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionJob {
    pub id: Uuid,
    pub song_id: Uuid,
    /// Ordered clip ids selected for assembly
    pub clip_ids: Vec<Uuid>,
    pub state: CompositionState,
    /// Percent complete (0-100), monotonic non-decreasing
    pub progress: f64,
    pub error: Option<String>,
    /// Set when a cancel was requested; workers honor it at the next
    /// checkpoint
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CompositionJob {
    pub fn new(song_id: Uuid, clip_ids: Vec<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            song_id,
            clip_ids,
            state: CompositionState::Queued,
            progress: 0.0,
            error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The finished audio-visual artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposedVideo {
    pub id: Uuid,
    pub song_id: Uuid,
    pub blob_key: String,
    pub width: i64,
    pub height: i64,
    pub fps: f64,
    pub duration_sec: f64,
    pub byte_size: i64,
    pub composition_job_id: Uuid,
    pub clip_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}
