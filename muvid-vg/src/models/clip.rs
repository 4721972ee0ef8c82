//! Generated visual clip record and status machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Clip generation status
///
/// queued -> processing -> {completed, failed, canceled}; failed and
/// canceled clips may be reset to queued by retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl ClipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClipStatus::Queued => "queued",
            ClipStatus::Processing => "processing",
            ClipStatus::Completed => "completed",
            ClipStatus::Failed => "failed",
            ClipStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ClipStatus::Queued),
            "processing" => Some(ClipStatus::Processing),
            "completed" => Some(ClipStatus::Completed),
            "failed" => Some(ClipStatus::Failed),
            "canceled" => Some(ClipStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClipStatus::Completed | ClipStatus::Failed | ClipStatus::Canceled
        )
    }

    /// Statuses eligible for (re-)generation
    pub fn is_generatable(&self) -> bool {
        matches!(
            self,
            ClipStatus::Queued | ClipStatus::Failed | ClipStatus::Canceled
        )
    }
}

/// A generated visual segment for one plan entry
///
/// Invariant: a clip is `completed` iff a non-null, fetchable result URL
/// exists and its probed duration matches `requested_frames /
/// requested_fps` within one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clip {
    pub id: Uuid,
    pub song_id: Uuid,
    pub plan_index: i64,
    pub prompt: String,
    pub seed: i64,
    pub requested_frames: i64,
    pub requested_fps: i64,
    pub status: ClipStatus,
    /// Provider-side job id, stored before polling begins so a restarted
    /// worker resumes polling instead of resubmitting
    pub external_job_id: Option<String>,
    pub result_url: Option<String>,
    pub result_width: Option<i64>,
    pub result_height: Option<i64>,
    pub result_fps: Option<f64>,
    pub error: Option<String>,
    /// Generation attempts started for this clip
    pub attempt_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Clip {
    pub fn new(
        song_id: Uuid,
        plan_index: i64,
        prompt: String,
        seed: i64,
        requested_frames: i64,
        requested_fps: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            song_id,
            plan_index,
            prompt,
            seed,
            requested_frames,
            requested_fps,
            status: ClipStatus::Queued,
            external_job_id: None,
            result_url: None,
            result_width: None,
            result_height: None,
            result_fps: None,
            error: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Requested duration in seconds
    pub fn requested_duration_sec(&self) -> f64 {
        self.requested_frames as f64 / self.requested_fps as f64
    }

    /// Whether a probed duration satisfies the completion invariant
    /// (within one frame of the requested duration)
    pub fn duration_within_tolerance(&self, probed_duration_sec: f64) -> bool {
        let frame = 1.0 / self.requested_fps as f64;
        (probed_duration_sec - self.requested_duration_sec()).abs() <= frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_tolerance_is_one_frame() {
        let clip = Clip::new(Uuid::new_v4(), 0, "p".into(), 1, 120, 24);
        assert_eq!(clip.requested_duration_sec(), 5.0);
        assert!(clip.duration_within_tolerance(5.0));
        assert!(clip.duration_within_tolerance(5.04));
        assert!(clip.duration_within_tolerance(4.96));
        assert!(!clip.duration_within_tolerance(5.2));
    }

    #[test]
    fn test_status_machine_helpers() {
        assert!(ClipStatus::Completed.is_terminal());
        assert!(!ClipStatus::Processing.is_terminal());
        assert!(ClipStatus::Failed.is_generatable());
        assert!(ClipStatus::Canceled.is_generatable());
        assert!(!ClipStatus::Processing.is_generatable());
        assert!(!ClipStatus::Completed.is_generatable());
    }
}
