//! Queue job records
//!
//! One row per enqueued unit of work. Queues are named FIFO partitions of
//! the jobs table; delivery is at-least-once via claim compare-and-set,
//! and expired claims are reaped back to queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of work a job row carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Audio analysis for one song
    Analyze,
    /// Generation of one clip
    ClipGenerate,
    /// Batch monitor over all generating clips of one song
    ClipBatch,
    /// Composition of completed clips into the final artifact
    Compose,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Analyze => "analyze",
            JobKind::ClipGenerate => "clip_generate",
            JobKind::ClipBatch => "clip_batch",
            JobKind::Compose => "compose",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "analyze" => Some(JobKind::Analyze),
            "clip_generate" => Some(JobKind::ClipGenerate),
            "clip_batch" => Some(JobKind::ClipBatch),
            "compose" => Some(JobKind::Compose),
            _ => None,
        }
    }
}

/// Job lifecycle status
///
/// `canceling` is a request flag state: workers observe it at checkpoints
/// and transition to `canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceling,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceling => "canceling",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "canceling" => Some(JobStatus::Canceling),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

/// One enqueued job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    /// Queue name, e.g. "prod:clip-generation"
    pub queue: String,
    pub kind: JobKind,
    /// Song the job belongs to; used for status reconstruction per
    /// (song, kind)
    pub song_id: Option<Uuid>,
    /// Kind-specific payload, including the config snapshot where the
    /// worker needs one
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Percent complete (0-100), monotonic non-decreasing
    pub progress: f64,
    pub error: Option<String>,
    /// Claim attempts made on this row
    pub attempt: i64,
    /// Claim timeout; processing rows older than this are reaped
    pub timeout_sec: i64,
    /// Earliest claim time; used for delayed (backoff) re-enqueue
    pub available_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(
        queue: String,
        kind: JobKind,
        song_id: Option<Uuid>,
        payload: serde_json::Value,
        timeout_sec: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            queue,
            kind,
            song_id,
            payload,
            status: JobStatus::Queued,
            progress: 0.0,
            error: None,
            attempt: 0,
            timeout_sec,
            available_at: now,
            claimed_at: None,
            finished_at: None,
            created_at: now,
        }
    }

    /// Delay the first claim (used for backoff re-enqueue)
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.available_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_kind_round_trip() {
        for kind in [
            JobKind::Analyze,
            JobKind::ClipGenerate,
            JobKind::ClipBatch,
            JobKind::Compose,
        ] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_delayed_job_is_not_immediately_available() {
        let job = JobRecord::new(
            "dev:default".into(),
            JobKind::Analyze,
            None,
            serde_json::json!({}),
            3600,
        )
        .with_delay(std::time::Duration::from_secs(30));
        assert!(job.available_at > Utc::now() + chrono::Duration::seconds(20));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Canceling.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }
}
