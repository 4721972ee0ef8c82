//! Event types for the muvid event system
//!
//! Provides shared event definitions and EventBus for all muvid modules.
//! Events are broadcast in-process and forwarded to connected UIs over SSE;
//! the record store remains the authoritative source for job progress, so
//! every event here is a lossy notification, never a source of truth.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// muvid event types
///
/// Events are broadcast via EventBus and can be serialized for SSE
/// transmission. All events carry the song they belong to (where one
/// exists) so UI clients can filter without extra lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MuvidEvent {
    /// Audio analysis job started processing
    AnalysisStarted {
        song_id: Uuid,
        job_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Audio analysis milestone reached
    ///
    /// Percent is monotonic non-decreasing per job: beat detection 25,
    /// sections 50, mood/genre 70, lyrics 85, complete 100.
    AnalysisProgress {
        song_id: Uuid,
        job_id: Uuid,
        /// Percent complete (0-100)
        percent: f64,
        /// Human-readable stage description
        stage: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Audio analysis finished and a SongAnalysis record was written
    AnalysisCompleted {
        song_id: Uuid,
        job_id: Uuid,
        /// Detected tempo, if the track had a stable one
        bpm: Option<f64>,
        section_count: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Audio analysis failed terminally
    AnalysisFailed {
        song_id: Uuid,
        job_id: Uuid,
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The clip plan for a song was regenerated
    ClipPlanReplaced {
        song_id: Uuid,
        clip_count: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A clip moved between generation states
    ///
    /// Status is the serialized ClipStatus tag (queued, processing,
    /// completed, failed, canceled).
    ClipStatusChanged {
        song_id: Uuid,
        clip_id: Uuid,
        plan_index: i64,
        status: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Aggregate progress of a batch clip-generation job
    ClipBatchProgress {
        song_id: Uuid,
        job_id: Uuid,
        completed: usize,
        failed: usize,
        total: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Composition pipeline step transition or progress update
    CompositionProgress {
        song_id: Uuid,
        job_id: Uuid,
        /// Current pipeline state tag (validating, downloading, ...)
        state: String,
        /// Percent complete (0-100)
        percent: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Composition produced a ComposedVideo artifact
    CompositionCompleted {
        song_id: Uuid,
        job_id: Uuid,
        composed_video_id: Uuid,
        duration_sec: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Composition failed terminally
    CompositionFailed {
        song_id: Uuid,
        job_id: Uuid,
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A job was canceled at a checkpoint
    JobCanceled {
        job_id: Uuid,
        kind: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl MuvidEvent {
    /// SSE event name for this event (the serde tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            MuvidEvent::AnalysisStarted { .. } => "AnalysisStarted",
            MuvidEvent::AnalysisProgress { .. } => "AnalysisProgress",
            MuvidEvent::AnalysisCompleted { .. } => "AnalysisCompleted",
            MuvidEvent::AnalysisFailed { .. } => "AnalysisFailed",
            MuvidEvent::ClipPlanReplaced { .. } => "ClipPlanReplaced",
            MuvidEvent::ClipStatusChanged { .. } => "ClipStatusChanged",
            MuvidEvent::ClipBatchProgress { .. } => "ClipBatchProgress",
            MuvidEvent::CompositionProgress { .. } => "CompositionProgress",
            MuvidEvent::CompositionCompleted { .. } => "CompositionCompleted",
            MuvidEvent::CompositionFailed { .. } => "CompositionFailed",
            MuvidEvent::JobCanceled { .. } => "JobCanceled",
        }
    }

    /// Song this event belongs to, if any
    pub fn song_id(&self) -> Option<Uuid> {
        match self {
            MuvidEvent::AnalysisStarted { song_id, .. }
            | MuvidEvent::AnalysisProgress { song_id, .. }
            | MuvidEvent::AnalysisCompleted { song_id, .. }
            | MuvidEvent::AnalysisFailed { song_id, .. }
            | MuvidEvent::ClipPlanReplaced { song_id, .. }
            | MuvidEvent::ClipStatusChanged { song_id, .. }
            | MuvidEvent::ClipBatchProgress { song_id, .. }
            | MuvidEvent::CompositionProgress { song_id, .. }
            | MuvidEvent::CompositionCompleted { song_id, .. }
            | MuvidEvent::CompositionFailed { song_id, .. } => Some(*song_id),
            MuvidEvent::JobCanceled { .. } => None,
        }
    }
}

/// Broadcast event bus shared across the service
///
/// Wraps a tokio broadcast channel. Subscribers that lag beyond the
/// configured capacity lose the oldest events; progress consumers must
/// treat the record store as authoritative.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MuvidEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<MuvidEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns the subscriber count, or an error when nobody listens.
    pub fn emit(&self, event: MuvidEvent) -> Result<usize, broadcast::error::SendError<MuvidEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscribers case
    ///
    /// Progress events are advisory; a service with no connected UI
    /// clients is not an error condition.
    pub fn emit_lossy(&self, event: MuvidEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::trace!(event = ?e.0.event_type(), "No subscribers for event");
        }
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
