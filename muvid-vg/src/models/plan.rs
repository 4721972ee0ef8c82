//! Clip plan entries: planned beat-aligned boundaries before any video
//! exists

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One planned clip window within a song's selection
///
/// Entries for a song are disjoint, ordered by `plan_index`, and contained
/// in the effective window. `frame_count` equals
/// `round(duration_sec * target_fps)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub id: Uuid,
    pub song_id: Uuid,
    pub plan_index: i64,
    pub start_sec: f64,
    pub end_sec: f64,
    /// Frame count at the plan's target fps
    pub frame_count: i64,
    pub target_fps: i64,
    /// Indices into the analysis beat grid spanned by this entry
    pub beat_indices: Vec<usize>,
    pub created_at: DateTime<Utc>,
}

impl PlanEntry {
    pub fn duration_sec(&self) -> f64 {
        self.end_sec - self.start_sec
    }

    /// Whether another entry's bounds conflict with this one
    ///
    /// Used when replacing a plan: completed clips from a prior plan are
    /// only kept when their window matches the new entry at the same
    /// index within a frame.
    pub fn same_bounds(&self, other_start: f64, other_end: f64) -> bool {
        let tol = 1.0 / self.target_fps as f64;
        (self.start_sec - other_start).abs() < tol && (self.end_sec - other_end).abs() < tol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_bounds_within_frame_tolerance() {
        let entry = PlanEntry {
            id: Uuid::new_v4(),
            song_id: Uuid::new_v4(),
            plan_index: 0,
            start_sec: 40.0,
            end_sec: 45.0,
            frame_count: 120,
            target_fps: 24,
            beat_indices: vec![0, 1, 2],
            created_at: Utc::now(),
        };
        assert!(entry.same_bounds(40.01, 45.01));
        assert!(!entry.same_bounds(40.1, 45.0));
    }
}
