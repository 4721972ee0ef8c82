//! Song record and lifecycle states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Requested video class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoType {
    FullLength,
    ShortForm,
}

impl VideoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoType::FullLength => "full_length",
            VideoType::ShortForm => "short_form",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full_length" => Some(VideoType::FullLength),
            "short_form" => Some(VideoType::ShortForm),
            _ => None,
        }
    }
}

/// Analysis lifecycle state for a song
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisState {
    Idle,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl AnalysisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisState::Idle => "idle",
            AnalysisState::Queued => "queued",
            AnalysisState::Processing => "processing",
            AnalysisState::Completed => "completed",
            AnalysisState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(AnalysisState::Idle),
            "queued" => Some(AnalysisState::Queued),
            "processing" => Some(AnalysisState::Processing),
            "completed" => Some(AnalysisState::Completed),
            "failed" => Some(AnalysisState::Failed),
            _ => None,
        }
    }
}

/// An uploaded track and its creative inputs
///
/// `duration_sec` is set once decoding establishes it and is immutable
/// thereafter. `video_type` becomes immutable once any analysis record
/// exists for the song (enforced at the API layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub id: Uuid,
    /// Blob key of the uploaded source audio
    pub source_blob_key: String,
    /// Original upload filename, for UI display
    pub original_filename: Option<String>,
    /// SHA-256 of the source bytes, for duplicate detection
    pub content_hash: Option<String>,
    pub duration_sec: Option<f64>,
    pub video_type: Option<VideoType>,
    /// Short-form selection window start (seconds)
    pub selection_start_sec: Option<f64>,
    /// Short-form selection window end (seconds)
    pub selection_end_sec: Option<f64>,
    /// Blob key of the optional character reference image
    pub character_image_key: Option<String>,
    pub analysis_state: AnalysisState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Song {
    pub fn new(source_blob_key: String, original_filename: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_blob_key,
            original_filename,
            content_hash: None,
            duration_sec: None,
            video_type: None,
            selection_start_sec: None,
            selection_end_sec: None,
            character_image_key: None,
            analysis_state: AnalysisState::Idle,
            created_at: now,
            updated_at: now,
        }
    }

    /// User-selected segment, when both bounds are set
    pub fn selection(&self) -> Option<(f64, f64)> {
        match (self.selection_start_sec, self.selection_end_sec) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }

    /// The window that planning and composition operate on: the user
    /// selection for short-form, the whole song otherwise.
    pub fn effective_window(&self) -> Option<(f64, f64)> {
        match self.video_type {
            Some(VideoType::ShortForm) => self.selection(),
            _ => self.duration_sec.map(|d| (0.0, d)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_window_prefers_selection_for_short_form() {
        let mut song = Song::new("songs/x/source.mp3".to_string(), None);
        song.duration_sec = Some(180.0);
        assert_eq!(song.effective_window(), Some((0.0, 180.0)));

        song.video_type = Some(VideoType::ShortForm);
        assert_eq!(song.effective_window(), None); // no selection yet

        song.selection_start_sec = Some(40.0);
        song.selection_end_sec = Some(70.0);
        assert_eq!(song.effective_window(), Some((40.0, 70.0)));
    }

    #[test]
    fn test_video_type_round_trip() {
        assert_eq!(VideoType::parse("short_form"), Some(VideoType::ShortForm));
        assert_eq!(VideoType::parse("full_length"), Some(VideoType::FullLength));
        assert_eq!(VideoType::parse("bogus"), None);
        assert_eq!(VideoType::ShortForm.as_str(), "short_form");
    }
}
