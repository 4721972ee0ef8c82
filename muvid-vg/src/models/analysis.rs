//! Song analysis record: beat grid, sections, mood, genre, lyrics,
//! waveform summary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Musical section classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Intro,
    Verse,
    Chorus,
    Bridge,
    Drop,
    Breakdown,
    Outro,
    Unknown,
}

impl SectionKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "intro" => SectionKind::Intro,
            "verse" => SectionKind::Verse,
            "chorus" => SectionKind::Chorus,
            "bridge" => SectionKind::Bridge,
            "drop" => SectionKind::Drop,
            "breakdown" => SectionKind::Breakdown,
            "outro" => SectionKind::Outro,
            _ => SectionKind::Unknown,
        }
    }
}

/// One contiguous musical section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub start_sec: f64,
    pub end_sec: f64,
    pub kind: SectionKind,
    /// Classifier confidence in [0, 1]
    pub confidence: f64,
    /// Optional human-readable label from the structure service
    pub label: Option<String>,
    /// Lyric text aligned to this section, when transcription ran
    pub lyrics: Option<String>,
}

impl Section {
    pub fn duration_sec(&self) -> f64 {
        self.end_sec - self.start_sec
    }

    /// Whether the given time falls inside this section
    pub fn contains(&self, time_sec: f64) -> bool {
        time_sec >= self.start_sec && time_sec < self.end_sec
    }
}

/// Mood vector; all components in [0, 1]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MoodVector {
    pub energy: f64,
    pub valence: f64,
    pub danceability: f64,
    pub tension: f64,
}

/// Complete analysis for a song; one logical record per song, latest
/// version wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongAnalysis {
    pub id: Uuid,
    pub song_id: Uuid,
    /// Monotonically increasing per song; re-analysis supersedes
    pub version: i64,
    /// Detected tempo; None when no stable tempo was found
    pub bpm: Option<f64>,
    /// Strictly increasing beat onset times in seconds
    pub beat_times: Vec<f64>,
    /// Contiguous, non-overlapping sections covering [0, duration]
    pub sections: Vec<Section>,
    pub mood: Option<MoodVector>,
    /// Non-empty whenever mood computation succeeded
    pub mood_tags: Vec<String>,
    pub genre: Option<String>,
    /// Max-amplitude envelope, 512-2048 buckets normalized to [0, 1]
    pub waveform: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl SongAnalysis {
    pub fn new(song_id: Uuid, version: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            song_id,
            version,
            bpm: None,
            beat_times: Vec::new(),
            sections: Vec::new(),
            mood: None,
            mood_tags: Vec::new(),
            genre: None,
            waveform: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// The section containing the given time, if any
    pub fn section_at(&self, time_sec: f64) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(time_sec))
    }

    /// Validate structural invariants against the song duration.
    ///
    /// beat_times strictly increasing within [0, duration]; sections
    /// contiguous and covering [0, duration] within tolerance.
    pub fn validate(&self, duration_sec: f64) -> Result<(), String> {
        const EPS: f64 = 0.05;

        for pair in self.beat_times.windows(2) {
            if pair[1] <= pair[0] {
                return Err(format!(
                    "beat_times not strictly increasing at {:.3} -> {:.3}",
                    pair[0], pair[1]
                ));
            }
        }
        if let Some(&first) = self.beat_times.first() {
            if first < -EPS {
                return Err(format!("beat time {first:.3} before song start"));
            }
        }
        if let Some(&last) = self.beat_times.last() {
            if last > duration_sec + EPS {
                return Err(format!(
                    "beat time {last:.3} past song end {duration_sec:.3}"
                ));
            }
        }

        if !self.sections.is_empty() {
            if self.sections[0].start_sec.abs() > EPS {
                return Err("first section does not start at 0".to_string());
            }
            for pair in self.sections.windows(2) {
                if (pair[1].start_sec - pair[0].end_sec).abs() > EPS {
                    return Err(format!(
                        "gap or overlap between sections at {:.3}",
                        pair[0].end_sec
                    ));
                }
            }
            let cover: f64 = self.sections.iter().map(Section::duration_sec).sum();
            if (cover - duration_sec).abs() > EPS * self.sections.len() as f64 + EPS {
                return Err(format!(
                    "sections cover {cover:.3}s of {duration_sec:.3}s"
                ));
            }
        }

        for section in &self.sections {
            if !(0.0..=1.0).contains(&section.confidence) {
                return Err(format!(
                    "section confidence {} outside [0, 1]",
                    section.confidence
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis_with(beats: Vec<f64>, sections: Vec<Section>) -> SongAnalysis {
        let mut analysis = SongAnalysis::new(Uuid::new_v4(), 1);
        analysis.beat_times = beats;
        analysis.sections = sections;
        analysis
    }

    fn section(start: f64, end: f64) -> Section {
        Section {
            start_sec: start,
            end_sec: end,
            kind: SectionKind::Verse,
            confidence: 0.7,
            label: None,
            lyrics: None,
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_analysis() {
        let analysis = analysis_with(
            vec![0.5, 1.0, 1.5, 2.0],
            vec![section(0.0, 5.0), section(5.0, 10.0)],
        );
        assert!(analysis.validate(10.0).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_increasing_beats() {
        let analysis = analysis_with(vec![0.5, 0.5], vec![]);
        assert!(analysis.validate(10.0).is_err());
    }

    #[test]
    fn test_validate_rejects_section_gap() {
        let analysis = analysis_with(vec![], vec![section(0.0, 4.0), section(5.0, 10.0)]);
        assert!(analysis.validate(10.0).is_err());
    }

    #[test]
    fn test_section_at_finds_containing_section() {
        let analysis = analysis_with(vec![], vec![section(0.0, 5.0), section(5.0, 10.0)]);
        assert_eq!(analysis.section_at(6.0).unwrap().start_sec, 5.0);
        assert!(analysis.section_at(11.0).is_none());
    }
}
