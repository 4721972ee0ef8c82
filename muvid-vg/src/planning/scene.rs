//! Scene and prompt planning
//!
//! Maps section and song-level analysis onto a visual plan: palette,
//! camera motion, shot pattern, and the assembled generation prompt.
//! All mappings are static tables; the same analysis always yields the
//! same prompt.

use crate::models::{MoodVector, Section, SectionKind, SongAnalysis};
use serde::{Deserialize, Serialize};

/// Color palette driving the prompt's look
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorPalette {
    pub name: String,
    pub primary: String,
    pub secondary: String,
    pub accent: String,
}

/// Camera motion preset scaled by tempo
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraMotion {
    pub kind: String,
    /// Motion intensity in [0, 1]
    pub intensity: f64,
    /// Relative speed multiplier (1.0 = neutral)
    pub speed: f64,
}

/// Framing, pacing and transition treatment per section type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShotPattern {
    pub framing: String,
    pub pacing: String,
    pub transition: String,
}

/// Complete visual plan for one section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenePlan {
    pub prompt: String,
    pub palette: ColorPalette,
    pub camera: CameraMotion,
    pub shots: ShotPattern,
    /// Overall visual intensity in [0, 1]
    pub intensity: f64,
    pub target_duration_sec: f64,
    pub reference_image_url: Option<String>,
}

fn palette(name: &str, primary: &str, secondary: &str, accent: &str) -> ColorPalette {
    ColorPalette {
        name: name.to_string(),
        primary: primary.to_string(),
        secondary: secondary.to_string(),
        accent: accent.to_string(),
    }
}

/// Mood vector to palette
pub fn mood_palette(mood: Option<&MoodVector>) -> ColorPalette {
    let Some(mood) = mood else {
        return palette("neutral", "#8a8a8a", "#c0c0c0", "#e8e8e8");
    };

    let energetic = mood.energy >= 0.6;
    let high_valence = mood.valence >= 0.55;

    if mood.tension >= 0.65 {
        palette("high_contrast", "#0d0d0d", "#f2f2f2", "#ff2d2d")
    } else if energetic && high_valence {
        palette("vibrant", "#ff4d6d", "#ffd166", "#06d6a0")
    } else if energetic {
        palette("intense", "#d00000", "#370617", "#faa307")
    } else if mood.valence < 0.4 {
        palette("muted", "#6b705c", "#a5a58d", "#b7b7a4")
    } else {
        palette("soft_blues", "#4a6fa5", "#9bc1e0", "#dbe9f4")
    }
}

/// Genre to camera preset, scaled by tempo
pub fn genre_camera(genre: Option<&str>, bpm: Option<f64>) -> CameraMotion {
    let (kind, intensity) = match genre {
        Some("electronic") => ("fast_zoom", 0.85),
        Some("hip-hop") => ("quick_cuts", 0.75),
        Some("rock") => ("handheld_shake", 0.7),
        Some("pop") => ("smooth_orbit", 0.55),
        Some("ambient") | Some("classical") => ("slow_pan", 0.3),
        _ => ("slow_pan", 0.4),
    };

    let speed = (bpm.unwrap_or(120.0) / 120.0).clamp(0.5, 2.0);

    CameraMotion {
        kind: kind.to_string(),
        intensity,
        speed,
    }
}

/// Section type to shot pattern
pub fn section_shot_pattern(kind: SectionKind) -> ShotPattern {
    let (framing, pacing, transition) = match kind {
        SectionKind::Intro => ("wide", "slow", "fade_in"),
        SectionKind::Verse => ("medium", "moderate", "cut"),
        SectionKind::Chorus => ("close_to_wide", "fast", "cut"),
        SectionKind::Bridge => ("medium", "moderate", "crossfade"),
        SectionKind::Drop => ("close", "very_fast", "hard_cut"),
        SectionKind::Breakdown => ("wide", "slow", "crossfade"),
        SectionKind::Outro => ("wide", "slow", "fade_out"),
        SectionKind::Unknown => ("medium", "moderate", "cut"),
    };

    ShotPattern {
        framing: framing.to_string(),
        pacing: pacing.to_string(),
        transition: transition.to_string(),
    }
}

/// BPM to tempo descriptor
pub fn tempo_descriptor(bpm: Option<f64>) -> &'static str {
    match bpm {
        Some(bpm) if bpm >= 160.0 => "frenetic, rapid",
        Some(bpm) if bpm >= 130.0 => "energetic, driving",
        Some(bpm) if bpm >= 100.0 => "steady, moderate",
        Some(_) => "slow, flowing",
        None => "free-form",
    }
}

/// Rhythmic-motion phrase derived from BPM
fn rhythm_phrase(bpm: Option<f64>) -> String {
    match bpm {
        Some(bpm) if bpm >= 160.0 => {
            format!("visuals strobing in rapid sync with the {bpm:.0} BPM pulse")
        }
        Some(bpm) if bpm >= 130.0 => {
            format!("movement driving hard on the {bpm:.0} BPM beat")
        }
        Some(bpm) if bpm >= 100.0 => {
            format!("motion locked to a steady {bpm:.0} BPM groove")
        }
        Some(bpm) => format!("slow drifting movement breathing at {bpm:.0} BPM"),
        None => "unhurried ambient drift".to_string(),
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "that", "this", "with", "from", "your", "what", "when", "where", "have", "been",
    "will", "just", "like", "dont", "cant", "wont", "them", "they", "were", "youre", "gonna",
];

/// Up to three distinctive keywords from aligned lyric text
fn lyric_keywords(lyrics: Option<&str>) -> Vec<String> {
    let Some(lyrics) = lyrics else {
        return Vec::new();
    };

    let mut seen = Vec::new();
    for raw in lyrics.split_whitespace() {
        let word: String = raw
            .chars()
            .filter(|c| c.is_alphabetic())
            .collect::<String>()
            .to_lowercase();
        if word.len() <= 3 || STOPWORDS.contains(&word.as_str()) || seen.contains(&word) {
            continue;
        }
        seen.push(word);
        if seen.len() == 3 {
            break;
        }
    }
    seen
}

/// Mood descriptors for the prompt; at least one when a mood exists
fn mood_descriptors(mood: Option<&MoodVector>, tags: &[String]) -> String {
    if !tags.is_empty() {
        return tags.join(", ");
    }
    match mood {
        Some(m) if m.energy >= 0.6 => "energetic".to_string(),
        Some(m) if m.valence < 0.4 => "melancholic".to_string(),
        Some(_) => "calm".to_string(),
        None => "atmospheric".to_string(),
    }
}

fn section_context(kind: SectionKind) -> &'static str {
    match kind {
        SectionKind::Intro => "opening scene establishing the world",
        SectionKind::Verse => "narrative scene carrying the story forward",
        SectionKind::Chorus => "peak moment with full visual payoff",
        SectionKind::Bridge => "transitional scene shifting the perspective",
        SectionKind::Drop => "explosive climax scene",
        SectionKind::Breakdown => "stripped-back suspended moment",
        SectionKind::Outro => "closing scene winding down",
        SectionKind::Unknown => "scene",
    }
}

/// Intensity weighting per section type, blended with mood energy
fn section_intensity(kind: SectionKind, mood: Option<&MoodVector>) -> f64 {
    let base = match kind {
        SectionKind::Drop => 1.0,
        SectionKind::Chorus => 0.85,
        SectionKind::Bridge => 0.6,
        SectionKind::Verse => 0.55,
        SectionKind::Breakdown => 0.4,
        SectionKind::Intro | SectionKind::Outro => 0.35,
        SectionKind::Unknown => 0.5,
    };
    let energy = mood.map(|m| m.energy).unwrap_or(0.5);
    (0.5 * base + 0.5 * energy).clamp(0.0, 1.0)
}

/// Build the visual plan for one section
pub fn plan_scene(
    section: &Section,
    analysis: &SongAnalysis,
    base_style: &str,
    target_duration_sec: f64,
    reference_image_url: Option<String>,
) -> ScenePlan {
    let mood = analysis.mood.as_ref();
    let palette = mood_palette(mood);
    let camera = genre_camera(analysis.genre.as_deref(), analysis.bpm);
    let shots = section_shot_pattern(section.kind);
    let intensity = section_intensity(section.kind, mood);

    let mut parts: Vec<String> = Vec::new();
    parts.push(format!("{base_style} music video scene"));
    parts.push(section_context(section.kind).to_string());
    parts.push(format!(
        "{} framing with {} pacing",
        shots.framing, shots.pacing
    ));
    parts.push(format!(
        "{} camera motion at {:.1}x speed",
        camera.kind, camera.speed
    ));
    parts.push(format!(
        "color palette of {}, {} and {}",
        palette.primary, palette.secondary, palette.accent
    ));
    parts.push(format!(
        "{} mood",
        mood_descriptors(mood, &analysis.mood_tags)
    ));
    if let Some(genre) = analysis.genre.as_deref() {
        parts.push(format!("{genre} aesthetic"));
    }
    let keywords = lyric_keywords(section.lyrics.as_deref());
    if !keywords.is_empty() {
        parts.push(format!("imagery of {}", keywords.join(", ")));
    }
    parts.push(format!(
        "{} tempo feel",
        tempo_descriptor(analysis.bpm)
    ));
    parts.push(rhythm_phrase(analysis.bpm));

    ScenePlan {
        prompt: parts.join(", "),
        palette,
        camera,
        shots,
        intensity,
        target_duration_sec,
        reference_image_url,
    }
}
