//! Mood vector, mood tags and primary genre
//!
//! Aggregates spectral and tempo features into the four-component mood
//! vector, derives at least one tag whenever the step runs, and applies
//! a small rule classifier for the primary genre (which may stay null).

use crate::models::MoodVector;

use super::beats::BeatDetection;
use super::spectral::SpectralFrames;

/// Mood and genre outcome
#[derive(Debug, Clone)]
pub struct MoodOutcome {
    pub mood: MoodVector,
    /// Never empty
    pub tags: Vec<String>,
    pub genre: Option<String>,
}

/// Compute mood and genre from samples, spectral frames and the beat grid
pub fn analyze_mood(
    samples: &[f32],
    frames: &SpectralFrames,
    beats: &BeatDetection,
) -> MoodOutcome {
    let rms = root_mean_square(samples);
    let centroids = frames.spectral_centroids();
    let centroid_mean = mean(&centroids);
    let nyquist = frames.sample_rate as f64 / 2.0;
    let brightness = (centroid_mean / nyquist * 4.0).clamp(0.0, 1.0);

    let flux = frames.spectral_flux();
    let flux_f64: Vec<f64> = flux.iter().map(|&f| f as f64).collect();
    let flux_cv = coefficient_of_variation(&flux_f64);

    let regularity = beat_regularity(&beats.beat_times);

    // Energy from overall level; typical mixes sit around 0.1-0.3 RMS
    let energy = (rms as f64 * 3.5).clamp(0.0, 1.0);

    // Tension rises with spectral churn and falls with regularity
    let tension = (flux_cv * 0.5 + (1.0 - regularity) * 0.5).clamp(0.0, 1.0);

    // Valence: bright, steady, energetic material reads as positive
    let valence = (brightness * 0.5 + energy * 0.3 + regularity * 0.4 - tension * 0.2)
        .clamp(0.0, 1.0);

    let tempo_factor = beats
        .bpm
        .map(|bpm| (bpm / 140.0).clamp(0.0, 1.0))
        .unwrap_or(0.2);
    let danceability = (regularity * 0.6 + tempo_factor * 0.4).clamp(0.0, 1.0);

    let mood = MoodVector {
        energy,
        valence,
        danceability,
        tension,
    };

    MoodOutcome {
        tags: mood_tags(&mood),
        genre: classify_genre(&mood, beats.bpm, brightness),
        mood,
    }
}

/// Threshold tags; the dominant dimension guarantees at least one
fn mood_tags(mood: &MoodVector) -> Vec<String> {
    let mut tags = Vec::new();

    if mood.energy >= 0.65 {
        tags.push("energetic");
    }
    if mood.energy < 0.35 {
        tags.push("calm");
    }
    if mood.valence >= 0.6 {
        tags.push("uplifting");
    }
    if mood.valence < 0.35 {
        tags.push("melancholic");
    }
    if mood.tension >= 0.6 {
        tags.push("tense");
    }
    if mood.danceability >= 0.65 {
        tags.push("danceable");
    }

    if tags.is_empty() {
        let dominant = [
            (mood.energy, "energetic"),
            (mood.valence, "uplifting"),
            (mood.danceability, "danceable"),
            (mood.tension, "tense"),
        ]
        .into_iter()
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, tag)| tag)
        .unwrap_or("calm");
        tags.push(dominant);
    }

    tags.into_iter().map(str::to_string).collect()
}

/// Rule classifier; returns None when nothing matches with confidence
fn classify_genre(mood: &MoodVector, bpm: Option<f64>, brightness: f64) -> Option<String> {
    let bpm = bpm?;

    let genre = if mood.energy < 0.3 && mood.danceability < 0.4 {
        "ambient"
    } else if (115.0..=150.0).contains(&bpm) && mood.danceability >= 0.6 && brightness >= 0.45 {
        "electronic"
    } else if (75.0..=105.0).contains(&bpm) && mood.danceability >= 0.55 && brightness < 0.45 {
        "hip-hop"
    } else if mood.energy >= 0.6 && mood.tension >= 0.45 {
        "rock"
    } else if mood.valence >= 0.5 && (95.0..=135.0).contains(&bpm) {
        "pop"
    } else {
        return None;
    };

    Some(genre.to_string())
}

fn root_mean_square(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m <= f64::EPSILON {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    (variance.sqrt() / m).clamp(0.0, 1.0)
}

/// 1 minus the normalized spread of inter-beat intervals
fn beat_regularity(beat_times: &[f64]) -> f64 {
    if beat_times.len() < 3 {
        return 0.0;
    }
    let intervals: Vec<f64> = beat_times.windows(2).map(|p| p[1] - p[0]).collect();
    let cv = coefficient_of_variation(&intervals);
    (1.0 - cv * 2.0).clamp(0.0, 1.0)
}
