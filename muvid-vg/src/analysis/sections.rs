//! Musical section inference
//!
//! Primary path: an external structure service, when configured.
//! Fallback: an internal segmenter that clusters chroma features with
//! agglomerative merging down to a duration-derived boundary count.
//! Either path is post-processed to enforce a minimum section duration
//! by merging undersized sections into the shorter adjacent neighbor.

use crate::config::ServiceEndpoint;
use crate::models::{Section, SectionKind};
use anyhow::Result;
use serde::Deserialize;
use thiserror::Error;

use super::spectral::SpectralFrames;

/// Block length the internal segmenter averages chroma over (seconds)
const BLOCK_SEC: f64 = 2.0;

/// Structure service failure modes
#[derive(Debug, Error)]
pub enum StructureError {
    /// Network, 5xx, timeout: worth retrying before falling back
    #[error("structure service transient failure: {0}")]
    Transient(String),

    /// 4xx or malformed response: fall back immediately
    #[error("structure service rejected request: {0}")]
    Permanent(String),
}

/// External structure service client
pub struct StructureClient {
    http: reqwest::Client,
    endpoint: ServiceEndpoint,
}

#[derive(Debug, Deserialize)]
struct StructureResponse {
    sections: Vec<StructureSection>,
}

#[derive(Debug, Deserialize)]
struct StructureSection {
    start_sec: f64,
    end_sec: f64,
    label: String,
    #[serde(default)]
    confidence: Option<f64>,
}

impl StructureClient {
    pub fn new(endpoint: ServiceEndpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("muvid/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self { http, endpoint })
    }

    /// Ask the service to segment the track behind the given read URL
    pub async fn infer(
        &self,
        audio_url: &str,
        duration_sec: f64,
    ) -> std::result::Result<Vec<Section>, StructureError> {
        let mut request = self
            .http
            .post(format!("{}/v1/structure", self.endpoint.base_url))
            .json(&serde_json::json!({
                "audio_url": audio_url,
                "duration_sec": duration_sec,
            }));
        if let Some(token) = &self.endpoint.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StructureError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(StructureError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(StructureError::Permanent(format!("HTTP {status}")));
        }

        let body: StructureResponse = response
            .json()
            .await
            .map_err(|e| StructureError::Permanent(format!("malformed response: {e}")))?;

        let sections = body
            .sections
            .into_iter()
            .map(|s| Section {
                start_sec: s.start_sec,
                end_sec: s.end_sec,
                kind: SectionKind::parse(&s.label),
                confidence: s.confidence.unwrap_or(0.8).clamp(0.0, 1.0),
                label: Some(s.label),
                lyrics: None,
            })
            .collect();

        Ok(sections)
    }
}

/// Internal segmenter over chroma features
///
/// Starts from fixed blocks, then agglomeratively merges the most
/// similar adjacent pair until the duration-derived target count is
/// reached.
pub fn internal_segment(frames: &SpectralFrames, duration_sec: f64) -> Vec<Section> {
    let target = target_section_count(duration_sec);
    let chroma = block_chroma(frames);
    let energy = block_energy(frames);

    if chroma.is_empty() {
        return vec![Section {
            start_sec: 0.0,
            end_sec: duration_sec,
            kind: SectionKind::Unknown,
            confidence: 0.3,
            label: None,
            lyrics: None,
        }];
    }

    // One segment per block, each holding [start_block, end_block)
    let mut segments: Vec<(usize, usize)> = (0..chroma.len()).map(|i| (i, i + 1)).collect();

    while segments.len() > target {
        // Merge the most chroma-similar adjacent pair
        let mut best = 0usize;
        let mut best_sim = f64::NEG_INFINITY;
        for i in 0..segments.len() - 1 {
            let a = mean_chroma(&chroma, segments[i]);
            let b = mean_chroma(&chroma, segments[i + 1]);
            let sim = cosine(&a, &b);
            if sim > best_sim {
                best_sim = sim;
                best = i;
            }
        }
        let (_, end) = segments.remove(best + 1);
        segments[best].1 = end;
    }

    let blocks_total = chroma.len() as f64;
    let mut sections: Vec<Section> = segments
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| {
            // Distinctness from neighbors doubles as confidence
            let own = mean_chroma(&chroma, (start, end));
            let mut max_neighbor_sim = 0.0f64;
            if i > 0 {
                max_neighbor_sim =
                    max_neighbor_sim.max(cosine(&own, &mean_chroma(&chroma, segments[i - 1])));
            }
            if i + 1 < segments.len() {
                max_neighbor_sim =
                    max_neighbor_sim.max(cosine(&own, &mean_chroma(&chroma, segments[i + 1])));
            }
            Section {
                start_sec: start as f64 / blocks_total * duration_sec,
                end_sec: end as f64 / blocks_total * duration_sec,
                kind: SectionKind::Unknown,
                confidence: (1.0 - max_neighbor_sim).clamp(0.3, 0.95),
                label: None,
                lyrics: None,
            }
        })
        .collect();

    classify_sections(&mut sections, &energy, blocks_total, duration_sec);
    sections
}

/// Boundary count heuristic: roughly one section per half minute,
/// bounded to something musically plausible
fn target_section_count(duration_sec: f64) -> usize {
    ((duration_sec / 30.0).round() as usize).clamp(2, 8)
}

/// Merge sections shorter than `min_section_sec` into the shorter
/// adjacent neighbor
pub fn merge_short_sections(mut sections: Vec<Section>, min_section_sec: f64) -> Vec<Section> {
    loop {
        if sections.len() <= 1 {
            return sections;
        }
        let Some(idx) = sections
            .iter()
            .position(|s| s.duration_sec() < min_section_sec)
        else {
            return sections;
        };

        // Pick the shorter adjacent neighbor to absorb the runt
        let merge_left = if idx == 0 {
            false
        } else if idx == sections.len() - 1 {
            true
        } else {
            sections[idx - 1].duration_sec() <= sections[idx + 1].duration_sec()
        };

        if merge_left {
            let runt = sections.remove(idx);
            sections[idx - 1].end_sec = runt.end_sec;
        } else {
            let runt = sections.remove(idx);
            sections[idx].start_sec = runt.start_sec;
        }
    }
}

/// Heuristic type assignment from position and energy
fn classify_sections(
    sections: &mut [Section],
    block_energy: &[f32],
    blocks_total: f64,
    duration_sec: f64,
) {
    if sections.is_empty() {
        return;
    }

    let energy_of = |s: &Section| -> f32 {
        let start = ((s.start_sec / duration_sec) * blocks_total) as usize;
        let end = (((s.end_sec / duration_sec) * blocks_total) as usize).max(start + 1);
        let slice = &block_energy[start.min(block_energy.len().saturating_sub(1))
            ..end.min(block_energy.len())];
        if slice.is_empty() {
            0.0
        } else {
            slice.iter().sum::<f32>() / slice.len() as f32
        }
    };

    let energies: Vec<f32> = sections.iter().map(|s| energy_of(s)).collect();
    let max_energy = energies.iter().cloned().fold(f32::MIN, f32::max);
    let last = sections.len() - 1;

    for (i, section) in sections.iter_mut().enumerate() {
        section.kind = if i == 0 {
            SectionKind::Intro
        } else if i == last && last > 0 {
            SectionKind::Outro
        } else if energies[i] >= max_energy * 0.95 {
            SectionKind::Chorus
        } else if energies[i] <= max_energy * 0.4 {
            SectionKind::Breakdown
        } else {
            SectionKind::Verse
        };
    }
}

/// Clamp, sort and stretch sections so they exactly cover [0, duration]
pub fn normalize_coverage(mut sections: Vec<Section>, duration_sec: f64) -> Vec<Section> {
    sections.retain(|s| s.end_sec > s.start_sec);
    sections.sort_by(|a, b| a.start_sec.partial_cmp(&b.start_sec).unwrap());

    if sections.is_empty() {
        return vec![Section {
            start_sec: 0.0,
            end_sec: duration_sec,
            kind: SectionKind::Unknown,
            confidence: 0.3,
            label: None,
            lyrics: None,
        }];
    }

    sections.first_mut().unwrap().start_sec = 0.0;
    sections.last_mut().unwrap().end_sec = duration_sec;
    for i in 1..sections.len() {
        let boundary = sections[i].start_sec.max(sections[i - 1].start_sec);
        sections[i - 1].end_sec = boundary;
        sections[i].start_sec = boundary;
    }

    sections
}

/// 12-bin chroma averaged over fixed blocks
fn block_chroma(frames: &SpectralFrames) -> Vec<[f64; 12]> {
    let frames_per_block =
        ((BLOCK_SEC * frames.sample_rate as f64) / frames.hop_size as f64).max(1.0) as usize;

    let mut blocks = Vec::new();
    for chunk in frames.magnitudes.chunks(frames_per_block) {
        if chunk.len() < frames_per_block / 2 {
            break;
        }
        let mut chroma = [0.0f64; 12];
        for frame in chunk {
            for (bin, &magnitude) in frame.iter().enumerate() {
                let freq = frames.bin_frequency(bin);
                if !(55.0..=4000.0).contains(&freq) {
                    continue;
                }
                let midi = 69.0 + 12.0 * (freq / 440.0).log2();
                let pc = (midi.round() as i64).rem_euclid(12) as usize;
                chroma[pc] += magnitude as f64;
            }
        }
        blocks.push(chroma);
    }
    blocks
}

/// Mean magnitude per block (coarse energy)
fn block_energy(frames: &SpectralFrames) -> Vec<f32> {
    let frames_per_block =
        ((BLOCK_SEC * frames.sample_rate as f64) / frames.hop_size as f64).max(1.0) as usize;

    frames
        .magnitudes
        .chunks(frames_per_block)
        .map(|chunk| {
            let total: f32 = chunk.iter().flat_map(|f| f.iter()).sum();
            let count = chunk.iter().map(|f| f.len()).sum::<usize>().max(1);
            total / count as f32
        })
        .collect()
}

fn mean_chroma(chroma: &[[f64; 12]], range: (usize, usize)) -> [f64; 12] {
    let mut mean = [0.0f64; 12];
    let slice = &chroma[range.0..range.1.min(chroma.len())];
    if slice.is_empty() {
        return mean;
    }
    for block in slice {
        for (i, &v) in block.iter().enumerate() {
            mean[i] += v;
        }
    }
    for v in &mut mean {
        *v /= slice.len() as f64;
    }
    mean
}

fn cosine(a: &[f64; 12], b: &[f64; 12]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::spectral::magnitude_frames;

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
    fn test_merge_short_sections_into_shorter_neighbor() {
        let sections = vec![section(0.0, 20.0), section(20.0, 23.0), section(23.0, 33.0)];
        let merged = merge_short_sections(sections, 8.0);

        assert_eq!(merged.len(), 2);
        // The runt joined the shorter right neighbor
        assert_eq!(merged[1].start_sec, 20.0);
        assert_eq!(merged[1].end_sec, 33.0);
    }

    #[test]
    fn test_merge_handles_edge_runts() {
        let sections = vec![section(0.0, 2.0), section(2.0, 30.0), section(30.0, 32.0)];
        let merged = merge_short_sections(sections, 8.0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start_sec, 0.0);
        assert_eq!(merged[0].end_sec, 32.0);
    }

    #[test]
    fn test_normalize_coverage_stretches_to_bounds() {
        let sections = vec![section(0.5, 10.0), section(10.5, 29.0)];
        let normalized = normalize_coverage(sections, 30.0);
        assert_eq!(normalized[0].start_sec, 0.0);
        assert_eq!(normalized.last().unwrap().end_sec, 30.0);
        for pair in normalized.windows(2) {
            assert_eq!(pair[0].end_sec, pair[1].start_sec);
        }
    }

    #[test]
    fn test_target_count_heuristic() {
        assert_eq!(target_section_count(30.0), 2);
        assert_eq!(target_section_count(180.0), 6);
        assert_eq!(target_section_count(600.0), 8);
    }

    #[test]
    fn test_internal_segmenter_finds_contrasting_halves() {
        let rate = 22_050;
        // 20 s of A4 then 20 s of D5: distinct pitch classes, so chroma
        // sees two clear sections (octave-related pitches would fold onto
        // the same class and hide the boundary)
        let mut samples: Vec<f32> = (0..rate as usize * 20)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / rate as f32).sin())
            .collect();
        samples.extend(
            (0..rate as usize * 20)
                .map(|i| (i as f32 * 587.33 * 2.0 * std::f32::consts::PI / rate as f32).sin()),
        );

        let frames = magnitude_frames(&samples, rate).unwrap();
        let sections = internal_segment(&frames, 40.0);

        assert!(sections.len() >= 2);
        // A boundary near the 20 s midpoint
        assert!(
            sections
                .iter()
                .any(|s| (s.start_sec - 20.0).abs() < 4.0 || (s.end_sec - 20.0).abs() < 4.0),
            "sections: {sections:?}"
        );
    }

    #[test]
    fn test_first_and_last_sections_classified_as_bookends() {
        let rate = 22_050;
        let samples: Vec<f32> = (0..rate as usize * 90)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / rate as f32).sin())
            .collect();
        let frames = magnitude_frames(&samples, rate).unwrap();
        let sections = internal_segment(&frames, 90.0);

        assert_eq!(sections.first().unwrap().kind, SectionKind::Intro);
        assert_eq!(sections.last().unwrap().kind, SectionKind::Outro);
    }
}
