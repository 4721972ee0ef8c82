//! Beat-aligned clip boundary computation
//!
//! Converts a beat grid and duration bounds into a sequence of clip
//! boundaries aligned to beats and video frames. Pure and deterministic;
//! the same grid and parameters always produce the same boundaries.

use serde::{Deserialize, Serialize};

/// Sub-frame tolerance for bound comparisons
const EPS: f64 = 1e-6;

/// Alignment error threshold separating `valid` from `warning` (seconds)
const WARNING_THRESHOLD_SEC: f64 = 0.050;

/// Parameters for boundary computation
#[derive(Debug, Clone)]
pub struct BeatAlignParams {
    pub min_clip_sec: f64,
    pub max_clip_sec: f64,
    pub target_fps: u32,
    /// Restrict planning to a `[start, end]` region of the song
    pub selection: Option<(f64, f64)>,
}

impl Default for BeatAlignParams {
    fn default() -> Self {
        Self {
            min_clip_sec: 3.0,
            max_clip_sec: 6.0,
            target_fps: 24,
            selection: None,
        }
    }
}

/// One aligned clip window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignedClip {
    pub index: usize,
    /// Frame-snapped start (seconds)
    pub start_sec: f64,
    /// Frame-snapped end (seconds)
    pub end_sec: f64,
    /// Beat grid index the start is anchored to, when it is
    pub start_beat: Option<usize>,
    /// Beat grid index the end is anchored to, when it is
    pub end_beat: Option<usize>,
    pub start_frame: i64,
    pub end_frame: i64,
    pub duration_sec: f64,
    /// Beats contained in (start, end]
    pub beats_in_clip: usize,
    /// Signed snap error of the start against its nominal beat (seconds)
    pub start_error_sec: Option<f64>,
    /// Signed snap error of the end against its nominal beat (seconds)
    pub end_error_sec: Option<f64>,
}

/// Overall validation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentStatus {
    Valid,
    Warning,
}

/// Boundary computation result with validation metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentResult {
    pub clips: Vec<AlignedClip>,
    /// Largest absolute endpoint error against a nominal beat (seconds)
    pub max_alignment_error: f64,
    /// Mean absolute endpoint error (seconds)
    pub avg_alignment_error: f64,
    pub status: AlignmentStatus,
}

/// Compute beat-aligned clip boundaries
///
/// Walks the selection region left to right, greedily extending from the
/// current anchor to the farthest beat whose elapsed time lies within
/// `[min, max]` (which maximizes the number of beats contained). Both
/// endpoints snap to the nearest frame at `target_fps`. When no beat
/// yields a legal duration the walk re-anchors at the next beat, dropping
/// the uncoverable gap. A remainder that itself fits the bounds becomes
/// the terminal clip, ending exactly at the region end. A beatless region
/// falls back to uniform chunks within the bounds so short or ambient
/// material still plans.
pub fn align_clips(
    beat_times: &[f64],
    duration_sec: f64,
    params: &BeatAlignParams,
) -> AlignmentResult {
    let fps = params.target_fps.max(1) as f64;
    let min = params.min_clip_sec;
    let max = params.max_clip_sec;

    let (region_start, region_end) = {
        let (s, e) = params.selection.unwrap_or((0.0, duration_sec));
        (s.max(0.0), e.min(duration_sec))
    };

    let snap = |t: f64| (t * fps).round() / fps;
    let frame = |t: f64| (t * fps).round() as i64;

    // Beats restricted to the region, keeping grid indices
    let beats: Vec<(usize, f64)> = beat_times
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, b)| *b >= region_start - EPS && *b <= region_end + EPS)
        .collect();

    let region_end_snapped = snap(region_end);
    let mut clips: Vec<AlignedClip> = Vec::new();
    let mut anchor = snap(region_start);
    let mut anchor_beat: Option<usize> = None;
    let mut anchor_error: Option<f64> = None;

    loop {
        let remainder = region_end_snapped - anchor;
        if remainder < min - EPS {
            break;
        }

        // The remainder fits a single clip: close out at the region end.
        // This is what makes feeding a produced clip back in reproduce
        // itself exactly.
        if remainder <= max + EPS {
            let end_beat = beats
                .iter()
                .find(|(_, b)| (snap(*b) - region_end_snapped).abs() < 0.5 / fps)
                .map(|(i, _)| *i);
            let end_error = end_beat.map(|i| region_end_snapped - beat_times[i]);
            clips.push(make_clip(
                clips.len(),
                anchor,
                region_end_snapped,
                anchor_beat,
                end_beat,
                anchor_error,
                end_error,
                &beats,
                fps,
            ));
            break;
        }

        // Candidates: beats reachable within [min, max] of the anchor
        let candidates: Vec<(usize, f64)> = beats
            .iter()
            .copied()
            .filter(|(_, b)| {
                let elapsed = *b - anchor;
                elapsed >= min - EPS && elapsed <= max + EPS
            })
            .collect();

        if candidates.is_empty() {
            // No beat produces a legal duration: drop this stretch and
            // re-anchor at the next beat.
            match beats.iter().find(|(_, b)| *b > anchor + EPS) {
                Some(&(idx, b)) => {
                    anchor = snap(b);
                    anchor_beat = Some(idx);
                    anchor_error = Some(anchor - b);
                    continue;
                }
                None => break,
            }
        }

        // Prefer the candidate containing the most beats; that is the
        // farthest one. Ties (beats snapping onto one frame) break toward
        // the smaller alignment error, then toward the later beat.
        let best = candidates
            .iter()
            .map(|&(idx, b)| {
                let count = beats
                    .iter()
                    .filter(|(_, t)| *t > anchor + EPS && *t <= b + EPS)
                    .count();
                let error = snap(b) - b;
                (idx, b, count, error)
            })
            .max_by(|a, b| {
                a.2.cmp(&b.2)
                    .then_with(|| {
                        b.3.abs()
                            .partial_cmp(&a.3.abs())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            });

        let Some((end_idx, end_nominal, _, end_error)) = best else {
            break;
        };

        let end = snap(end_nominal);
        clips.push(make_clip(
            clips.len(),
            anchor,
            end,
            anchor_beat,
            Some(end_idx),
            anchor_error,
            Some(end_error),
            &beats,
            fps,
        ));

        anchor = end;
        anchor_beat = Some(end_idx);
        anchor_error = Some(end_error);
    }

    // Beatless fallback: uniform chunks within bounds
    if clips.is_empty() {
        let len = region_end_snapped - snap(region_start);
        if len >= min - EPS {
            let chunks = (len / max).ceil().max(1.0) as usize;
            let chunk = len / chunks as f64;
            if chunk >= min - EPS {
                let start0 = snap(region_start);
                for i in 0..chunks {
                    let start = snap(start0 + chunk * i as f64);
                    let end = if i + 1 == chunks {
                        region_end_snapped
                    } else {
                        snap(start0 + chunk * (i + 1) as f64)
                    };
                    clips.push(make_clip(
                        i, start, end, None, None, None, None, &beats, fps,
                    ));
                }
            }
        }
    }

    let errors: Vec<f64> = clips
        .iter()
        .flat_map(|c| [c.start_error_sec, c.end_error_sec])
        .flatten()
        .map(f64::abs)
        .collect();
    let max_alignment_error = errors.iter().copied().fold(0.0, f64::max);
    let avg_alignment_error = if errors.is_empty() {
        0.0
    } else {
        errors.iter().sum::<f64>() / errors.len() as f64
    };

    AlignmentResult {
        clips,
        max_alignment_error,
        avg_alignment_error,
        status: if max_alignment_error <= WARNING_THRESHOLD_SEC {
            AlignmentStatus::Valid
        } else {
            AlignmentStatus::Warning
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn make_clip(
    index: usize,
    start: f64,
    end: f64,
    start_beat: Option<usize>,
    end_beat: Option<usize>,
    start_error: Option<f64>,
    end_error: Option<f64>,
    beats: &[(usize, f64)],
    fps: f64,
) -> AlignedClip {
    let beats_in_clip = beats
        .iter()
        .filter(|(_, t)| *t > start + EPS && *t <= end + EPS)
        .count();

    AlignedClip {
        index,
        start_sec: start,
        end_sec: end,
        start_beat,
        end_beat,
        start_frame: (start * fps).round() as i64,
        end_frame: (end * fps).round() as i64,
        duration_sec: end - start,
        beats_in_clip,
        start_error_sec: start_error,
        end_error_sec: end_error,
    }
}
