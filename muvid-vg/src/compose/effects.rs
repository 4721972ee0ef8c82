//! Beat-reactive filter construction
//!
//! Translates beat times into frame-indexed ffmpeg filter expressions.
//! Active frames sit within one frame of the nominal beat; when several
//! beats fall inside a single frame the earlier beat wins and the frame
//! appears once.

use crate::config::{BeatEffectConfig, BeatEffectKind, VideoConfig};

/// Map beat times to output frame indices
///
/// `offset_sec` shifts song-time beats into composed-video time (the
/// selection start for short-form). Beats before the output or past
/// `duration_sec` drop out; duplicate frames keep the earlier beat.
pub fn beat_frames(
    beat_times: &[f64],
    offset_sec: f64,
    duration_sec: f64,
    fps: u32,
) -> Vec<i64> {
    let mut frames: Vec<i64> = Vec::new();
    for &beat in beat_times {
        let local = beat - offset_sec;
        if local < -1e-9 || local > duration_sec + 1e-9 {
            continue;
        }
        let frame = (local * fps as f64).round() as i64;
        // Earlier beat wins a contested frame
        if frames.last() != Some(&frame) {
            frames.push(frame);
        }
    }
    frames.dedup();
    frames
}

/// Build the ffmpeg -vf expression for the configured effect
///
/// Returns None when there are no beats to react to.
pub fn build_filter(
    config: &BeatEffectConfig,
    frames: &[i64],
    video: &VideoConfig,
) -> Option<String> {
    if frames.is_empty() {
        return None;
    }
    let intensity = config.intensity.clamp(0.0, 1.0);

    let filter = match config.kind {
        // One white frame per beat
        BeatEffectKind::Flash => {
            let enable = enable_single(frames);
            format!(
                "eq=brightness={:.3}:saturation={:.3}:enable='{enable}'",
                0.6 * intensity,
                1.0 - 0.5 * intensity
            )
        }
        // Saturation boost over 3 frames
        BeatEffectKind::ColorBurst => {
            let enable = enable_span(frames, 2);
            format!("eq=saturation={:.3}:enable='{enable}'", 1.0 + intensity)
        }
        // Centered zoom up to 1.05x over 5 frames
        BeatEffectKind::ZoomPulse => {
            let zoom = 1.0 + 0.05 * intensity;
            let condition = frames
                .iter()
                .map(|f| format!("between(in,{f},{})", f + 4))
                .collect::<Vec<_>>()
                .join("+");
            format!(
                "zoompan=z='if({condition},{zoom:.3},1)':d=1:\
                 x='iw/2-(iw/zoom/2)':y='ih/2-(ih/zoom/2)':\
                 s={}x{}:fps={}",
                video.width, video.height, video.fps
            )
        }
        // RGB channel shift over 3 frames
        BeatEffectKind::Glitch => {
            let shift = (8.0 * intensity).round().max(1.0) as i64;
            let enable = enable_span(frames, 2);
            format!("rgbashift=rh={shift}:bv=-{shift}:enable='{enable}'")
        }
    };

    Some(filter)
}

/// enable expression active on exactly the given frames
fn enable_single(frames: &[i64]) -> String {
    frames
        .iter()
        .map(|f| format!("eq(n,{f})"))
        .collect::<Vec<_>>()
        .join("+")
}

/// enable expression active on [frame, frame + span]
fn enable_span(frames: &[i64], span: i64) -> String {
    frames
        .iter()
        .map(|f| format!("between(n,{f},{})", f + span))
        .collect::<Vec<_>>()
        .join("+")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn effect(kind: BeatEffectKind) -> BeatEffectConfig {
        BeatEffectConfig {
            enabled: true,
            kind,
            intensity: 1.0,
        }
    }

    fn video() -> VideoConfig {
        VideoConfig::default()
    }

    #[test]
    fn test_beat_frames_at_24_fps() {
        let beats = [0.0, 0.5, 1.0, 1.5];
        assert_eq!(beat_frames(&beats, 0.0, 2.0, 24), vec![0, 12, 24, 36]);
    }

    #[test]
    fn test_beat_frames_shifted_by_selection() {
        // Selection starting at 40 s: the beat at 40.5 lands on frame 12
        let beats = [39.5, 40.0, 40.5, 41.0];
        assert_eq!(beat_frames(&beats, 40.0, 30.0, 24), vec![0, 12, 24]);
    }

    #[test]
    fn test_contested_frame_keeps_earlier_beat() {
        // Both beats round onto frame 12 at 24 fps
        let beats = [0.499, 0.51];
        assert_eq!(beat_frames(&beats, 0.0, 2.0, 24), vec![12]);
    }

    #[test]
    fn test_flash_filter_targets_exact_frames() {
        let frames = beat_frames(&[0.0, 0.5, 1.0, 1.5], 0.0, 2.0, 24);
        let filter = build_filter(&effect(BeatEffectKind::Flash), &frames, &video()).unwrap();
        assert!(filter.contains("eq(n,0)+eq(n,12)+eq(n,24)+eq(n,36)"));
        assert!(filter.starts_with("eq=brightness="));
        // Exactly four active frames in the expression
        assert_eq!(filter.matches("eq(n,").count(), 4);
    }

    #[test]
    fn test_color_burst_spans_three_frames() {
        let filter =
            build_filter(&effect(BeatEffectKind::ColorBurst), &[12], &video()).unwrap();
        assert!(filter.contains("between(n,12,14)"));
        assert!(filter.contains("saturation=2.000"));
    }

    #[test]
    fn test_zoom_pulse_is_bounded() {
        let filter = build_filter(&effect(BeatEffectKind::ZoomPulse), &[24], &video()).unwrap();
        assert!(filter.contains("1.050"));
        assert!(filter.contains("between(in,24,28)"));
        assert!(filter.contains("s=1920x1080"));
    }

    #[test]
    fn test_glitch_shifts_channels() {
        let filter = build_filter(&effect(BeatEffectKind::Glitch), &[6], &video()).unwrap();
        assert!(filter.contains("rgbashift=rh=8:bv=-8"));
        assert!(filter.contains("between(n,6,8)"));
    }

    #[test]
    fn test_no_beats_no_filter() {
        assert!(build_filter(&effect(BeatEffectKind::Flash), &[], &video()).is_none());
    }

    #[test]
    fn test_half_intensity_scales_flash() {
        let mut config = effect(BeatEffectKind::Flash);
        config.intensity = 0.5;
        let filter = build_filter(&config, &[0], &video()).unwrap();
        assert!(filter.contains("brightness=0.300"));
    }
}
