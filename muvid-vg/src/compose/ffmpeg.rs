//! External encoder subprocess wrappers
//!
//! Thin async wrappers over ffmpeg/ffprobe with stderr capture and a
//! per-subprocess wall clock cap. Every invocation is one subprocess; a
//! timeout kills it and surfaces as an encoder error rather than a hang.

use crate::config::{EncoderConfig, VideoConfig};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Encoder failure modes
#[derive(Debug, Error)]
pub enum EncoderError {
    /// Binary missing or not executable
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// Subprocess exited non-zero; stderr captured for the job error
    #[error("{program} failed: {stderr}")]
    Failed { program: String, stderr: String },

    /// Wall clock cap exceeded; subprocess killed
    #[error("{program} timed out after {timeout_sec} s")]
    TimedOut { program: String, timeout_sec: u64 },

    /// Output did not parse
    #[error("unparseable {program} output: {detail}")]
    Parse { program: String, detail: String },
}

/// Probed stream facts
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub duration_sec: f64,
    pub width: i64,
    pub height: i64,
    pub fps: f64,
    pub codec: String,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Probe a local file or URL
pub async fn probe(config: &EncoderConfig, input: &str) -> Result<ProbeInfo, EncoderError> {
    let stdout = run_capture(
        config,
        &config.ffprobe_path,
        &[
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
            input,
        ],
        Duration::from_secs(60),
    )
    .await?;

    let parsed: FfprobeOutput =
        serde_json::from_slice(&stdout).map_err(|e| EncoderError::Parse {
            program: "ffprobe".to_string(),
            detail: e.to_string(),
        })?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| EncoderError::Parse {
            program: "ffprobe".to_string(),
            detail: "no video stream".to_string(),
        })?;

    let duration_sec = video
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            parsed
                .format
                .as_ref()
                .and_then(|f| f.duration.as_deref())
                .and_then(|d| d.parse::<f64>().ok())
        })
        .ok_or_else(|| EncoderError::Parse {
            program: "ffprobe".to_string(),
            detail: "no duration".to_string(),
        })?;

    if duration_sec <= 0.0 {
        return Err(EncoderError::Parse {
            program: "ffprobe".to_string(),
            detail: format!("non-positive duration {duration_sec}"),
        });
    }

    Ok(ProbeInfo {
        duration_sec,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps: video
            .avg_frame_rate
            .as_deref()
            .map(parse_frame_rate)
            .unwrap_or(0.0),
        codec: video.codec_name.clone().unwrap_or_default(),
    })
}

/// Parse ffprobe's "num/den" frame rate
fn parse_frame_rate(rate: &str) -> f64 {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(1.0);
            if den == 0.0 {
                0.0
            } else {
                num / den
            }
        }
        None => rate.parse().unwrap_or(0.0),
    }
}

/// Scale to target resolution with letterbox padding, convert fps,
/// re-encode at the target codec settings
pub async fn normalize(
    config: &EncoderConfig,
    video: &VideoConfig,
    input: &Path,
    output: &Path,
) -> Result<(), EncoderError> {
    let filter = format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,\
         pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black,\
         fps={fps},format=yuv420p",
        w = video.width,
        h = video.height,
        fps = video.fps
    );

    run_encode(
        config,
        &[
            "-y",
            "-i",
            path_str(input),
            "-vf",
            &filter,
            "-an",
            "-c:v",
            "libx264",
            "-crf",
            &video.crf.to_string(),
            "-preset",
            &video.preset,
            path_str(output),
        ],
    )
    .await
}

/// Trim from the end to the target duration (stream re-encode free)
pub async fn trim(
    config: &EncoderConfig,
    input: &Path,
    output: &Path,
    duration_sec: f64,
) -> Result<(), EncoderError> {
    run_encode(
        config,
        &[
            "-y",
            "-i",
            path_str(input),
            "-t",
            &format!("{duration_sec:.4}"),
            "-c",
            "copy",
            path_str(output),
        ],
    )
    .await
}

/// Freeze the last frame out to the target duration, fading over a short
/// window at the end
pub async fn extend_freeze(
    config: &EncoderConfig,
    video: &VideoConfig,
    input: &Path,
    output: &Path,
    current_duration_sec: f64,
    target_duration_sec: f64,
    fade_sec: f64,
) -> Result<(), EncoderError> {
    let pad = (target_duration_sec - current_duration_sec).max(0.0);
    let fade_start = (target_duration_sec - fade_sec).max(0.0);
    let filter = format!(
        "tpad=stop_mode=clone:stop_duration={pad:.4},fade=t=out:st={fade_start:.4}:d={fade_sec:.4}"
    );

    run_encode(
        config,
        &[
            "-y",
            "-i",
            path_str(input),
            "-vf",
            &filter,
            "-t",
            &format!("{target_duration_sec:.4}"),
            "-c:v",
            "libx264",
            "-crf",
            &video.crf.to_string(),
            "-preset",
            &video.preset,
            path_str(output),
        ],
    )
    .await
}

/// Join clips via the stream-copy concat demuxer
///
/// Inputs must already share codec, resolution and fps, which
/// normalization guarantees.
pub async fn concat(
    config: &EncoderConfig,
    list_file: &Path,
    output: &Path,
) -> Result<(), EncoderError> {
    run_encode(
        config,
        &[
            "-y",
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
            path_str(list_file),
            "-c",
            "copy",
            path_str(output),
        ],
    )
    .await
}

/// Apply a prebuilt video filter expression (beat effects)
pub async fn apply_filter(
    config: &EncoderConfig,
    video: &VideoConfig,
    input: &Path,
    output: &Path,
    filter: &str,
) -> Result<(), EncoderError> {
    run_encode(
        config,
        &[
            "-y",
            "-i",
            path_str(input),
            "-vf",
            filter,
            "-c:v",
            "libx264",
            "-crf",
            &video.crf.to_string(),
            "-preset",
            &video.preset,
            path_str(output),
        ],
    )
    .await
}

/// Mux the visual track with the original audio segment
///
/// Audio starts at `audio_offset_sec` into the source and both tracks
/// cut at `duration_sec`, padding audio with silence when the source
/// runs out first.
pub async fn mux(
    config: &EncoderConfig,
    video_in: &Path,
    audio_in: &Path,
    output: &Path,
    audio_offset_sec: f64,
    duration_sec: f64,
) -> Result<(), EncoderError> {
    run_encode(
        config,
        &[
            "-y",
            "-i",
            path_str(video_in),
            "-ss",
            &format!("{audio_offset_sec:.4}"),
            "-i",
            path_str(audio_in),
            "-map",
            "0:v:0",
            "-map",
            "1:a:0",
            "-c:v",
            "copy",
            "-c:a",
            "aac",
            "-b:a",
            "192k",
            "-af",
            "apad",
            "-t",
            &format!("{duration_sec:.4}"),
            path_str(output),
        ],
    )
    .await
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_default()
}

/// Run ffmpeg discarding stdout
async fn run_encode(config: &EncoderConfig, args: &[&str]) -> Result<(), EncoderError> {
    run_capture(
        config,
        &config.ffmpeg_path,
        args,
        Duration::from_secs(config.subprocess_timeout_sec),
    )
    .await
    .map(|_| ())
}

/// Spawn, wait with timeout, capture output
async fn run_capture(
    _config: &EncoderConfig,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<Vec<u8>, EncoderError> {
    tracing::debug!(program, args = ?args, "Running encoder subprocess");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| EncoderError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let waited = tokio::time::timeout(timeout, async {
        let output = child.wait_with_output().await;
        output
    })
    .await;

    match waited {
        Ok(Ok(output)) => {
            if output.status.success() {
                Ok(output.stdout)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                // Last lines carry the actual failure
                let tail: String = stderr
                    .lines()
                    .rev()
                    .take(5)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join("\n");
                Err(EncoderError::Failed {
                    program: program.to_string(),
                    stderr: tail,
                })
            }
        }
        Ok(Err(e)) => Err(EncoderError::Spawn {
            program: program.to_string(),
            source: e,
        }),
        Err(_) => Err(EncoderError::TimedOut {
            program: program.to_string(),
            timeout_sec: timeout.as_secs(),
        }),
    }
}
