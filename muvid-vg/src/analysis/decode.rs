//! Audio decoding
//!
//! Decodes any symphonia-recognized container/codec to mono f32 PCM and
//! resamples to the fixed engine rate. All downstream analysis operates
//! on this canonical form, which keeps the whole engine deterministic
//! across re-runs.

use anyhow::{Context, Result};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Fixed analysis sample rate
pub const ENGINE_SAMPLE_RATE: u32 = 22_050;

/// Decoded, downmixed, resampled audio
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Mono samples in [-1.0, 1.0] at ENGINE_SAMPLE_RATE
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub duration_sec: f64,
}

/// Decode source bytes to the canonical engine form
///
/// The extension hint helps symphonia pick a demuxer quickly but is not
/// required to be correct.
pub fn decode_bytes(bytes: Vec<u8>, extension_hint: Option<&str>) -> Result<AudioBuffer> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = extension_hint {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("unsupported or corrupt audio format")?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("no audio track found")?;

    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .context("sample rate unknown")?;
    let channels = track
        .codec_params
        .channels
        .context("channel layout unknown")?
        .count();

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("failed to create decoder")?;

    let mut mono: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(anyhow::anyhow!("error reading packet: {e}")),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet).context("failed to decode packet")?;

        let spec = *decoded.spec();
        if sample_buf.is_none() {
            sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        }
        let buf = sample_buf.as_mut().unwrap();
        buf.copy_interleaved_ref(decoded);

        for frame in buf.samples().chunks_exact(channels) {
            mono.push(frame.iter().sum::<f32>() / channels as f32);
        }
    }

    if mono.is_empty() {
        anyhow::bail!("decoded zero samples");
    }

    let resampled = resample_linear(&mono, sample_rate, ENGINE_SAMPLE_RATE);
    let duration_sec = resampled.len() as f64 / ENGINE_SAMPLE_RATE as f64;

    tracing::debug!(
        input_rate = sample_rate,
        channels,
        samples = resampled.len(),
        duration_sec = format!("{duration_sec:.2}"),
        "Audio decoded to engine form"
    );

    Ok(AudioBuffer {
        samples: resampled,
        sample_rate: ENGINE_SAMPLE_RATE,
        duration_sec,
    })
}

/// Linear-interpolation resampler
///
/// Feature extraction does not need band-limited quality; linear
/// interpolation keeps the engine dependency-free and deterministic.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples.get(idx + 1).copied().unwrap_or(a);
        out.push(a + (b - a) * frac);
    }

    out
}
