//! Shared STFT front end
//!
//! One magnitude-spectrogram pass feeds beat tracking, section inference
//! and mood features, so the engine decodes and transforms each song
//! exactly once.

use anyhow::Result;
use realfft::RealFftPlanner;

/// STFT analysis window
pub const WINDOW_SIZE: usize = 2048;
/// STFT hop
pub const HOP_SIZE: usize = 512;

/// Magnitude spectrogram frames
#[derive(Debug, Clone)]
pub struct SpectralFrames {
    /// One magnitude vector (WINDOW_SIZE / 2 + 1 bins) per frame
    pub magnitudes: Vec<Vec<f32>>,
    pub window_size: usize,
    pub hop_size: usize,
    pub sample_rate: u32,
}

impl SpectralFrames {
    /// Time of a frame center in seconds
    pub fn frame_time(&self, frame_index: usize) -> f64 {
        (frame_index * self.hop_size) as f64 / self.sample_rate as f64
    }

    /// Frequency of an FFT bin in Hz
    pub fn bin_frequency(&self, bin: usize) -> f64 {
        bin as f64 * self.sample_rate as f64 / self.window_size as f64
    }

    /// Spectral flux: per-frame sum of positive magnitude differences
    pub fn spectral_flux(&self) -> Vec<f32> {
        let mut flux = Vec::with_capacity(self.magnitudes.len());
        let mut previous: Option<&Vec<f32>> = None;

        for frame in &self.magnitudes {
            let value = match previous {
                Some(prev) => frame
                    .iter()
                    .zip(prev.iter())
                    .map(|(&curr, &prev)| (curr - prev).max(0.0))
                    .sum(),
                None => 0.0,
            };
            flux.push(value);
            previous = Some(frame);
        }

        flux
    }

    /// Per-frame spectral centroid in Hz
    pub fn spectral_centroids(&self) -> Vec<f64> {
        self.magnitudes
            .iter()
            .map(|frame| {
                let total: f64 = frame.iter().map(|&m| m as f64).sum();
                if total <= f64::EPSILON {
                    return 0.0;
                }
                let weighted: f64 = frame
                    .iter()
                    .enumerate()
                    .map(|(bin, &m)| self.bin_frequency(bin) * m as f64)
                    .sum();
                weighted / total
            })
            .collect()
    }
}

/// Compute Hann-windowed magnitude frames
pub fn magnitude_frames(samples: &[f32], sample_rate: u32) -> Result<SpectralFrames> {
    let mut planner = RealFftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(WINDOW_SIZE);
    let mut input = fft.make_input_vec();
    let mut spectrum = fft.make_output_vec();

    // Precomputed Hann window
    let window: Vec<f32> = (0..WINDOW_SIZE)
        .map(|i| {
            0.5 * (1.0
                - (2.0 * std::f32::consts::PI * i as f32 / (WINDOW_SIZE - 1) as f32).cos())
        })
        .collect();

    let mut magnitudes = Vec::new();

    for chunk in samples.windows(WINDOW_SIZE).step_by(HOP_SIZE) {
        for (i, (&sample, &w)) in chunk.iter().zip(window.iter()).enumerate() {
            input[i] = sample * w;
        }

        fft.process(&mut input, &mut spectrum)
            .map_err(|_| anyhow::anyhow!("FFT processing failed"))?;

        magnitudes.push(spectrum.iter().map(|c| c.norm()).collect());
    }

    Ok(SpectralFrames {
        magnitudes,
        window_size: WINDOW_SIZE,
        hop_size: HOP_SIZE,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, duration_sec: f32, rate: u32) -> Vec<f32> {
        (0..(duration_sec * rate as f32) as usize)
            .map(|i| (i as f32 * freq * 2.0 * std::f32::consts::PI / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_sine_peak_lands_in_expected_bin() {
        let rate = 22_050;
        let samples = sine(440.0, 1.0, rate);
        let frames = magnitude_frames(&samples, rate).unwrap();

        let frame = &frames.magnitudes[frames.magnitudes.len() / 2];
        let peak_bin = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;

        let peak_freq = frames.bin_frequency(peak_bin);
        assert!(
            (peak_freq - 440.0).abs() < 22_050.0 / 2048.0 * 1.5,
            "peak at {peak_freq} Hz"
        );
    }

    #[test]
    fn test_flux_spikes_on_onset() {
        let rate = 22_050;
        // Silence then a tone: flux must spike near the boundary
        let mut samples = vec![0.0f32; rate as usize];
        samples.extend(sine(440.0, 1.0, rate));

        let frames = magnitude_frames(&samples, rate).unwrap();
        let flux = frames.spectral_flux();

        let peak_frame = flux
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        let peak_time = frames.frame_time(peak_frame);
        assert!((peak_time - 1.0).abs() < 0.1, "onset found at {peak_time}");
    }

    #[test]
    fn test_centroid_tracks_brightness() {
        let rate = 22_050;
        let low = magnitude_frames(&sine(220.0, 0.5, rate), rate).unwrap();
        let high = magnitude_frames(&sine(3000.0, 0.5, rate), rate).unwrap();

        let mean = |c: Vec<f64>| c.iter().sum::<f64>() / c.len() as f64;
        assert!(mean(high.spectral_centroids()) > mean(low.spectral_centroids()));
    }
}
