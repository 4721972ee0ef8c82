//! Waveform summary
//!
//! Downsamples the amplitude envelope to a fixed-length array for the
//! front end's waveform display: linear bucketing, each bucket the max
//! absolute amplitude, normalized to [0, 1].

/// Default summary length; must stay within 512-2048
pub const SUMMARY_LEN: usize = 1024;

/// Build the waveform summary
pub fn summarize(samples: &[f32], target_len: usize) -> Vec<f32> {
    if samples.is_empty() || target_len == 0 {
        return Vec::new();
    }

    let bucket_size = (samples.len() as f64 / target_len as f64).max(1.0);
    let mut summary = Vec::with_capacity(target_len);

    for i in 0..target_len {
        let start = (i as f64 * bucket_size) as usize;
        let end = (((i + 1) as f64 * bucket_size) as usize).min(samples.len());
        if start >= samples.len() {
            break;
        }
        let peak = samples[start..end.max(start + 1)]
            .iter()
            .fold(0.0f32, |acc, &s| acc.max(s.abs()));
        summary.push(peak);
    }

    // Normalize so the loudest bucket is 1.0
    let max = summary.iter().cloned().fold(0.0f32, f32::max);
    if max > 0.0 {
        for v in &mut summary {
            *v /= max;
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_length_and_range() {
        let samples: Vec<f32> = (0..100_000)
            .map(|i| (i as f32 / 500.0).sin() * 0.7)
            .collect();
        let summary = summarize(&samples, SUMMARY_LEN);

        assert_eq!(summary.len(), SUMMARY_LEN);
        assert!((512..=2048).contains(&summary.len()));
        for &v in &summary {
            assert!((0.0..=1.0).contains(&v));
        }
        // Normalization pins the peak at 1.0
        assert!((summary.iter().cloned().fold(0.0f32, f32::max) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_buckets_are_max_amplitude() {
        // A single spike must survive downsampling
        let mut samples = vec![0.01f32; 10_000];
        samples[5_000] = 0.9;
        let summary = summarize(&samples, 100);

        let spike_bucket = 50;
        assert!((summary[spike_bucket] - 1.0).abs() < 1e-6);
        assert!(summary[0] < 0.1);
    }

    #[test]
    fn test_short_input_does_not_panic() {
        let summary = summarize(&[0.5, -0.25], 1024);
        assert!(!summary.is_empty());
        assert!(summary.len() <= 1024);
    }

    #[test]
    fn test_empty_input() {
        assert!(summarize(&[], 1024).is_empty());
    }
}
