//! Configuration for muvid-vg
//!
//! A single immutable `AppConfig` snapshot is built at startup from
//! defaults, an optional TOML config file, and environment-variable
//! overrides for service credentials. Workers receive the relevant
//! sub-config inside job payloads so every job sees one consistent
//! snapshot even across a config reload.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Target output video parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Target frames per second
    pub fps: u32,
    /// x264 constant rate factor (18-28)
    pub crf: u32,
    /// x264 encoder preset
    pub preset: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 24,
            crf: 23,
            preset: "medium".to_string(),
        }
    }
}

/// Duration limits and planning bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard cap for composed output duration (seconds)
    pub max_song_duration_sec: f64,
    /// Minimum section duration before adjacent-merge (seconds)
    pub min_section_sec: f64,
    /// Minimum planned clip duration (seconds)
    pub min_clip_sec: f64,
    /// Maximum planned clip duration (seconds)
    pub max_clip_sec: f64,
    /// Maximum amount the final clip may be extended to meet the
    /// selected audio duration (seconds)
    pub max_extend_sec: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_song_duration_sec: 300.0,
            min_section_sec: 8.0,
            min_clip_sec: 3.0,
            max_clip_sec: 6.0,
            max_extend_sec: 3.0,
        }
    }
}

/// Worker pool and queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of in-process queue workers
    pub count: usize,
    /// Per-song cap on concurrently generating clips
    pub worker_concurrency_per_song: usize,
    /// Bounded pool size for parallel clip normalization
    pub normalize_workers: usize,
    /// Queue poll interval when idle (milliseconds)
    pub poll_interval_ms: u64,
    /// Default per-job timeout for the default queue (seconds)
    pub default_queue_timeout_sec: u64,
    /// Per-job timeout for the clip-generation queue (seconds)
    pub clip_queue_timeout_sec: u64,
    /// Per-job timeout for composition jobs (seconds)
    pub composition_timeout_sec: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            worker_concurrency_per_song: 4,
            normalize_workers: 4,
            poll_interval_ms: 500,
            default_queue_timeout_sec: 3600,
            clip_queue_timeout_sec: 1200,
            composition_timeout_sec: 1800,
        }
    }
}

/// Retry policy for transient external failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_sec: f64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_sec: 2.0,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given retry (1-based attempt number)
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1);
        let secs = self.initial_backoff_sec * self.backoff_multiplier.powi(exp as i32);
        std::time::Duration::from_secs_f64(secs)
    }
}

/// Beat-reactive effect selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatEffectKind {
    Flash,
    ColorBurst,
    ZoomPulse,
    Glitch,
}

/// Beat-reactive effect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeatEffectConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: BeatEffectKind,
    /// Effect strength in [0, 1]
    pub intensity: f64,
}

impl Default for BeatEffectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: BeatEffectKind::Flash,
            intensity: 0.8,
        }
    }
}

/// A configured external HTTP service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
}

/// External service endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Text/image-to-video generator (required for clip generation)
    pub generator: Option<ServiceEndpoint>,
    /// Optional musical structure service (section inference)
    pub structure: Option<ServiceEndpoint>,
    /// Optional lyrics transcription service
    pub transcription: Option<ServiceEndpoint>,
}

/// External encoder (ffmpeg/ffprobe) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Wall clock cap per encoder subprocess (seconds)
    pub subprocess_timeout_sec: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            subprocess_timeout_sec: 600,
        }
    }
}

/// Clip generation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Wall clock cap per external generation (seconds)
    pub wall_clock_cap_sec: u64,
    /// External job poll interval (seconds)
    pub poll_interval_sec: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            wall_clock_cap_sec: 900,
            poll_interval_sec: 4,
        }
    }
}

/// Complete service configuration snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP listen port
    pub port: u16,
    /// Root folder holding the database and blob tree
    pub root_folder: PathBuf,
    /// Queue name prefix (environment), e.g. "prod" -> "prod:clip-generation"
    pub queue_env: String,
    pub beat_aligned_transitions_enabled: bool,
    /// Base visual style every prompt opens with
    pub prompt_style: String,
    /// Lifetime of short-lived blob read URLs (seconds)
    pub blob_url_ttl_sec: u64,
    /// Secret for blob read-URL tokens; randomized when unset
    pub blob_token_secret: Option<String>,
    pub video: VideoConfig,
    pub limits: LimitsConfig,
    pub workers: WorkerConfig,
    pub retry: RetryPolicy,
    pub beat_effect: BeatEffectConfig,
    pub services: ServicesConfig,
    pub encoder: EncoderConfig,
    pub generation: GenerationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 5810,
            root_folder: muvid_common::config::default_root_folder(),
            queue_env: "dev".to_string(),
            beat_aligned_transitions_enabled: true,
            prompt_style: "cinematic".to_string(),
            blob_url_ttl_sec: 900,
            blob_token_secret: None,
            video: VideoConfig::default(),
            limits: LimitsConfig::default(),
            workers: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            beat_effect: BeatEffectConfig::default(),
            services: ServicesConfig::default(),
            encoder: EncoderConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Build the config snapshot: defaults <- TOML file <- environment.
    ///
    /// Environment overrides cover credentials only, so secrets stay out
    /// of on-disk config files.
    pub fn load(root_override: Option<PathBuf>) -> Self {
        let mut config = match muvid_common::config::load_config_toml() {
            Some(value) => match value.try_into::<AppConfig>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(error = %e, "Config file invalid, using defaults");
                    AppConfig::default()
                }
            },
            None => AppConfig::default(),
        };

        if let Some(root) = root_override {
            config.root_folder = root;
        } else if let Ok(root) = std::env::var("MUVID_ROOT") {
            if !root.is_empty() {
                config.root_folder = PathBuf::from(root);
            }
        }

        // Credential overrides
        if let Ok(token) = std::env::var("MUVID_GENERATOR_TOKEN") {
            if let Some(generator) = config.services.generator.as_mut() {
                generator.api_token = Some(token);
            }
        }
        if let Ok(url) = std::env::var("MUVID_GENERATOR_URL") {
            let token = config
                .services
                .generator
                .as_ref()
                .and_then(|g| g.api_token.clone());
            config.services.generator = Some(ServiceEndpoint {
                base_url: url,
                api_token: token,
            });
        }

        config
    }

    /// Path of the SQLite database inside the root folder
    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join("muvid.db")
    }

    /// Blob store root inside the root folder
    pub fn blob_root(&self) -> PathBuf {
        self.root_folder.join("blobs")
    }

    /// Scratch directory for composition intermediates
    pub fn temp_root(&self) -> PathBuf {
        self.root_folder.join("tmp")
    }

    /// Name of the dedicated clip-generation queue
    pub fn clip_queue(&self) -> String {
        format!("{}:clip-generation", self.queue_env)
    }

    /// Name of the default queue (analysis, composition)
    pub fn default_queue(&self) -> String {
        format!("{}:default", self.queue_env)
    }

    /// Effective minimum section duration for a song of the given length
    ///
    /// Relaxed for short songs so they still produce >= 2 sections.
    pub fn effective_min_section_sec(&self, song_duration_sec: f64) -> f64 {
        if song_duration_sec < 60.0 {
            self.limits.min_section_sec.min(5.0)
        } else {
            self.limits.min_section_sec
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.video.width, 1920);
        assert_eq!(config.video.height, 1080);
        assert_eq!(config.video.fps, 24);
        assert_eq!(config.video.crf, 23);
        assert_eq!(config.workers.worker_concurrency_per_song, 4);
        assert_eq!(config.limits.max_song_duration_sec, 300.0);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_queue_names_carry_environment() {
        let mut config = AppConfig::default();
        config.queue_env = "staging".to_string();
        assert_eq!(config.clip_queue(), "staging:clip-generation");
        assert_eq!(config.default_queue(), "staging:default");
    }

    #[test]
    fn test_min_section_relaxed_for_short_songs() {
        let config = AppConfig::default();
        assert_eq!(config.effective_min_section_sec(180.0), 8.0);
        assert_eq!(config.effective_min_section_sec(45.0), 5.0);
    }

    #[test]
    fn test_backoff_schedule_is_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(1).as_secs(), 2);
        assert_eq!(policy.backoff_for_attempt(2).as_secs(), 4);
        assert_eq!(policy.backoff_for_attempt(3).as_secs(), 8);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let text = toml::to_string(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.port, config.port);
        assert_eq!(parsed.video.fps, config.video.fps);
    }
}
