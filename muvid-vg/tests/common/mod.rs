//! Shared test helpers: in-memory state, seeded songs, a scriptable
//! generator, and fake encoder binaries so pipelines run hermetically.

#![allow(dead_code)]

use async_trait::async_trait;
use muvid_common::events::EventBus;
use muvid_vg::clips::generator_client::{
    GenerationRequest, GenerationStatus, GeneratorError, VideoGenerator,
};
use muvid_vg::config::AppConfig;
use muvid_vg::models::{Section, SectionKind, Song, SongAnalysis, VideoType};
use muvid_vg::storage::BlobStore;
use muvid_vg::AppState;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Build an AppState over an in-memory database and a temp blob store
pub async fn test_state(
    generator: Option<Arc<dyn VideoGenerator>>,
) -> (AppState, tempfile::TempDir) {
    test_state_with(generator, |_| {}).await
}

/// test_state with a config hook (fast backoffs, custom caps)
pub async fn test_state_with(
    generator: Option<Arc<dyn VideoGenerator>>,
    tune: impl FnOnce(&mut AppConfig),
) -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");

    let pool = sqlx::SqlitePool::connect("sqlite::memory:")
        .await
        .expect("in-memory database");
    muvid_vg::db::schema::initialize_schema(&pool)
        .await
        .expect("schema");

    let mut config = AppConfig::default();
    config.root_folder = dir.path().to_path_buf();
    // Fake encoder binaries live in the temp dir
    config.encoder.ffmpeg_path = dir.path().join("fake-ffmpeg").display().to_string();
    config.encoder.ffprobe_path = dir.path().join("fake-ffprobe").display().to_string();
    tune(&mut config);

    let blobs = Arc::new(
        BlobStore::new(dir.path().join("blobs"), "test-secret".to_string()).expect("blob store"),
    );

    let state = AppState::new(
        pool,
        EventBus::new(100),
        Arc::new(config),
        blobs,
        generator,
    );
    (state, dir)
}

/// Install fake ffmpeg/ffprobe shell scripts into the temp dir
///
/// The fake ffprobe reports 5 s for per-clip files and 30 s for joined
/// and final outputs, always at 1920x1080 and 24 fps. The fake ffmpeg
/// just writes its output file (the last argument).
#[cfg(unix)]
pub fn install_fake_encoders(dir: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    let ffprobe = r#"#!/bin/sh
for last; do :; done
case "$last" in
  *joined*|*effected*|*extended*|*composed*) dur=30.000000 ;;
  *) dur=5.000000 ;;
esac
cat <<EOF
{
  "streams": [
    {"codec_type": "video", "codec_name": "h264",
     "width": 1920, "height": 1080,
     "avg_frame_rate": "24/1", "duration": "$dur"}
  ],
  "format": {"duration": "$dur"}
}
EOF
"#;

    let ffmpeg = r#"#!/bin/sh
for last; do :; done
printf 'fake-video-bytes' > "$last"
"#;

    let ffprobe_path = dir.join("fake-ffprobe");
    let ffmpeg_path = dir.join("fake-ffmpeg");
    std::fs::write(&ffprobe_path, ffprobe).expect("write fake ffprobe");
    std::fs::write(&ffmpeg_path, ffmpeg).expect("write fake ffmpeg");
    for path in [&ffprobe_path, &ffmpeg_path] {
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
}

/// Seed a short-form song with a 120 BPM analysis and a [40, 70]
/// selection (the short-form happy-path fixture)
pub async fn seed_analyzed_song(state: &AppState) -> Song {
    let mut song = Song::new("songs/test/source.wav".to_string(), Some("t.wav".into()));
    song.duration_sec = Some(180.0);
    song.video_type = Some(VideoType::ShortForm);
    song.selection_start_sec = Some(40.0);
    song.selection_end_sec = Some(70.0);
    muvid_vg::db::songs::insert_song(&state.db, &song)
        .await
        .expect("insert song");

    state
        .blobs
        .put("songs/test/source.wav", b"fake-audio-bytes")
        .await
        .expect("seed audio blob");

    let mut analysis = SongAnalysis::new(song.id, 0);
    analysis.bpm = Some(120.0);
    analysis.beat_times = (0..360).map(|i| i as f64 * 0.5).collect();
    analysis.sections = vec![
        section(0.0, 30.0, SectionKind::Intro),
        section(30.0, 90.0, SectionKind::Verse),
        section(90.0, 150.0, SectionKind::Chorus),
        section(150.0, 180.0, SectionKind::Outro),
    ];
    analysis.mood = Some(muvid_vg::models::MoodVector {
        energy: 0.8,
        valence: 0.7,
        danceability: 0.75,
        tension: 0.3,
    });
    analysis.mood_tags = vec!["energetic".to_string(), "danceable".to_string()];
    analysis.genre = Some("electronic".to_string());
    analysis.waveform = vec![0.5; 1024];
    muvid_vg::db::analyses::save_analysis(&state.db, &mut analysis)
        .await
        .expect("save analysis");

    song
}

fn section(start: f64, end: f64, kind: SectionKind) -> Section {
    Section {
        start_sec: start,
        end_sec: end,
        kind,
        confidence: 0.8,
        label: None,
        lyrics: None,
    }
}

/// A scripted poll outcome sequence per submission
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Poll reports processing `polls` times, then succeeds
    Succeed { polls: usize },
    /// Poll fails with a retriable error
    FailRetriable(String),
    /// Poll fails permanently
    FailPermanent(String),
}

struct MockState {
    script: Vec<ScriptedRun>,
    submissions: Vec<GenerationRequest>,
    polls_by_job: std::collections::HashMap<String, usize>,
}

/// Scriptable in-memory generator
///
/// Each submit consumes the next ScriptedRun; the result URL points at a
/// real temp file so downstream probing and downloading work.
pub struct MockGenerator {
    state: Mutex<MockState>,
    result_dir: std::path::PathBuf,
    counter: AtomicUsize,
}

impl MockGenerator {
    pub fn new(result_dir: std::path::PathBuf, script: Vec<ScriptedRun>) -> Self {
        Self {
            state: Mutex::new(MockState {
                script,
                submissions: Vec::new(),
                polls_by_job: std::collections::HashMap::new(),
            }),
            result_dir,
            counter: AtomicUsize::new(0),
        }
    }

    pub async fn submissions(&self) -> Vec<GenerationRequest> {
        self.state.lock().await.submissions.clone()
    }
}

#[async_trait]
impl VideoGenerator for MockGenerator {
    async fn submit(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.submissions.push(request.clone());
        Ok(format!("ext-{index}"))
    }

    async fn poll(&self, external_job_id: &str) -> Result<GenerationStatus, GeneratorError> {
        let index: usize = external_job_id
            .strip_prefix("ext-")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| GeneratorError::NotFound(external_job_id.to_string()))?;

        let mut state = self.state.lock().await;
        let run = state
            .script
            .get(index)
            .cloned()
            .unwrap_or(ScriptedRun::Succeed { polls: 0 });

        match run {
            ScriptedRun::Succeed { polls } => {
                let seen = state
                    .polls_by_job
                    .entry(external_job_id.to_string())
                    .or_insert(0);
                *seen += 1;
                if *seen <= polls {
                    return Ok(GenerationStatus::Processing);
                }

                let path = self.result_dir.join(format!("result_{index}.mp4"));
                std::fs::write(&path, b"generated-clip").expect("write mock result");
                Ok(GenerationStatus::Succeeded {
                    result_url: path.display().to_string(),
                    width: Some(1920),
                    height: Some(1080),
                    fps: Some(24.0),
                })
            }
            ScriptedRun::FailRetriable(message) => Ok(GenerationStatus::Failed {
                message,
                retriable: true,
            }),
            ScriptedRun::FailPermanent(message) => Ok(GenerationStatus::Failed {
                message,
                retriable: false,
            }),
        }
    }
}
