//! Clip boundary planning
//!
//! Pure functions: beat-aligned boundary computation and per-section
//! scene/prompt planning. No I/O here; the coordinator persists results.

pub mod beat_align;
pub mod scene;

pub use beat_align::{align_clips, AlignedClip, AlignmentResult, AlignmentStatus, BeatAlignParams};
pub use scene::{plan_scene, CameraMotion, ColorPalette, ScenePlan, ShotPattern};
