//! Entity records for the muvid-vg pipeline
//!
//! Plain data records; persistence lives in `crate::db`, validation of
//! cross-entity preconditions lives with the operation that needs it.

mod analysis;
mod clip;
mod composition;
mod job;
mod plan;
mod song;

pub use analysis::{MoodVector, Section, SectionKind, SongAnalysis};
pub use clip::{Clip, ClipStatus};
pub use composition::{ComposedVideo, CompositionJob, CompositionState};
pub use job::{JobKind, JobRecord, JobStatus};
pub use plan::PlanEntry;
pub use song::{AnalysisState, Song, VideoType};
