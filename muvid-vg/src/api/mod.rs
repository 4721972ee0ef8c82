//! HTTP API handlers for muvid-vg
//!
//! Handlers are thin adapters: validate, call into the core, translate
//! errors onto status codes. Anything that can take longer than a few
//! hundred milliseconds is enqueued, never awaited inline.

pub mod analysis;
pub mod blobs;
pub mod clips;
pub mod compose;
pub mod health;
pub mod jobs;
pub mod songs;
pub mod sse;

pub use analysis::analysis_routes;
pub use blobs::blob_routes;
pub use clips::clip_routes;
pub use compose::compose_routes;
pub use health::health_routes;
pub use jobs::job_routes;
pub use songs::song_routes;
pub use sse::event_stream;
