//! Clip generation
//!
//! The coordinator plans, enqueues, monitors, retries and cancels
//! per-clip generation against the external generator; the client module
//! wraps the provider API.

pub mod coordinator;
pub mod generator_client;

pub use coordinator::{
    cancel_batch, generate, plan_clips, retry_clip, run_batch_job, run_clip_job, status,
    ClipBatchStatus, PlanOutcome,
};
