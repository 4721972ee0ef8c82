//! muvid-common - Shared types and utilities for the muvid services
//!
//! Provides the common error type, the event bus used for SSE progress
//! broadcasting, configuration resolution, and SSE stream helpers.

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
