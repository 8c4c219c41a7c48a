//! Error type definitions for the EPG viewer application
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

mod types;

pub use types::{AppError, SourceError, WebError};

/// Convenience result alias used across the crate
pub type AppResult<T> = Result<T, AppError>;
