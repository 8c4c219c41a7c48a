//! Utility modules for the epg-viewer application
//!
//! This module contains reusable utilities that can be used
//! across different parts of the system.

pub mod decompression;
pub mod fingerprint;
pub mod url;
pub mod xmltv_time;

// Re-export commonly used types for convenience
pub use decompression::{CompressionFormat, DecompressionService};
pub use fingerprint::FingerprintKey;
pub use url::UrlUtils;
