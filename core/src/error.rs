//! Error types for the magnetic navigation stack.
//!
//! All fallible operations in this crate return [`NavResult`]. The error
//! kinds mirror the failure surfaces of the pipeline: input validation at
//! construction boundaries, map loading, out-of-bounds queries, and
//! numerical conditioning inside the filter. The enum is `Clone` because a
//! failed single-flight tile load hands the same error to every waiting
//! thread.

use thiserror::Error;

/// Result type for navigation operations
pub type NavResult<T> = Result<T, NavError>;

/// Errors produced by the navigation pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavError {
    /// Non-finite input, out-of-range latitude/longitude, or negative time step
    #[error("domain error: {0}")]
    Domain(String),

    /// Invalid construction parameter (window size, calibration matrix, noise spec)
    #[error("configuration error: {0}")]
    Config(String),

    /// Unreadable or inaccessible raster source
    #[error("map I/O error: {0}")]
    MapIo(String),

    /// Structurally invalid raster: non-uniform grid, missing coordinates, rotation
    #[error("map format error: {0}")]
    MapFormat(String),

    /// Query outside the interpolation stencil bounds of the loaded map
    #[error("coordinates ({lat}, {lon}) outside map bounds")]
    OutOfMap { lat: f64, lon: f64 },

    /// Numerically ill-conditioned operation that was downgraded to a no-op
    #[error("numerical conditioning: {0}")]
    Numeric(String),
}

impl NavError {
    /// True when the filter should degrade gracefully (skip the update,
    /// report zero quality) rather than surface the error to the caller.
    pub fn is_degradable(&self) -> bool {
        matches!(self, NavError::OutOfMap { .. } | NavError::Numeric(_))
    }
}
