// src/error.rs

use thiserror::Error;

/// Domain errors for the analytics core.
///
/// Policy per kind:
/// - `Configuration`: the owning feature fails fast and reports itself
///   disabled; the rest of the core proceeds.
/// - `GeometryDegenerate`: caller substitutes a flagged fallback constant,
///   warns, and continues.
/// - `DependencyUnavailable`: log and drop the single affected artifact;
///   never block or retry on the frame path.
/// - `UnknownReference`: silently ignored at the call site.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("configuration error in {feature}: {reason}")]
    Configuration { feature: &'static str, reason: String },

    #[error("degenerate geometry: {0}")]
    GeometryDegenerate(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("unknown reference: {kind} id {id}")]
    UnknownReference { kind: &'static str, id: u64 },
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
