//! Error taxonomy for scan requests.
//!
//! Per-capability failures are not represented here: they are embedded in the
//! scan outcome keyed by capability name and never abort sibling
//! capabilities. Storage and background failures are logged and swallowed.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// Path does not exist or could not be resolved.
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// Path resolves outside the allowed root set.
    #[error("forbidden: {0}")]
    Forbidden(PathBuf),

    /// Content failed corruption validation; nothing was persisted.
    #[error("corrupt content: {0}")]
    Corrupt(String),

    /// Admission denied; heavy capabilities were skipped this round.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An engine could not be loaded (missing weights, missing runtime).
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Persistence failed; the in-memory result is still valid.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// An external tool (frame extraction) failed or timed out.
    #[error("external tool failure: {0}")]
    ExternalTool(String),
}
