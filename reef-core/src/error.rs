//! Reef error abstractions.

use thiserror::Error;

/// OSD reconciliation error variants.
///
/// Variants map onto how the reconciler reacts: configuration errors abort
/// the pass, target errors are collected, safety gates re-queue the item.
#[derive(Debug, Error)]
pub enum OsdError {
    /// The declared intent is impossible to act on.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// An external collaborator failed in a way which is expected to resolve on retry.
    #[error("transient error: {0}")]
    Transient(String),
    /// Provisioning or workload management failed for a single target.
    #[error("target {target} failed: {message}")]
    TargetFailed { target: String, message: String },
    /// A safety gate refused the operation, the item should be retried later.
    #[error("safety gate refused the operation: {0}")]
    SafetyGate(String),
    /// The reconciliation's cancellation signal fired.
    #[error("reconciliation canceled")]
    Canceled,
}

impl OsdError {
    /// Indicates if this error should abort the reconciliation pass as a whole.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OsdError::Configuration(_) | OsdError::Canceled)
    }
}
