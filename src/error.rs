//! Error types for the GPU node driver
//!
//! Provides structured error types for all driver components including
//! the allocation record client, device state management, and the
//! stale-state reconciliation loop.

use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Allocation record not found for node {node}")]
    RecordNotFound { node: String },

    #[error("Conflicting write to allocation record (stale version {version})")]
    Conflict { version: String },

    #[error("Allocation record update failed after {attempts} conflict retries")]
    RetriesExhausted { attempts: usize },

    // =========================================================================
    // Record Consistency Errors
    // =========================================================================
    #[error("Unexpected number of allocation record objects from list: {count}")]
    UnexpectedRecordCount { count: usize },

    #[error("Malformed watch event: {0}")]
    MalformedWatchEvent(String),

    #[error("Watch resume version {version} is no longer available")]
    ExpiredWatchVersion { version: String },

    // =========================================================================
    // Claim Lifecycle Errors
    // =========================================================================
    #[error("Error checking if claim {claim_uid} is already prepared: {source}")]
    CheckPrepared {
        claim_uid: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Error preparing devices for claim {claim_uid}: {source}")]
    PrepareClaim {
        claim_uid: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Error unpreparing devices for claim {claim_uid}: {source}")]
    UnprepareClaim {
        claim_uid: String,
        #[source]
        source: Box<Error>,
    },

    #[error("No allocation recorded for claim {claim_uid}")]
    ClaimNotAllocated { claim_uid: String },

    #[error("Allocation for claim {claim_uid} names no devices")]
    EmptyAllocation { claim_uid: String },

    // =========================================================================
    // Device Errors
    // =========================================================================
    #[error("Device discovery failed: {0}")]
    DeviceDiscovery(String),

    #[error("Unknown device: {uuid}")]
    UnknownDevice { uuid: String },

    #[error("Device {uuid} is already reserved for claim {claim_uid}")]
    DeviceBusy { uuid: String, claim_uid: String },

    #[error("CDI spec error for claim {claim_uid}: {reason}")]
    CdiSpec { claim_uid: String, reason: String },

    // =========================================================================
    // Cleanup Errors
    // =========================================================================
    #[error("Stale-state cleanup encountered {count} errors")]
    CleanupErrors { count: usize },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on a failed record operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry the whole read-modify-write sequence from a fresh read
    RetryFromFresh,
    /// Surface to the caller; retrying without new input cannot help
    Surface,
    /// Log, pause, and fall back to a full resync
    Resync,
}

impl Error {
    /// Whether this error is an optimistic-concurrency conflict.
    ///
    /// Conflicts are the only errors the update protocol retries: the write
    /// raced another writer and must be recomputed from a fresh read. The
    /// Kubernetes API reports both stale-version writes and create races as
    /// HTTP 409.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        if self.is_conflict() {
            return ErrorAction::RetryFromFresh;
        }

        match self {
            // Data-consistency errors abandon the current pass
            Error::UnexpectedRecordCount { .. }
            | Error::MalformedWatchEvent(_)
            | Error::ExpiredWatchVersion { .. } => ErrorAction::Resync,

            // Everything else is surfaced to the immediate caller
            _ => ErrorAction::Surface,
        }
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_detection() {
        let err = Error::Conflict {
            version: "42".into(),
        };
        assert!(err.is_conflict());
        assert_eq!(err.action(), ErrorAction::RetryFromFresh);

        let api_conflict = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        }));
        assert!(api_conflict.is_conflict());

        let not_found = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "not found".into(),
            reason: "NotFound".into(),
            code: 404,
        }));
        assert!(!not_found.is_conflict());
    }

    #[test]
    fn test_error_actions() {
        let err = Error::UnexpectedRecordCount { count: 0 };
        assert_eq!(err.action(), ErrorAction::Resync);

        let err = Error::ClaimNotAllocated {
            claim_uid: "claim-1".into(),
        };
        assert_eq!(err.action(), ErrorAction::Surface);

        let err = Error::CleanupErrors { count: 3 };
        assert_eq!(err.action(), ErrorAction::Surface);
    }

    #[test]
    fn test_phase_wrapping_preserves_source() {
        let err = Error::PrepareClaim {
            claim_uid: "claim-1".into(),
            source: Box::new(Error::UnknownDevice {
                uuid: "gpu-0".into(),
            }),
        };
        assert!(err.to_string().contains("claim-1"));
        let source = std::error::Error::source(&err).expect("wrapped source");
        assert!(source.to_string().contains("gpu-0"));
    }
}
