//! Error types for the TrueNAS volume driver
//!
//! Provides structured error types for the appliance session client,
//! the naming layer, and the volume/snapshot lifecycle.

use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Appliance Session Errors
    // =========================================================================
    #[error("Appliance authentication failed: {0}")]
    Auth(String),

    #[error("Transient network error talking to appliance: {0}")]
    TransientNetwork(String),

    #[error("Appliance rejected {operation}: {message}")]
    Appliance {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid size: requested {requested_gib} GiB, {reason}")]
    InvalidSize { requested_gib: u64, reason: String },

    #[error("Unsupported image format for image {image_id}: {reason}")]
    UnsupportedFormat { image_id: String, reason: String },

    #[error("Snapshot is in use by dependent clones: {snapshot}")]
    SnapshotInUse { snapshot: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("{kind} {id} is {state}, cannot {operation}")]
    InvalidState {
        kind: String,
        id: String,
        state: String,
        operation: String,
    },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error category reported to the host framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    TransientNetwork,
    Appliance,
    CapacityExceeded,
    InvalidSize,
    UnsupportedFormat,
    SnapshotInUse,
    NotFound,
    InvalidRequest,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Auth => "auth_error",
            ErrorKind::TransientNetwork => "transient_network_error",
            ErrorKind::Appliance => "appliance_error",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::InvalidSize => "invalid_size",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::SnapshotInUse => "snapshot_in_use",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Internal => "internal_error",
        };
        write!(f, "{}", name)
    }
}

impl Error {
    /// Shorthand for a missing volume
    pub fn volume_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "Volume".into(),
            id: id.into(),
        }
    }

    /// Shorthand for a missing snapshot
    pub fn snapshot_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "Snapshot".into(),
            id: id.into(),
        }
    }

    /// Classify this error for the host framework
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Auth(_) => ErrorKind::Auth,
            Error::TransientNetwork(_) => ErrorKind::TransientNetwork,
            // An entity caught mid-transition is reported the same way the
            // appliance reports a rejected request.
            Error::Appliance { .. } | Error::InvalidState { .. } => ErrorKind::Appliance,
            Error::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            Error::InvalidSize { .. } => ErrorKind::InvalidSize,
            Error::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            Error::SnapshotInUse { .. } => ErrorKind::SnapshotInUse,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } | Error::InvalidIdentifier { .. } => {
                ErrorKind::InvalidRequest
            }
            Error::Configuration(_)
            | Error::Internal(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::Metrics(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientNetwork(_))
    }

    /// Check if the entity is left untouched by this error.
    ///
    /// Recoverable errors keep the entity in its previous state; anything
    /// else moves it to `error`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CapacityExceeded
                | ErrorKind::InvalidSize
                | ErrorKind::UnsupportedFormat
                | ErrorKind::SnapshotInUse
                | ErrorKind::InvalidRequest
        ) || matches!(self, Error::InvalidState { .. })
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::SnapshotInUse {
            snapshot: "tank/cinder/volume-1@snapshot-a".into(),
        };
        assert_eq!(err.kind(), ErrorKind::SnapshotInUse);

        let err = Error::InvalidState {
            kind: "Volume".into(),
            id: "vol-1".into(),
            state: "extending".into(),
            operation: "snapshot".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Appliance);

        let err = Error::volume_not_found("vol-1");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "Volume not found: vol-1");
    }

    #[test]
    fn test_error_transient() {
        assert!(Error::TransientNetwork("timeout".into()).is_transient());
        assert!(!Error::Auth("expired".into()).is_transient());
        assert!(!Error::Appliance {
            operation: "pool.dataset.create".into(),
            status: Some(422),
            message: "boom".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_error_recoverable() {
        assert!(Error::CapacityExceeded("no space".into()).is_recoverable());
        assert!(Error::InvalidSize {
            requested_gib: 5,
            reason: "must exceed 10 GiB".into(),
        }
        .is_recoverable());
        assert!(!Error::TransientNetwork("reset".into()).is_recoverable());
        assert!(!Error::Appliance {
            operation: "pool.dataset.update".into(),
            status: Some(500),
            message: "zfs error".into(),
        }
        .is_recoverable());
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::SnapshotInUse.to_string(), "snapshot_in_use");
        assert_eq!(ErrorKind::CapacityExceeded.to_string(), "capacity_exceeded");
    }
}
