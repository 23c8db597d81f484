//! Error types for migpart

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for migpart
#[derive(Error, Debug)]
pub enum PartitionError {
    /// Host topology could not be discovered
    #[error("Topology error: {0}")]
    Topology(String),

    /// Not enough CPUs or GPU slices for the requested partitions
    #[error(
        "Insufficient resources: only {available} {resource} available, {requested} required; {hint}"
    )]
    InsufficientResources {
        resource: &'static str,
        available: usize,
        requested: usize,
        hint: &'static str,
    },

    /// The resource-control filesystem is not mounted
    #[error(
        "Store unavailable: no cgroup v2 hierarchy at {}; mount cgroup2 there or set [cgroup] root in the config",
        .root.display()
    )]
    StoreUnavailable { root: PathBuf },

    /// Launch referenced a partition that was never set up
    #[error("Unknown partition {index}: {reason}; run `migpart setup` first")]
    UnknownPartition { index: u32, reason: String },

    /// The live GPU slice list no longer covers this index
    #[error(
        "GPU slice for partition {index} unresolved: only {available} slices are instantiated now; recreate the missing slices or re-run `migpart setup`"
    )]
    GpuSliceUnresolved { index: u32, available: usize },

    /// The spawned process could not be moved into its group
    #[error(
        "Failed to attach pid {pid} to partition {index} after {attempts} attempts: {reason}"
    )]
    CgroupAttachFailed {
        index: u32,
        pid: u32,
        attempts: u32,
        reason: String,
    },

    /// Operation needs privileges the caller does not have
    #[error("Permission denied: {0}; re-run as root")]
    PermissionDenied(String),

    /// `run_as` named a user that does not exist
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// A plan violated one of its invariants
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed id list or tool output
    #[error("Parse error: {0}")]
    Parse(String),

    /// The workload could not be started
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A control file could not be written
    #[error("Failed to write '{value}' to {}: {source}", .path.display())]
    ControlWrite {
        path: PathBuf,
        value: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for migpart operations
pub type PartitionResult<T> = Result<T, PartitionError>;

impl PartitionError {
    /// Process exit code the CLI reports for this error.
    ///
    /// Follows the shell convention: 127 for a missing command, 126 for a
    /// command that cannot be executed, 125 for any launcher failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PartitionError::Spawn { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => 127,
                std::io::ErrorKind::PermissionDenied => 126,
                _ => 125,
            },
            _ => 125,
        }
    }

    /// Whether the error only degrades isolation rather than aborting
    pub fn is_degraded(&self) -> bool {
        matches!(self, PartitionError::CgroupAttachFailed { .. })
    }
}

impl From<serde_json::Error> for PartitionError {
    fn from(err: serde_json::Error) -> Self {
        PartitionError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PartitionError {
    fn from(err: toml::de::Error) -> Self {
        PartitionError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PartitionError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");
    }

    #[test]
    fn test_insufficient_resources_names_shortfall() {
        let err = PartitionError::InsufficientResources {
            resource: "GPU slices",
            available: 0,
            requested: 7,
            hint: "create MIG instances first",
        };
        let msg = err.to_string();
        assert!(msg.contains("only 0 GPU slices available"));
        assert!(msg.contains("7 required"));
        assert!(msg.contains("create MIG instances first"));
    }

    #[test]
    fn test_gpu_slice_unresolved_names_index() {
        let err = PartitionError::GpuSliceUnresolved {
            index: 6,
            available: 5,
        };
        assert!(err.to_string().contains("partition 6"));
        assert!(err.to_string().contains("only 5 slices"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PartitionError = io_err.into();
        assert!(matches!(err, PartitionError::Io(_)));
    }

    #[test]
    fn test_exit_codes() {
        let missing = PartitionError::Spawn {
            command: "nope".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(missing.exit_code(), 127);

        let denied = PartitionError::Spawn {
            command: "/etc/passwd".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(denied.exit_code(), 126);

        let unknown = PartitionError::UnknownPartition {
            index: 3,
            reason: "group missing".to_string(),
        };
        assert_eq!(unknown.exit_code(), 125);
    }

    #[test]
    fn test_attach_failure_is_degraded() {
        let err = PartitionError::CgroupAttachFailed {
            index: 0,
            pid: 42,
            attempts: 20,
            reason: "No such process".to_string(),
        };
        assert!(err.is_degraded());
        assert!(!PartitionError::Topology("none".to_string()).is_degraded());
    }
}
