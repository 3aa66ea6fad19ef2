use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    /// The sample came from a replica other than the currently elected one.
    /// This is an expected rejection on the write path, not a failure.
    #[error("replicas did not match, rejecting sample: replica={replica}, elected={elected}")]
    ReplicasNotMatch { replica: String, elected: String },

    /// Accepting the sample would push the tenant over its replica group cap.
    #[error("too many HA replica groups (limit: {limit})")]
    TooManyReplicaGroups { limit: usize },

    #[error("invalid HA tracker config: {0}")]
    InvalidConfig(String),

    /// Transient KV store failure. Callers may retry the write.
    #[error("KV store operation failed: {0}")]
    Kv(String),

    #[error("failed to decode replica descriptor: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl TrackerError {
    /// True for rejections caused by an intentionally aborted operation.
    /// Telemetry layers use this to classify deduplicated samples as
    /// expected rather than as errors.
    pub fn is_operation_aborted(&self) -> bool {
        matches!(self, TrackerError::ReplicasNotMatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicas_not_match_is_aborted() {
        let err = TrackerError::ReplicasNotMatch {
            replica: "r2".to_string(),
            elected: "r1".to_string(),
        };
        assert!(err.is_operation_aborted());
        assert_eq!(
            err.to_string(),
            "replicas did not match, rejecting sample: replica=r2, elected=r1"
        );
    }

    #[test]
    fn test_other_errors_are_not_aborted() {
        assert!(!TrackerError::TooManyReplicaGroups { limit: 3 }.is_operation_aborted());
        assert!(!TrackerError::Kv("connection refused".to_string()).is_operation_aborted());
    }
}
