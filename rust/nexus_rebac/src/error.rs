//! Error types for the ReBAC engine.

use std::fmt;

use thiserror::Error;

/// Which graph budget an evaluation ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphLimit {
    Depth,
    VisitedNodes,
    Duration,
}

impl fmt::Display for GraphLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GraphLimit::Depth => "depth",
            GraphLimit::VisitedNodes => "visited_nodes",
            GraphLimit::Duration => "duration",
        };
        f.write_str(name)
    }
}

/// ReBAC engine errors.
#[derive(Debug, Error)]
pub enum RebacError {
    /// Namespace config references an undefined relation or permission.
    #[error("schema error in namespace '{object_type}': {message}")]
    Schema {
        object_type: String,
        message: String,
    },

    /// Tuple with the same (subject, relation, object, zone) already exists.
    #[error("duplicate tuple: {0}")]
    DuplicateTuple(String),

    /// Evaluation exceeded a depth / fan-out / time budget.
    #[error("graph limit exceeded: {limit} (limit {max})")]
    GraphLimitExceeded {
        limit: GraphLimit,
        /// The configured bound that was hit (depth, nodes, or milliseconds).
        max: u64,
    },

    /// A relation outside the allow-list tried to resolve across zones.
    #[error("cross-zone violation: '{relation}' crosses zone '{from_zone}' into '{to_zone}'")]
    CrossZoneViolation {
        relation: String,
        from_zone: String,
        to_zone: String,
    },

    /// Waiting for a zone revision timed out.
    #[error("zone '{zone_id}' not at revision {min_revision} after {timeout_ms}ms (at {current})")]
    StaleConsistencyTimeout {
        zone_id: String,
        min_revision: u64,
        current: u64,
        timeout_ms: u64,
    },

    /// Consistency token is malformed or fails its tamper check.
    #[error("invalid consistency token: {0}")]
    InvalidToken(String),

    /// Tuple repository unavailable or transaction conflict.
    #[error("storage error: {0}")]
    Storage(String),

    /// Malformed request argument, e.g. an invalid glob pattern.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Engine configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RebacError {
    pub(crate) fn schema(object_type: &str, message: impl Into<String>) -> Self {
        RebacError::Schema {
            object_type: object_type.to_string(),
            message: message.into(),
        }
    }

    /// Stable label for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            RebacError::Schema { .. } => "schema",
            RebacError::DuplicateTuple(_) => "duplicate_tuple",
            RebacError::GraphLimitExceeded { .. } => "graph_limit_exceeded",
            RebacError::CrossZoneViolation { .. } => "cross_zone_violation",
            RebacError::StaleConsistencyTimeout { .. } => "stale_consistency_timeout",
            RebacError::InvalidToken(_) => "invalid_token",
            RebacError::Storage(_) => "storage",
            RebacError::InvalidRequest(_) => "invalid_request",
            RebacError::Config(_) => "config",
            RebacError::Serialization(_) => "serialization",
        }
    }

    /// Storage failures are the only errors a read may be retried on.
    pub fn is_retryable_read(&self) -> bool {
        matches!(self, RebacError::Storage(_))
    }
}

/// Result type for ReBAC operations.
pub type Result<T> = std::result::Result<T, RebacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct_for_deny_signals() {
        let limit = RebacError::GraphLimitExceeded {
            limit: GraphLimit::Depth,
            max: 5,
        };
        let cross = RebacError::CrossZoneViolation {
            relation: "viewer".into(),
            from_zone: "a".into(),
            to_zone: "b".into(),
        };
        assert_ne!(limit.kind(), cross.kind());
        assert_eq!(limit.to_string(), "graph limit exceeded: depth (limit 5)");
    }

    #[test]
    fn only_storage_is_retryable() {
        assert!(RebacError::Storage("down".into()).is_retryable_read());
        assert!(!RebacError::DuplicateTuple("x".into()).is_retryable_read());
    }
}
