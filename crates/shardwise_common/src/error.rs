use thiserror::Error;

use crate::types::{NodeId, ShardId};

/// Convenience alias for `Result<T, ShardwiseError>`.
pub type ShardwiseResult<T> = Result<T, ShardwiseError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`: the query or configuration cannot be served as given; retrying is pointless
/// - `Transient`: topology churn, shard failures, deadlines; the caller MAY retry after back-off
/// - `InternalBug`: should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    InternalBug,
}

/// Top-level error returned by `submit` / `explain`.
#[derive(Error, Debug)]
pub enum ShardwiseError {
    /// No usable topology snapshot.
    #[error("Stale topology: {reason}")]
    StaleTopology {
        /// Age of the held snapshot, if one exists.
        age_ms: Option<u64>,
        reason: String,
    },

    /// Classification and topology conflict; raised before any shard call.
    #[error("Planning error: {0}")]
    Planning(String),

    /// A required shard call failed and partial results were disallowed.
    #[error(
        "Shard unavailable: {} of {} shards failed: {}",
        .failed.len(),
        .shards_targeted,
        format_failures(.failed)
    )]
    ShardUnavailable {
        shards_targeted: usize,
        failed: Vec<ShardFailure>,
    },

    /// Request deadline exceeded and partial results were disallowed.
    #[error(
        "Timeout after {timeout_ms}ms: {completed} of {shards_targeted} shards completed (pending: {:?})",
        .pending
    )]
    Timeout {
        timeout_ms: u64,
        shards_targeted: usize,
        completed: usize,
        pending: Vec<ShardId>,
    },

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Internal bug; always carries a unique `error_code` for post-mortem.
    #[error("InternalBug [{error_code}]: {message}")]
    InternalBug {
        error_code: &'static str,
        message: String,
    },
}

/// One failed shard call, as listed in `ShardUnavailable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub shard_id: ShardId,
    pub node: Option<NodeId>,
    pub error: ShardError,
}

fn format_failures(failed: &[ShardFailure]) -> String {
    failed
        .iter()
        .map(|f| match &f.node {
            Some(node) => format!("{}@{}: {}", f.shard_id, node, f.error),
            None => format!("{}: {}", f.shard_id, f.error),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure of a single per-shard search call. Stored inside `ShardResult`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("no searchable copy")]
    NoActiveCopy,

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("transport: {0}")]
    Transport(String),
}

/// Failure to obtain topology or health from the cluster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology source unavailable: {0}")]
    Unavailable(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("malformed topology: {0}")]
    Malformed(String),
}

/// Configuration loading / validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── ShardwiseError classification & helpers ─────────────────────────────────

impl ShardwiseError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShardwiseError::Planning(_) => ErrorKind::UserError,
            ShardwiseError::Config(_) => ErrorKind::UserError,
            ShardwiseError::Topology(TopologyError::IndexNotFound(_)) => ErrorKind::UserError,

            ShardwiseError::StaleTopology { .. } => ErrorKind::Transient,
            ShardwiseError::ShardUnavailable { .. } => ErrorKind::Transient,
            ShardwiseError::Timeout { .. } => ErrorKind::Transient,
            ShardwiseError::Topology(_) => ErrorKind::Transient,

            ShardwiseError::InternalBug { .. } => ErrorKind::InternalBug,
        }
    }

    /// Returns true if the caller may retry. Planning errors never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ShardwiseError::StaleTopology { .. } => "stale_topology",
            ShardwiseError::Planning(_) => "planning",
            ShardwiseError::ShardUnavailable { .. } => "shard_unavailable",
            ShardwiseError::Timeout { .. } => "timeout",
            ShardwiseError::Topology(_) => "topology",
            ShardwiseError::Config(_) => "config",
            ShardwiseError::InternalBug { .. } => "internal_bug",
        }
    }

    pub fn planning(reason: impl Into<String>) -> Self {
        ShardwiseError::Planning(reason.into())
    }

    pub fn stale(age_ms: Option<u64>, reason: impl Into<String>) -> Self {
        ShardwiseError::StaleTopology {
            age_ms,
            reason: reason.into(),
        }
    }

    pub fn internal_bug(error_code: &'static str, message: impl Into<String>) -> Self {
        ShardwiseError::InternalBug {
            error_code,
            message: message.into(),
        }
    }

    /// Shards listed by `ShardUnavailable`, empty for other variants.
    pub fn failed_shards(&self) -> Vec<ShardId> {
        match self {
            ShardwiseError::ShardUnavailable { failed, .. } => {
                failed.iter().map(|f| f.shard_id).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planning_is_never_retryable() {
        let err = ShardwiseError::planning("routing key maps to unassigned shard");
        assert_eq!(err.kind(), ErrorKind::UserError);
        assert!(!err.is_retryable());
        assert!(err.is_user_error());
        assert_eq!(err.label(), "planning");
    }

    #[test]
    fn test_shard_unavailable_lists_failures() {
        let err = ShardwiseError::ShardUnavailable {
            shards_targeted: 3,
            failed: vec![
                ShardFailure {
                    shard_id: ShardId(1),
                    node: Some(NodeId::new("n2")),
                    error: ShardError::Transport("connection reset".into()),
                },
                ShardFailure {
                    shard_id: ShardId(2),
                    node: None,
                    error: ShardError::NoActiveCopy,
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 of 3 shards failed"), "{}", msg);
        assert!(msg.contains("shard:1@node:n2: transport: connection reset"), "{}", msg);
        assert!(msg.contains("shard:2: no searchable copy"), "{}", msg);
        assert!(err.is_retryable());
        assert_eq!(err.failed_shards(), vec![ShardId(1), ShardId(2)]);
    }

    #[test]
    fn test_timeout_message() {
        let err = ShardwiseError::Timeout {
            timeout_ms: 500,
            shards_targeted: 3,
            completed: 2,
            pending: vec![ShardId(0)],
        };
        assert!(err.to_string().contains("2 of 3 shards completed"));
        assert_eq!(err.label(), "timeout");
    }

    #[test]
    fn test_from_topology_error() {
        let err: ShardwiseError = TopologyError::IndexNotFound("logs".into()).into();
        assert!(err.is_user_error());
        let err: ShardwiseError = TopologyError::Unavailable("refused".into()).into();
        assert!(err.is_retryable());
    }
}
