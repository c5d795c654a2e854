//! WolfHA Error Types

use thiserror::Error;

/// Result type alias for WolfHA operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfHA error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Consensus errors
    #[error("Quorum not reached: {reached}/{required}")]
    QuorumNotReached { reached: usize, required: usize },

    #[error("Cannot reach consensus quorum: {0}")]
    Connectivity(String),

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Subscription lagged, {0} events skipped")]
    Lagged(u64),

    // Membership errors
    #[error("Node {node_id} is already active in namespace {namespace}")]
    DuplicateNode { namespace: String, node_id: String },

    #[error("Namespace unavailable: {0}")]
    NamespaceUnavailable(String),

    // Election errors
    #[error("Leadership of {namespace}/{route} is ambiguous: {reason}")]
    AmbiguousLeadership {
        namespace: String,
        route: String,
        reason: String,
    },

    #[error("Not leader for route {0}")]
    NotLeader(String),

    #[error("Already contending for route {0}")]
    AlreadyContending(String),

    // Route errors
    #[error("Route {route} failed to {action}: {reason}")]
    Activation {
        route: String,
        action: &'static str,
        reason: String,
    },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::QuorumNotReached { .. }
                | Error::Connectivity(_)
                | Error::Lagged(_)
        )
    }

    /// Check if this error means a leader can no longer trust its lock
    pub fn should_step_down(&self) -> bool {
        matches!(
            self,
            Error::SessionExpired(_)
                | Error::UnknownSession(_)
                | Error::AmbiguousLeadership { .. }
                | Error::QuorumNotReached { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let quorum = Error::QuorumNotReached { reached: 1, required: 2 };
        assert!(quorum.is_retryable());
        assert!(quorum.should_step_down());

        let duplicate = Error::DuplicateNode {
            namespace: "ns".into(),
            node_id: "n0".into(),
        };
        assert!(!duplicate.is_retryable());
        assert!(!duplicate.should_step_down());

        assert!(Error::SessionExpired("s".into()).should_step_down());
        assert!(!Error::SessionExpired("s".into()).is_retryable());
    }
}
