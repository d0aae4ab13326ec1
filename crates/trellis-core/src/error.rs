use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    // Transient faults
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    // Policy errors
    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    // Node errors
    #[error("Node execution failed: {node}: {message}")]
    Execution { node: String, message: String },

    #[error("Node produced an empty result: {0}")]
    EmptyResult(String),

    #[error("Node produced an untrusted result: {0}")]
    UntrustedResult(String),

    // Graph errors
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Node not found in graph: {0}")]
    UnknownNode(String),

    #[error("Edge condition failed: {from} -> {to}: {message}")]
    Condition {
        from: String,
        to: String,
        message: String,
    },

    // Checkpoint errors
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // Cancellation
    #[error("Run aborted: {reason}")]
    Aborted { reason: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("{0}")]
    Other(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrellisError>;

/// Error taxonomy used for retry decisions and event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Permission,
    Validation,
    Execution,
    EmptyResult,
    UntrustedResult,
    BudgetExceeded,
    Unknown,
}

impl ErrorKind {
    /// Whether errors of this kind are transient by default.
    ///
    /// Permission, validation and budget errors are policy decisions and
    /// retrying them cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Execution)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Permission => "permission",
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::EmptyResult => "empty_result",
            Self::UntrustedResult => "untrusted_result",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TrellisError {
    /// Classify this error into the retry taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Io(e) if is_network_io(e) => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::Permission
            }
            Self::Validation(_) | Self::Json(_) => ErrorKind::Validation,
            Self::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            Self::Execution { .. }
            | Self::UnknownNode(_)
            | Self::Condition { .. }
            | Self::Persistence(_) => ErrorKind::Execution,
            Self::EmptyResult(_) => ErrorKind::EmptyResult,
            Self::UntrustedResult(_) => ErrorKind::UntrustedResult,
            Self::InvalidGraph(_)
            | Self::CheckpointNotFound(_)
            | Self::Aborted { .. }
            | Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Other(_)
            | Self::Io(_) => ErrorKind::Unknown,
        }
    }

    /// Whether this error came from cooperative cancellation.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Shorthand for a node-level execution failure.
    pub fn execution(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            node: node.into(),
            message: message.into(),
        }
    }

    /// JSON payload describing this error, stored alongside failure events.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
            "aborted": self.is_abort(),
        })
    }
}

fn is_network_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind as K;
    matches!(
        e.kind(),
        K::ConnectionRefused | K::ConnectionReset | K::ConnectionAborted | K::NotConnected
            | K::BrokenPipe
    )
}
