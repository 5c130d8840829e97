//! Typed errors for the paper pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so every failure the
//! orchestrator records per document can be matched on exhaustively.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::outcome::Stage;

/// Which spending ceiling a call would have exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ceiling {
    Daily,
    Total,
}

impl std::fmt::Display for Ceiling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ceiling::Daily => f.write_str("daily"),
            Ceiling::Total => f.write_str("total"),
        }
    }
}

/// Transient failure classes. All of these are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    ServerError,
    RateLimited,
    Network,
}

/// Non-retryable failure classes. These trigger immediate fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    Unauthorized,
    MalformedRequest,
    Other,
}

/// Errors reported by a single LLM provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Retryable within the resilience layer
    #[error("transient provider error ({kind:?}): {message}")]
    Transient {
        kind: TransientKind,
        message: String,
        /// Server-suggested wait before the next attempt
        retry_after: Option<Duration>,
    },

    /// Not retryable; the layer falls back to the next provider
    #[error("fatal provider error ({kind:?}): {message}")]
    Fatal { kind: FatalKind, message: String },
}

impl ProviderError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        Self::Fatal {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::transient(
            TransientKind::Timeout,
            format!("no response after {}ms", after.as_millis()),
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            Self::Fatal { .. } => None,
        }
    }
}

/// What happened when the resilience layer tried one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Breaker was open; no network call was made
    ShortCircuited,
    /// Call was made and failed
    Failed { message: String, retryable: bool },
}

/// Errors surfaced by the LLM resilience layer.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Blocked before the call was made
    #[error("{ceiling} cost ceiling would be exceeded: projected {projected}, remaining {remaining}")]
    CostLimitExceeded {
        ceiling: Ceiling,
        projected: Decimal,
        remaining: Decimal,
    },

    /// Every provider in the fallback chain failed or was short-circuited
    #[error("all providers unavailable after {} attempt(s)", .attempts.len())]
    AllProvidersUnavailable { attempts: Vec<ProviderAttempt> },

    /// The fallback chain is empty
    #[error("no LLM providers configured")]
    NoProviders,
}

/// Errors from the registry store. Any of these is fatal for the current run.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("registry file {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Error returned by an external stage collaborator (acquisition, conversion).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
    pub retryable: bool,
}

impl CollaboratorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Per-document stage failures. Never terminate the run.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("{stage} timed out after {}ms", .after.as_millis())]
    Timeout { stage: Stage, after: Duration },

    #[error("{stage} failed: {source}")]
    Failed {
        stage: Stage,
        #[source]
        source: CollaboratorError,
    },

    #[error("extraction failed: {0}")]
    Llm(#[from] LlmError),

    /// LLM-dependent work is halted for the rest of the run
    #[error("extraction halted: {reason}")]
    Halted { reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl StageError {
    /// Whether the orchestrator may retry the stage invocation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Failed { source, .. } => source.retryable,
            Self::Llm(_) | Self::Halted { .. } | Self::Cancelled => false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    Missing(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Run-level errors returned by the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The registry could not be written; previously committed state is intact
    #[error("registry write failure: {0}")]
    Registry(#[from] RegistryError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Result type alias for LLM layer operations.
pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Result type alias for pipeline runs.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(ProviderError::transient(TransientKind::RateLimited, "slow down").is_retryable());
        assert!(ProviderError::timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ProviderError::fatal(FatalKind::Unauthorized, "bad key").is_retryable());
    }

    #[test]
    fn test_stage_error_retry_classification() {
        let timeout = StageError::Timeout {
            stage: Stage::Acquisition,
            after: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());

        let permanent = StageError::Failed {
            stage: Stage::Conversion,
            source: CollaboratorError::permanent("not a pdf"),
        };
        assert!(!permanent.is_retryable());

        let llm = StageError::Llm(LlmError::NoProviders);
        assert!(!llm.is_retryable());
    }

    #[test]
    fn test_cost_limit_message() {
        let err = LlmError::CostLimitExceeded {
            ceiling: Ceiling::Daily,
            projected: Decimal::new(150, 2),
            remaining: Decimal::new(50, 2),
        };
        assert_eq!(
            err.to_string(),
            "daily cost ceiling would be exceeded: projected 1.50, remaining 0.50"
        );
    }
}
