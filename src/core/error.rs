use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy used for retry decisions and status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetworkError,
    RateLimited,
    AuthorityRejected,
    ChallengePropagationTimeout,
    SecretStoreWriteFailure,
    DeadlineExceeded,
    Cancelled,
    Configuration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetworkError => "transient_network_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::AuthorityRejected => "authority_rejected",
            ErrorKind::ChallengePropagationTimeout => "challenge_propagation_timeout",
            ErrorKind::SecretStoreWriteFailure => "secret_store_write_failure",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let kind = match raw {
            "transient_network_error" => ErrorKind::TransientNetworkError,
            "rate_limited" => ErrorKind::RateLimited,
            "authority_rejected" => ErrorKind::AuthorityRejected,
            "challenge_propagation_timeout" => ErrorKind::ChallengePropagationTimeout,
            "secret_store_write_failure" => ErrorKind::SecretStoreWriteFailure,
            "deadline_exceeded" => ErrorKind::DeadlineExceeded,
            "cancelled" => ErrorKind::Cancelled,
            "configuration" => ErrorKind::Configuration,
            "internal" => ErrorKind::Internal,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether a failed order with this kind may be attempted again from `Requested`.
    pub fn is_order_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetworkError
                | ErrorKind::RateLimited
                | ErrorKind::ChallengePropagationTimeout
                | ErrorKind::DeadlineExceeded
                | ErrorKind::Internal
        )
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("rate limited by {service}{}", format_retry_after(.retry_after))]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },
    #[error("authority rejected the request: {0}")]
    AuthorityRejected(String),
    #[error("DNS propagation timeout for record '{record}' after {elapsed:?}")]
    ChallengePropagationTimeout { record: String, elapsed: Duration },
    #[error("secret store write failed for '{secret}': {message}")]
    SecretStoreWrite { secret: String, message: String },
    #[error("{phase} exceeded its deadline of {limit:?}")]
    DeadlineExceeded { phase: &'static str, limit: Duration },
    #[error("issuance cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(", retry after {}s", delay.as_secs()),
        None => String::new(),
    }
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::TransientNetwork(_) => ErrorKind::TransientNetworkError,
            ReconcileError::RateLimited { .. } => ErrorKind::RateLimited,
            ReconcileError::AuthorityRejected(_) => ErrorKind::AuthorityRejected,
            ReconcileError::ChallengePropagationTimeout { .. } => {
                ErrorKind::ChallengePropagationTimeout
            }
            ReconcileError::SecretStoreWrite { .. } => ErrorKind::SecretStoreWriteFailure,
            ReconcileError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            ReconcileError::Cancelled => ErrorKind::Cancelled,
            ReconcileError::Configuration(_) => ErrorKind::Configuration,
            ReconcileError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        ReconcileError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for ReconcileError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ReconcileError::Internal(format!("malformed response: {err}"));
        }
        ReconcileError::TransientNetwork(err.to_string())
    }
}

impl From<openssl::error::ErrorStack> for ReconcileError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        ReconcileError::Internal(format!("openssl: {err}"))
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
