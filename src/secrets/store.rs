use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::error::ReconcileError;
use crate::core::types::IssuedCertificate;

/// Errors produced by secret storage backends.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret '{secret}' is unreadable: {message}")]
    Corrupt { secret: String, message: String },
    #[error("secret store error for '{secret}': {message}")]
    Store { secret: String, message: String },
}

impl SecretStoreError {
    pub fn store(secret: &str, err: impl std::fmt::Display) -> Self {
        SecretStoreError::Store {
            secret: secret.to_string(),
            message: err.to_string(),
        }
    }

    /// Classifies a failed read. Only writes report `SecretStoreWriteFailure`.
    pub fn into_read_error(self) -> ReconcileError {
        match self {
            SecretStoreError::Unavailable(message) => {
                ReconcileError::TransientNetwork(format!("secret store unavailable: {message}"))
            }
            other => ReconcileError::Internal(other.to_string()),
        }
    }
}

/// Write-path conversion.
impl From<SecretStoreError> for ReconcileError {
    fn from(err: SecretStoreError) -> Self {
        match err {
            SecretStoreError::Unavailable(message) => ReconcileError::SecretStoreWrite {
                secret: String::new(),
                message,
            },
            SecretStoreError::Corrupt { secret, message }
            | SecretStoreError::Store { secret, message } => {
                ReconcileError::SecretStoreWrite { secret, message }
            }
        }
    }
}

/// Target store for issued certificate bundles.
///
/// `put` replaces the bundle as a whole: a concurrent `get` returns either
/// the previous bundle or the new one, never a mix of the two.
#[async_trait]
pub trait SecretStore: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn put(&self, name: &str, certificate: &IssuedCertificate) -> Result<(), SecretStoreError>;

    async fn get(&self, name: &str) -> Result<Option<Arc<IssuedCertificate>>, SecretStoreError>;

    /// Removing an absent secret succeeds.
    async fn delete(&self, name: &str) -> Result<(), SecretStoreError>;
}

/// Secret names become file names and object names; keep them DNS-label-like.
pub fn validate_secret_name(name: &str) -> Result<(), SecretStoreError> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !name.starts_with(['-', '.'])
        && !name.ends_with(['-', '.']);
    if valid {
        Ok(())
    } else {
        Err(SecretStoreError::store(
            name,
            "names must be lowercase alphanumerics, '-' or '.'",
        ))
    }
}
