use std::fmt;
use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::core::error::{ReconcileError, ReconcileResult};

/// Where a credential (API token, account key, CA key) is read from.
///
/// Serialized as `{"env": "NAME"}`, `{"file": "/path"}` or `{"value": "..."}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    Env(String),
    File(PathBuf),
    Value(String),
}

impl SecretSource {
    /// Reads the credential. Surrounding whitespace is trimmed; an empty value is an error.
    pub fn resolve(&self) -> ReconcileResult<Zeroizing<String>> {
        let raw = match self {
            SecretSource::Env(name) => std::env::var(name).map_err(|_| {
                ReconcileError::Configuration(format!("environment variable '{name}' is not set"))
            })?,
            SecretSource::File(path) => {
                check_permissions(path);
                std::fs::read_to_string(path).map_err(|err| {
                    ReconcileError::Configuration(format!(
                        "failed to read credential file '{}': {err}",
                        path.display()
                    ))
                })?
            }
            SecretSource::Value(value) => value.clone(),
        };
        let raw = Zeroizing::new(raw);
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ReconcileError::Configuration(format!(
                "credential from {} is empty",
                self.describe()
            )));
        }
        Ok(Zeroizing::new(trimmed.to_string()))
    }

    /// Human-readable origin, safe to log.
    pub fn describe(&self) -> String {
        match self {
            SecretSource::Env(name) => format!("env:{name}"),
            SecretSource::File(path) => format!("file:{}", path.display()),
            SecretSource::Value(_) => "inline value".to_string(),
        }
    }
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretSource::Value(_) => f.write_str("Value(<redacted>)"),
            other => f.write_str(&other.describe()),
        }
    }
}

#[cfg(unix)]
fn check_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                "[secrets] credential file {} has permissive mode {:o} (expected 0600 or 0400)",
                path.display(),
                mode
            );
        }
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &std::path::Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn parses_externally_tagged_json() {
        let source: SecretSource = serde_json::from_str(r#"{"env": "CF_TOKEN"}"#).unwrap();
        assert_eq!(source, SecretSource::Env("CF_TOKEN".into()));
        let source: SecretSource = serde_json::from_str(r#"{"file": "/run/token"}"#).unwrap();
        assert_eq!(source, SecretSource::File("/run/token".into()));
    }

    #[test]
    fn resolves_inline_value_trimmed() {
        let source = SecretSource::Value("  abc123\n".into());
        assert_eq!(source.resolve().unwrap().as_str(), "abc123");
    }

    #[test]
    fn resolves_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "token-from-file").unwrap();
        let source = SecretSource::File(file.path().to_path_buf());
        assert_eq!(source.resolve().unwrap().as_str(), "token-from-file");
    }

    #[test]
    fn missing_env_is_configuration_error() {
        let source = SecretSource::Env("CERT_RECONCILER_TEST_UNSET_VARIABLE".into());
        let err = source.resolve().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn empty_value_is_rejected() {
        assert!(SecretSource::Value("   ".into()).resolve().is_err());
    }

    #[test]
    fn debug_redacts_inline_values() {
        let rendered = format!("{:?}", SecretSource::Value("hunter2".into()));
        assert!(!rendered.contains("hunter2"));
    }
}
