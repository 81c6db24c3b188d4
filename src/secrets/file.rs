//! Directory-backed store: one JSON bundle per secret, replaced by rename.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use super::store::{SecretStore, SecretStoreError, validate_secret_name};
use crate::core::types::IssuedCertificate;

pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn bundle_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    async fn blocking<T, F>(f: F) -> Result<T, SecretStoreError>
    where
        F: FnOnce() -> Result<T, SecretStoreError> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| SecretStoreError::Unavailable(format!("blocking task failed: {err}")))?
    }
}

/// Writes `content` to a sibling temp file, syncs it, then renames it over
/// `path`. Readers opening `path` see either the old or the new bundle.
fn write_atomically(dir: &Path, path: &Path, name: &str, content: &[u8]) -> Result<(), SecretStoreError> {
    fs::create_dir_all(dir).map_err(|err| SecretStoreError::store(name, err))?;
    let temp_path = dir.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let written = options.open(&temp_path).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(SecretStoreError::store(name, err));
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(SecretStoreError::store(name, err));
    }
    // Persist the rename itself.
    if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
        warn!("[secrets] unable to sync {}: {}", dir.display(), err);
    }
    Ok(())
}

#[async_trait]
impl SecretStore for FileSecretStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn put(&self, name: &str, certificate: &IssuedCertificate) -> Result<(), SecretStoreError> {
        validate_secret_name(name)?;
        let content = serde_json::to_vec(certificate).map_err(|err| SecretStoreError::store(name, err))?;
        let dir = self.dir.clone();
        let path = self.bundle_path(name);
        let owned = name.to_string();
        Self::blocking(move || write_atomically(&dir, &path, &owned, &content)).await?;
        debug!("[secrets] file: wrote {} (serial {})", name, certificate.serial);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Arc<IssuedCertificate>>, SecretStoreError> {
        validate_secret_name(name)?;
        let path = self.bundle_path(name);
        let owned = name.to_string();
        Self::blocking(move || match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<IssuedCertificate>(&bytes)
                .map(|certificate| Some(Arc::new(certificate)))
                .map_err(|err| SecretStoreError::Corrupt {
                    secret: owned,
                    message: err.to_string(),
                }),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(SecretStoreError::store(&owned, err)),
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        validate_secret_name(name)?;
        let path = self.bundle_path(name);
        let owned = name.to_string();
        Self::blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(SecretStoreError::store(&owned, err)),
        })
        .await
    }
}
