use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::debug;

use super::store::{SecretStore, SecretStoreError, validate_secret_name};
use crate::core::types::IssuedCertificate;

/// Process-local store. Each write swaps the shared pointer for the name.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, Arc<IssuedCertificate>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.secrets
            .read()
            .map(|secrets| secrets.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn poisoned() -> SecretStoreError {
        SecretStoreError::Unavailable("memory secret table poisoned".into())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, name: &str, certificate: &IssuedCertificate) -> Result<(), SecretStoreError> {
        validate_secret_name(name)?;
        let bundle = Arc::new(certificate.clone());
        let previous = self
            .secrets
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(name.to_string(), bundle);
        debug!(
            "[secrets] memory: {} now serial {} (previous {:?})",
            name,
            certificate.serial,
            previous.as_ref().map(|p| p.serial.as_str())
        );
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Arc<IssuedCertificate>>, SecretStoreError> {
        Ok(self
            .secrets
            .read()
            .map_err(|_| Self::poisoned())?
            .get(name)
            .cloned())
    }

    async fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        self.secrets
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(name);
        Ok(())
    }
}
