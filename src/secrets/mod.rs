pub mod credentials;
pub mod file;
pub mod kube_store;
pub mod memory;
pub mod store;

use std::sync::Arc;

pub use file::FileSecretStore;
pub use kube_store::KubernetesSecretStore;
pub use memory::MemorySecretStore;
pub use store::{SecretStore, SecretStoreError};

use crate::config::SecretStoreConfig;

/// Builds the configured target store.
pub async fn create_secret_store(
    config: &SecretStoreConfig,
) -> Result<Arc<dyn SecretStore>, SecretStoreError> {
    let store: Arc<dyn SecretStore> = match config {
        SecretStoreConfig::Memory => {
            log::warn!("[secrets] using the in-memory secret store; certificates are lost on exit");
            Arc::new(MemorySecretStore::new())
        }
        SecretStoreConfig::File { path } => {
            log::info!("[secrets] using file secret store at {}", path.display());
            Arc::new(FileSecretStore::new(path.clone()))
        }
        SecretStoreConfig::Kubernetes { namespace } => {
            Arc::new(KubernetesSecretStore::connect(namespace.as_deref()).await?)
        }
    };
    Ok(store)
}
