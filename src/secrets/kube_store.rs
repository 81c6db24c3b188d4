//! Kubernetes `kubernetes.io/tls` secrets.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client};
use log::{debug, info};

use super::store::{SecretStore, SecretStoreError, validate_secret_name};
use crate::core::types::IssuedCertificate;
use crate::issuance::csr::inspect_certificate;

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY: &str = "tls.key";
const MANAGED_BY: &str = "cert-reconciler";
const ANNOTATION_PREFIX: &str = "cert-reconciler.io";

pub struct KubernetesSecretStore {
    api: Api<Secret>,
}

impl KubernetesSecretStore {
    /// Uses the in-cluster or kubeconfig client; `namespace` defaults to the
    /// client's namespace.
    pub async fn connect(namespace: Option<&str>) -> Result<Self, SecretStoreError> {
        let client = Client::try_default()
            .await
            .map_err(|err| SecretStoreError::Unavailable(format!("kubernetes client: {err}")))?;
        let api = match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::default_namespaced(client),
        };
        info!("[secrets] kubernetes store ready");
        Ok(Self { api })
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Builds the TLS secret; both halves of the bundle live in one object.
fn tls_secret(name: &str, certificate: &IssuedCertificate) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(
        TLS_CERT_KEY.to_string(),
        ByteString(certificate.chain_pem.as_bytes().to_vec()),
    );
    data.insert(
        TLS_PRIVATE_KEY.to_string(),
        ByteString(certificate.private_key_pem.as_bytes().to_vec()),
    );

    let labels = BTreeMap::from([(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    )]);
    let annotations = BTreeMap::from([
        (format!("{ANNOTATION_PREFIX}/serial"), certificate.serial.clone()),
        (
            format!("{ANNOTATION_PREFIX}/not-after"),
            certificate.not_after.to_rfc3339(),
        ),
        (
            format!("{ANNOTATION_PREFIX}/domains"),
            certificate.domains.join(","),
        ),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

fn bundle_from_secret(name: &str, secret: &Secret) -> Result<IssuedCertificate, SecretStoreError> {
    let corrupt = |message: String| SecretStoreError::Corrupt {
        secret: name.to_string(),
        message,
    };
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| corrupt("secret has no data".into()))?;
    let field = |key: &str| {
        data.get(key)
            .ok_or_else(|| corrupt(format!("missing {key}")))
            .and_then(|value| {
                String::from_utf8(value.0.clone()).map_err(|err| corrupt(err.to_string()))
            })
    };
    let chain = field(TLS_CERT_KEY)?;
    let key = field(TLS_PRIVATE_KEY)?;
    inspect_certificate(&chain, &key).map_err(|err| corrupt(err.to_string()))
}

#[async_trait]
impl SecretStore for KubernetesSecretStore {
    fn kind(&self) -> &'static str {
        "kubernetes"
    }

    async fn put(&self, name: &str, certificate: &IssuedCertificate) -> Result<(), SecretStoreError> {
        validate_secret_name(name)?;
        let mut secret = tls_secret(name, certificate);
        let params = PostParams::default();
        let existing = self
            .api
            .get_opt(name)
            .await
            .map_err(|err| SecretStoreError::store(name, err))?;
        match existing {
            Some(current) => {
                // Optimistic concurrency: a conflicting writer makes this fail and retry.
                secret.metadata.resource_version = current.metadata.resource_version;
                self.api
                    .replace(name, &params, &secret)
                    .await
                    .map_err(|err| SecretStoreError::store(name, err))?;
            }
            None => {
                self.api
                    .create(&params, &secret)
                    .await
                    .map_err(|err| SecretStoreError::store(name, err))?;
            }
        }
        debug!("[secrets] kubernetes: wrote {} (serial {})", name, certificate.serial);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Arc<IssuedCertificate>>, SecretStoreError> {
        let secret = self
            .api
            .get_opt(name)
            .await
            .map_err(|err| SecretStoreError::store(name, err))?;
        secret
            .map(|secret| bundle_from_secret(name, &secret).map(Arc::new))
            .transpose()
    }

    async fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(SecretStoreError::store(name, err)),
        }
    }
}
