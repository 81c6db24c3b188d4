//! RFC 8555 client for DNS-01 issuance.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use log::{debug, info, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tokio::time::Instant;

use super::CertificateAuthority;
use super::jws::{AccountKey, KeyId, build_jws};
use crate::core::error::{ErrorKind, ReconcileError, ReconcileResult};
use crate::core::types::{Challenge, ChallengeStatus, IssuedCertificate, Order, OrderStatus};
use crate::issuance::csr::{CertificateSigningRequest, parse_issued_certificate};
use crate::issuance::http::{HttpClient, StatusClass, classify, parse_retry_after};

const REPLAY_NONCE: &str = "replay-nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";
const BAD_NONCE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Directory {
    new_nonce: String,
    new_account: String,
    new_order: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Identifier {
    value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Problem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    detail: String,
}

impl Problem {
    fn is(&self, name: &str) -> bool {
        self.kind.rsplit(':').next() == Some(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OrderResource {
    status: OrderStatus,
    #[serde(default)]
    authorizations: Vec<String>,
    finalize: String,
    #[serde(default)]
    certificate: Option<String>,
    #[serde(default)]
    error: Option<Problem>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthorizationResource {
    identifier: Identifier,
    status: String,
    #[serde(default)]
    wildcard: bool,
    #[serde(default)]
    challenges: Vec<ChallengeResource>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChallengeResource {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    #[serde(default)]
    token: Option<String>,
    status: String,
}

struct AcmeResponse {
    location: Option<String>,
    body: String,
}

impl AcmeResponse {
    fn json<T: DeserializeOwned>(&self) -> ReconcileResult<T> {
        serde_json::from_str(&self.body)
            .map_err(|err| ReconcileError::Internal(format!("malformed ACME response: {err}")))
    }
}

pub struct AcmeAuthority {
    name: String,
    directory_url: String,
    contact_email: Option<String>,
    tos_agreed: bool,
    key: AccountKey,
    poll_interval: Duration,
    poll_timeout: Duration,
    directory: OnceCell<Directory>,
    account_url: OnceCell<String>,
    nonce: Mutex<Option<String>>,
}

impl AcmeAuthority {
    pub fn new(name: &str, directory_url: &str, key: AccountKey) -> Self {
        Self {
            name: name.to_string(),
            directory_url: directory_url.to_string(),
            contact_email: None,
            tos_agreed: false,
            key,
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(300),
            directory: OnceCell::new(),
            account_url: OnceCell::new(),
            nonce: Mutex::new(None),
        }
    }

    pub fn with_contact(mut self, contact_email: Option<String>) -> Self {
        self.contact_email = contact_email;
        self
    }

    pub fn with_tos_agreed(mut self, agreed: bool) -> Self {
        self.tos_agreed = agreed;
        self
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    pub fn thumbprint(&self) -> &str {
        self.key.thumbprint()
    }

    async fn directory(&self) -> ReconcileResult<&Directory> {
        self.directory
            .get_or_try_init(|| async move {
                let response = HttpClient::shared().get(&self.directory_url).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let headers = response.headers().clone();
                    let body = response.text().await.unwrap_or_default();
                    return Err(problem_error(status, &headers, &body));
                }
                debug!("[acme] loaded directory {}", self.directory_url);
                Ok(response.json::<Directory>().await?)
            })
            .await
    }

    fn store_nonce(&self, headers: &HeaderMap) {
        let nonce = headers
            .get(REPLAY_NONCE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if let (Some(nonce), Ok(mut slot)) = (nonce, self.nonce.lock()) {
            *slot = Some(nonce);
        }
    }

    fn take_nonce(&self) -> Option<String> {
        self.nonce.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Reuses the last `Replay-Nonce`, or asks `newNonce` for one.
    async fn nonce(&self) -> ReconcileResult<String> {
        if let Some(nonce) = self.take_nonce() {
            return Ok(nonce);
        }
        let directory = self.directory().await?;
        let response = HttpClient::shared().head(&directory.new_nonce).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let headers = response.headers().clone();
            return Err(problem_error(status, &headers, ""));
        }
        response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ReconcileError::TransientNetwork("newNonce returned no Replay-Nonce".into()))
    }

    async fn account_url(&self) -> ReconcileResult<&str> {
        self.account_url
            .get_or_try_init(|| self.register_account())
            .await
            .map(String::as_str)
    }

    async fn register_account(&self) -> ReconcileResult<String> {
        let directory = self.directory().await?;
        let mut payload = json!({"termsOfServiceAgreed": self.tos_agreed});
        if let Some(email) = &self.contact_email {
            payload["contact"] = json!([format!("mailto:{email}")]);
        }
        let response = self
            .post(&directory.new_account, Some(&payload), KeyId::Jwk, None)
            .await?;
        let account = response.location.ok_or_else(|| {
            ReconcileError::AuthorityRejected("newAccount response has no Location".into())
        })?;
        info!("[acme] {} using account {}", self.name, account);
        Ok(account)
    }

    /// Signed POST. `payload` of `None` is POST-as-GET. A `badNonce` problem
    /// is retried with a fresh nonce; every other failure is mapped by
    /// [`problem_error`] and left to the caller's retry policy.
    async fn post(
        &self,
        url: &str,
        payload: Option<&Value>,
        key_id: KeyId<'_>,
        accept: Option<&str>,
    ) -> ReconcileResult<AcmeResponse> {
        let mut bad_nonces = 0;
        loop {
            let nonce = self.nonce().await?;
            let body = build_jws(&self.key, key_id, url, &nonce, payload)?;
            let mut request = HttpClient::shared()
                .post(url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .body(body.to_string());
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            self.store_nonce(&headers);
            let text = response.text().await?;

            if status.is_success() {
                return Ok(AcmeResponse {
                    location: headers
                        .get(LOCATION)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string),
                    body: text,
                });
            }

            let problem: Problem = serde_json::from_str(&text).unwrap_or_default();
            if problem.is("badNonce") && bad_nonces < BAD_NONCE_RETRIES {
                bad_nonces += 1;
                debug!("[acme] badNonce from {}, retrying with a fresh nonce", url);
                continue;
            }
            return Err(problem_error(status, &headers, &text));
        }
    }

    async fn fetch_order(&self, order_url: &str) -> ReconcileResult<OrderResource> {
        let kid = self.account_url().await?;
        self.post(order_url, None, KeyId::Kid(kid), None)
            .await?
            .json()
    }

    /// Polls until the order leaves `pending`/`ready`/`processing`.
    async fn wait_for_order(&self, order_url: &str) -> ReconcileResult<OrderResource> {
        let started = Instant::now();
        loop {
            let order = match self.fetch_order(order_url).await {
                Ok(order) => order,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::TransientNetworkError | ErrorKind::RateLimited
                    ) && started.elapsed() < self.poll_timeout =>
                {
                    debug!("[acme] order poll for {} failed, polling again: {}", order_url, err);
                    tokio::time::sleep(err.retry_after().unwrap_or(self.poll_interval)).await;
                    continue;
                }
                Err(err) => return Err(err),
            };
            match order.status {
                OrderStatus::Valid => return Ok(order),
                OrderStatus::Invalid | OrderStatus::Expired => {
                    let detail = order.error.map(|p| p.detail).unwrap_or_default();
                    return Err(ReconcileError::AuthorityRejected(format!(
                        "order {} became {:?}: {}",
                        order_url, order.status, detail
                    )));
                }
                _ => {}
            }
            if started.elapsed() >= self.poll_timeout {
                return Err(ReconcileError::DeadlineExceeded {
                    phase: "certificate issuance",
                    limit: self.poll_timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Maps a non-success ACME response to an error kind.
fn problem_error(status: StatusCode, headers: &HeaderMap, body: &str) -> ReconcileError {
    let problem: Problem = serde_json::from_str(body).unwrap_or_default();
    let detail = if problem.detail.is_empty() {
        status.to_string()
    } else {
        format!("{} ({})", problem.detail, problem.kind)
    };
    match classify(status) {
        StatusClass::RateLimited => ReconcileError::RateLimited {
            service: "acme".to_string(),
            retry_after: parse_retry_after(headers),
        },
        StatusClass::ServerError => ReconcileError::TransientNetwork(detail),
        _ if problem.is("rateLimited") => ReconcileError::RateLimited {
            service: "acme".to_string(),
            retry_after: parse_retry_after(headers),
        },
        _ => ReconcileError::AuthorityRejected(detail),
    }
}

fn challenge_from_authorization(
    order_id: &str,
    authorization: &AuthorizationResource,
    thumbprint: &str,
) -> ReconcileResult<Challenge> {
    let domain = if authorization.wildcard {
        format!("*.{}", authorization.identifier.value)
    } else {
        authorization.identifier.value.clone()
    };
    let challenge = authorization
        .challenges
        .iter()
        .find(|challenge| challenge.kind == "dns-01")
        .ok_or_else(|| {
            ReconcileError::AuthorityRejected(format!("no dns-01 challenge offered for {domain}"))
        })?;
    let token = challenge.token.clone().ok_or_else(|| {
        ReconcileError::AuthorityRejected(format!("dns-01 challenge for {domain} has no token"))
    })?;
    let status = match (authorization.status.as_str(), challenge.status.as_str()) {
        ("valid", _) | (_, "valid") => ChallengeStatus::Valid,
        ("invalid", _) | (_, "invalid") => ChallengeStatus::Invalid,
        _ => ChallengeStatus::Pending,
    };
    Ok(Challenge {
        order_id: order_id.to_string(),
        domain,
        url: challenge.url.clone(),
        txt_value: super::jws::dns01_value(&token, thumbprint),
        token,
        handle: None,
        status,
    })
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_order(&self, domains: &[String]) -> ReconcileResult<Order> {
        let directory = self.directory().await?;
        let kid = self.account_url().await?;
        let identifiers: Vec<Value> = domains
            .iter()
            .map(|domain| json!({"type": "dns", "value": domain}))
            .collect();
        let payload = json!({"identifiers": identifiers});
        let response = self
            .post(&directory.new_order, Some(&payload), KeyId::Kid(kid), None)
            .await?;
        let order_url = response.location.clone().ok_or_else(|| {
            ReconcileError::AuthorityRejected("newOrder response has no Location".into())
        })?;
        let resource: OrderResource = response.json()?;
        info!("[acme] created order {} for {:?}", order_url, domains);
        Ok(Order {
            id: order_url,
            domains: domains.to_vec(),
            status: resource.status,
            authorizations: resource.authorizations,
            finalize_url: resource.finalize,
            certificate_url: resource.certificate,
            challenges: Vec::new(),
            created_at: Utc::now(),
        })
    }

    async fn get_challenges(&self, order: &Order) -> ReconcileResult<Vec<Challenge>> {
        let kid = self.account_url().await?;
        let mut challenges = Vec::with_capacity(order.authorizations.len());
        for url in &order.authorizations {
            let authorization: AuthorizationResource =
                self.post(url, None, KeyId::Kid(kid), None).await?.json()?;
            let challenge =
                challenge_from_authorization(&order.id, &authorization, self.key.thumbprint())?;
            debug!(
                "[acme] authorization for {} is {}",
                challenge.domain, authorization.status
            );
            challenges.push(challenge);
        }
        Ok(challenges)
    }

    async fn notify_ready(&self, challenge: &Challenge) -> ReconcileResult<()> {
        let kid = self.account_url().await?;
        self.post(&challenge.url, Some(&json!({})), KeyId::Kid(kid), None)
            .await?;
        debug!("[acme] notified ready for {}", challenge.domain);
        Ok(())
    }

    async fn poll_order_status(&self, order: &Order) -> ReconcileResult<OrderStatus> {
        let resource = self.fetch_order(&order.id).await?;
        if let Some(problem) = resource.error.as_ref() {
            warn!("[acme] order {} reports {}: {}", order.id, problem.kind, problem.detail);
        }
        Ok(resource.status)
    }

    async fn finalize(
        &self,
        order: &Order,
        csr: &CertificateSigningRequest,
    ) -> ReconcileResult<IssuedCertificate> {
        let kid = self.account_url().await?;
        // A retried finalize must not POST again: past `ready` the server
        // answers orderNotReady.
        let current = self.fetch_order(&order.id).await?;
        let resource = match current.status {
            OrderStatus::Ready => {
                let payload = json!({"csr": URL_SAFE_NO_PAD.encode(&csr.der)});
                self.post(&current.finalize, Some(&payload), KeyId::Kid(kid), None)
                    .await?;
                self.wait_for_order(&order.id).await?
            }
            OrderStatus::Processing => {
                debug!("[acme] order {} already processing, resuming", order.id);
                self.wait_for_order(&order.id).await?
            }
            OrderStatus::Valid => current,
            status => {
                return Err(ReconcileError::AuthorityRejected(format!(
                    "order {} is {:?}, cannot finalize",
                    order.id, status
                )));
            }
        };
        let certificate_url = resource.certificate.ok_or_else(|| {
            ReconcileError::AuthorityRejected(format!("valid order {} has no certificate", order.id))
        })?;
        let chain = self
            .post(&certificate_url, None, KeyId::Kid(kid), Some(PEM_CHAIN))
            .await?
            .body;
        let issued = parse_issued_certificate(&chain, &csr.private_key_pem, &order.domains)?;
        info!(
            "[acme] issued certificate {} for {:?} (expires {})",
            issued.serial, issued.domains, issued.not_after
        );
        Ok(issued)
    }
}
