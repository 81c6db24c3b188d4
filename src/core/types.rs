use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::error::ErrorKind;

/// Private key algorithm for issued certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    #[default]
    EcdsaP256,
    EcdsaP384,
}

/// Desired state: one certificate covering `domains`, issued by `issuer`,
/// stored under `secret_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub name: String,
    pub domains: Vec<String>,
    pub issuer: String,
    pub secret_name: String,
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,
}

impl CertificateRequest {
    /// Primary domain used as the certificate CN.
    pub fn primary_domain(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }
}

/// ACME order status values (RFC 8555 section 7.1.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Valid | OrderStatus::Invalid | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Presented,
    Valid,
    Invalid,
}

/// Provider-specific reference to a published TXT record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeHandle {
    pub provider: String,
    pub domain: String,
    pub record_name: String,
    pub value: String,
    pub record_id: String,
}

/// One DNS-01 challenge for a single domain of an order.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub order_id: String,
    pub domain: String,
    /// Authority URL used to signal readiness.
    pub url: String,
    pub token: String,
    /// Value that must be published in the `_acme-challenge` TXT record.
    pub txt_value: String,
    pub handle: Option<ChallengeHandle>,
    pub status: ChallengeStatus,
}

/// One in-flight issuance attempt against an authority.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub domains: Vec<String>,
    pub status: OrderStatus,
    pub authorizations: Vec<String>,
    pub finalize_url: String,
    pub certificate_url: Option<String>,
    pub challenges: Vec<Challenge>,
    pub created_at: DateTime<Utc>,
}

/// Certificate material produced by a finished order.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub chain_pem: String,
    pub private_key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub domains: Vec<String>,
    pub serial: String,
    pub fingerprint: String,
}

impl IssuedCertificate {
    pub fn lifetime(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.not_after - now
    }
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("domains", &self.domains)
            .field("serial", &self.serial)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Drop for IssuedCertificate {
    fn drop(&mut self) {
        self.private_key_pem.zeroize();
    }
}

/// States of a single issuance run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceState {
    Requested,
    OrderCreated,
    ChallengesPending,
    ChallengesPublished,
    AwaitingAuthorityValidation,
    Finalizing,
    Issued,
    Failed,
}

impl IssuanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IssuanceState::Issued | IssuanceState::Failed)
    }
}

/// A recorded state change; `error` is set only for `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub attempt: u32,
    pub state: IssuanceState,
    pub at: DateTime<Utc>,
    pub error: Option<ErrorKind>,
}

/// Externally visible phase of a certificate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Pending,
    Issuing,
    Ready,
    Failed,
    PermanentlyFailed,
}

impl RequestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPhase::Pending => "pending",
            RequestPhase::Issuing => "issuing",
            RequestPhase::Ready => "ready",
            RequestPhase::Failed => "failed",
            RequestPhase::PermanentlyFailed => "permanently_failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let phase = match raw {
            "pending" => RequestPhase::Pending,
            "issuing" => RequestPhase::Issuing,
            "ready" => RequestPhase::Ready,
            "failed" => RequestPhase::Failed,
            "permanently_failed" => RequestPhase::PermanentlyFailed,
            _ => return None,
        };
        Some(phase)
    }
}

/// Status fields the reconciler maintains for each request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestStatus {
    pub name: String,
    pub phase: RequestPhase,
    pub consecutive_failures: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub serial: Option<String>,
    pub not_after: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RequestStatus {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: RequestPhase::Pending,
            consecutive_failures: 0,
            last_error_kind: None,
            last_error: None,
            serial: None,
            not_after: None,
            updated_at: Utc::now(),
        }
    }
}
