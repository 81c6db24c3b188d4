//! In-process certificate authority for private PKI.
//!
//! Orders follow the same DNS-01 flow as ACME: the challenge value must be
//! observable through the solver's propagation checker before the order
//! becomes ready, then the CSR is signed by the configured CA key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use log::{debug, info, warn};
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509, X509Name, X509Req};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::CertificateAuthority;
use super::jws::dns01_value;
use crate::core::error::{ReconcileError, ReconcileResult};
use crate::core::types::{Challenge, ChallengeStatus, IssuedCertificate, Order, OrderStatus};
use crate::issuance::csr::{CertificateSigningRequest, parse_issued_certificate};
use crate::issuance::solver::ChallengeSolver;

const X509_VERSION_3: i32 = 2;
const CA_VALIDITY_DAYS: u32 = 3650;
const DEFAULT_ORDER_TTL: Duration = Duration::from_secs(1800);

struct LocalOrder {
    domains: Vec<String>,
    challenges: Vec<Challenge>,
    status: OrderStatus,
    created: Instant,
}

pub struct LocalCertificateAuthority {
    name: String,
    ca_cert: X509,
    ca_key: PKey<Private>,
    binding: String,
    lifetime_days: u32,
    /// Orders older than this are dropped when the next order is created.
    order_ttl: Duration,
    solver: Arc<ChallengeSolver>,
    orders: Mutex<HashMap<String, LocalOrder>>,
}

impl LocalCertificateAuthority {
    /// Loads an existing CA. The key must match the certificate.
    pub fn from_pem(
        name: &str,
        cert_pem: &[u8],
        key_pem: &[u8],
        solver: Arc<ChallengeSolver>,
    ) -> ReconcileResult<Self> {
        let ca_cert = X509::from_pem(cert_pem)
            .map_err(|err| ReconcileError::Configuration(format!("invalid CA certificate: {err}")))?;
        let ca_key = PKey::private_key_from_pem(key_pem)
            .map_err(|err| ReconcileError::Configuration(format!("invalid CA key: {err}")))?;
        if !ca_cert.public_key()?.public_eq(&ca_key) {
            return Err(ReconcileError::Configuration(
                "CA key does not match the CA certificate".into(),
            ));
        }
        Self::with_material(name, ca_cert, ca_key, solver)
    }

    /// Creates a self-signed P-256 CA that lives as long as the process.
    pub fn generate(name: &str, solver: Arc<ChallengeSolver>) -> ReconcileResult<Self> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let ca_key = PKey::from_ec_key(EcKey::generate(&group)?)?;

        let mut name_builder = X509Name::builder()?;
        name_builder.append_entry_by_nid(Nid::COMMONNAME, &format!("cert-reconciler CA {name}"))?;
        let subject = name_builder.build();

        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;
        let serial: Asn1Integer = random_serial()?.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(&subject)?;
        let not_before: Asn1Time = Asn1Time::days_from_now(0)?;
        let not_after: Asn1Time = Asn1Time::days_from_now(CA_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(&ca_key)?;
        builder.append_extension(BasicConstraints::new().critical().ca().pathlen(0).build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .digital_signature()
                .build()?,
        )?;
        builder.sign(&ca_key, MessageDigest::sha256())?;

        Self::with_material(name, builder.build(), ca_key, solver)
    }

    fn with_material(
        name: &str,
        ca_cert: X509,
        ca_key: PKey<Private>,
        solver: Arc<ChallengeSolver>,
    ) -> ReconcileResult<Self> {
        let binding = URL_SAFE_NO_PAD.encode(Sha256::digest(ca_cert.to_der()?));
        Ok(Self {
            name: name.to_string(),
            ca_cert,
            ca_key,
            binding,
            lifetime_days: 90,
            order_ttl: DEFAULT_ORDER_TTL,
            solver,
            orders: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_lifetime_days(mut self, days: u32) -> Self {
        self.lifetime_days = days.max(1);
        self
    }

    pub fn with_order_ttl(mut self, ttl: Duration) -> Self {
        self.order_ttl = ttl;
        self
    }

    /// Orders still held in memory.
    pub fn open_orders(&self) -> usize {
        self.orders.lock().map(|orders| orders.len()).unwrap_or(0)
    }

    pub fn ca_certificate_pem(&self) -> ReconcileResult<String> {
        String::from_utf8(self.ca_cert.to_pem()?).map_err(ReconcileError::internal)
    }

    fn orders(&self) -> ReconcileResult<MutexGuard<'_, HashMap<String, LocalOrder>>> {
        self.orders
            .lock()
            .map_err(|_| ReconcileError::Internal("local CA order table poisoned".into()))
    }

    fn sign(&self, domains: &[String], csr: &CertificateSigningRequest) -> ReconcileResult<String> {
        let request = X509Req::from_der(&csr.der)
            .map_err(|err| ReconcileError::AuthorityRejected(format!("malformed CSR: {err}")))?;
        let public_key = request.public_key()?;
        if !request.verify(&public_key)? {
            return Err(ReconcileError::AuthorityRejected(
                "CSR signature does not verify".into(),
            ));
        }
        let primary = domains
            .first()
            .ok_or_else(|| ReconcileError::AuthorityRejected("order has no domains".into()))?;

        let mut name_builder = X509Name::builder()?;
        name_builder.append_entry_by_nid(Nid::COMMONNAME, primary)?;
        let subject = name_builder.build();

        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;
        let serial: Asn1Integer = random_serial()?.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(self.ca_cert.subject_name())?;
        let issued_at = Utc::now().timestamp();
        let lifetime_secs = i64::from(self.lifetime_days) * 86_400;
        let not_before: Asn1Time = Asn1Time::from_unix(issued_at)?;
        let not_after: Asn1Time = Asn1Time::from_unix(issued_at + lifetime_secs)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(&public_key)?;
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
        let san = {
            let mut san = SubjectAlternativeName::new();
            for domain in domains {
                san.dns(domain);
            }
            san.build(&builder.x509v3_context(Some(self.ca_cert.as_ref()), None))?
        };
        builder.append_extension(san)?;
        builder.sign(&self.ca_key, MessageDigest::sha256())?;

        let leaf = builder.build();
        let mut chain = leaf.to_pem()?;
        chain.extend(self.ca_cert.to_pem()?);
        String::from_utf8(chain).map_err(ReconcileError::internal)
    }
}

fn random_serial() -> ReconcileResult<BigNum> {
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial)
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[async_trait]
impl CertificateAuthority for LocalCertificateAuthority {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_order(&self, domains: &[String]) -> ReconcileResult<Order> {
        if domains.is_empty() {
            return Err(ReconcileError::AuthorityRejected("order needs at least one domain".into()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let challenges: Vec<Challenge> = domains
            .iter()
            .enumerate()
            .map(|(index, domain)| {
                let token = random_token();
                Challenge {
                    order_id: id.clone(),
                    domain: domain.clone(),
                    url: format!("local://{}/orders/{}/challenges/{}", self.name, id, index),
                    txt_value: dns01_value(&token, &self.binding),
                    token,
                    handle: None,
                    status: ChallengeStatus::Pending,
                }
            })
            .collect();
        let authorizations = challenges.iter().map(|c| c.url.clone()).collect();
        let mut orders = self.orders()?;
        let before = orders.len();
        orders.retain(|_, order| order.created.elapsed() < self.order_ttl);
        if orders.len() < before {
            debug!("[local-ca] {} dropped {} stale order(s)", self.name, before - orders.len());
        }
        orders.insert(
            id.clone(),
            LocalOrder {
                domains: domains.to_vec(),
                challenges,
                status: OrderStatus::Pending,
                created: Instant::now(),
            },
        );
        drop(orders);
        debug!("[local-ca] {} created order {} for {:?}", self.name, id, domains);
        Ok(Order {
            id: id.clone(),
            domains: domains.to_vec(),
            status: OrderStatus::Pending,
            authorizations,
            finalize_url: format!("local://{}/orders/{}/finalize", self.name, id),
            certificate_url: None,
            challenges: Vec::new(),
            created_at: Utc::now(),
        })
    }

    async fn get_challenges(&self, order: &Order) -> ReconcileResult<Vec<Challenge>> {
        let orders = self.orders()?;
        let local = orders
            .get(&order.id)
            .ok_or_else(|| ReconcileError::AuthorityRejected(format!("unknown order {}", order.id)))?;
        Ok(local.challenges.clone())
    }

    async fn notify_ready(&self, challenge: &Challenge) -> ReconcileResult<()> {
        let observed = self
            .solver
            .observe(&challenge.domain, &challenge.txt_value)
            .await?;

        let mut orders = self.orders()?;
        let local = orders.get_mut(&challenge.order_id).ok_or_else(|| {
            ReconcileError::AuthorityRejected(format!("unknown order {}", challenge.order_id))
        })?;
        let entry = local
            .challenges
            .iter_mut()
            .find(|candidate| candidate.url == challenge.url)
            .ok_or_else(|| {
                ReconcileError::AuthorityRejected(format!("unknown challenge {}", challenge.url))
            })?;
        if observed {
            entry.status = ChallengeStatus::Valid;
        } else {
            warn!(
                "[local-ca] challenge record for {} not observed; invalidating order {}",
                challenge.domain, challenge.order_id
            );
            entry.status = ChallengeStatus::Invalid;
        }

        local.status = if local
            .challenges
            .iter()
            .any(|c| c.status == ChallengeStatus::Invalid)
        {
            OrderStatus::Invalid
        } else if local
            .challenges
            .iter()
            .all(|c| c.status == ChallengeStatus::Valid)
        {
            OrderStatus::Ready
        } else {
            OrderStatus::Pending
        };
        Ok(())
    }

    async fn poll_order_status(&self, order: &Order) -> ReconcileResult<OrderStatus> {
        let mut orders = self.orders()?;
        let status = orders
            .get(&order.id)
            .map(|local| local.status)
            .unwrap_or(OrderStatus::Expired);
        if status == OrderStatus::Invalid {
            orders.remove(&order.id);
        }
        Ok(status)
    }

    async fn finalize(
        &self,
        order: &Order,
        csr: &CertificateSigningRequest,
    ) -> ReconcileResult<IssuedCertificate> {
        let domains = {
            let orders = self.orders()?;
            let local = orders.get(&order.id).ok_or_else(|| {
                ReconcileError::AuthorityRejected(format!("unknown order {}", order.id))
            })?;
            if local.status != OrderStatus::Ready {
                return Err(ReconcileError::AuthorityRejected(format!(
                    "order {} is {:?}, not ready",
                    order.id, local.status
                )));
            }
            local.domains.clone()
        };

        let chain = self.sign(&domains, csr)?;
        let issued = parse_issued_certificate(&chain, &csr.private_key_pem, &domains)?;
        self.orders()?.remove(&order.id);
        info!(
            "[local-ca] {} issued {} for {:?} (expires {})",
            self.name, issued.serial, issued.domains, issued.not_after
        );
        Ok(issued)
    }

    async fn abandon(&self, order: &Order) {
        if let Ok(mut orders) = self.orders() {
            if orders.remove(&order.id).is_some() {
                debug!("[local-ca] {} abandoned order {}", self.name, order.id);
            }
        }
    }
}
