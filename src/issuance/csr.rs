//! Per-order key generation, CSR construction and parsing of issued chains.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sha2::{Digest, Sha256};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use zeroize::Zeroizing;

use crate::core::error::{ReconcileError, ReconcileResult};
use crate::core::types::{IssuedCertificate, KeyAlgorithm};

/// A DER CSR together with the private key it was signed with.
pub struct CertificateSigningRequest {
    pub der: Vec<u8>,
    pub private_key_pem: Zeroizing<String>,
    pub domains: Vec<String>,
}

impl fmt::Debug for CertificateSigningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateSigningRequest")
            .field("domains", &self.domains)
            .field("der_len", &self.der.len())
            .finish_non_exhaustive()
    }
}

/// Generates a fresh key and a CSR naming every domain as a SAN, the first as CN.
pub fn generate_csr(
    domains: &[String],
    algorithm: KeyAlgorithm,
) -> ReconcileResult<CertificateSigningRequest> {
    let primary = domains
        .first()
        .ok_or_else(|| ReconcileError::Configuration("CSR needs at least one domain".into()))?;
    let signature_algorithm = match algorithm {
        KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
    };
    let key_pair = KeyPair::generate_for(signature_algorithm)
        .map_err(|err| ReconcileError::Internal(format!("failed to generate key: {err}")))?;

    let mut params = CertificateParams::new(domains.to_vec())
        .map_err(|err| ReconcileError::Internal(format!("failed to build CSR params: {err}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, primary.as_str());
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|err| ReconcileError::Internal(format!("failed to serialize CSR: {err}")))?;

    Ok(CertificateSigningRequest {
        der: csr.der().to_vec(),
        private_key_pem: Zeroizing::new(key_pair.serialize_pem()),
        domains: domains.to_vec(),
    })
}

/// Parses the leaf of `chain_pem` and checks it against the requested domains.
///
/// A SAN set that differs from `expected_domains`, or an expiry not after
/// issuance, is reported as an authority rejection.
pub fn parse_issued_certificate(
    chain_pem: &str,
    private_key_pem: &str,
    expected_domains: &[String],
) -> ReconcileResult<IssuedCertificate> {
    let issued = inspect_certificate(chain_pem, private_key_pem)?;
    let mut expected: Vec<String> = expected_domains.to_vec();
    expected.sort();
    expected.dedup();
    if issued.domains != expected {
        return Err(ReconcileError::AuthorityRejected(format!(
            "issued certificate covers {:?}, requested {:?}",
            issued.domains, expected
        )));
    }
    Ok(issued)
}

/// Reads validity, SANs, serial and fingerprint from the leaf of `chain_pem`.
pub fn inspect_certificate(
    chain_pem: &str,
    private_key_pem: &str,
) -> ReconcileResult<IssuedCertificate> {
    let (_, pem_block) = parse_x509_pem(chain_pem.as_bytes()).map_err(|err| {
        ReconcileError::AuthorityRejected(format!("failed to parse issued certificate PEM: {err}"))
    })?;
    let cert = pem_block.parse_x509().map_err(|err| {
        ReconcileError::AuthorityRejected(format!("failed to parse issued certificate: {err}"))
    })?;

    let not_before = timestamp(cert.validity().not_before.timestamp())?;
    let not_after = timestamp(cert.validity().not_after.timestamp())?;
    if not_after <= not_before {
        return Err(ReconcileError::AuthorityRejected(format!(
            "issued certificate expires ({not_after}) before it becomes valid ({not_before})"
        )));
    }

    let mut domains: Vec<String> = cert
        .subject_alternative_name()
        .map_err(|err| ReconcileError::AuthorityRejected(format!("invalid SAN extension: {err}")))?
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    domains.sort();
    domains.dedup();

    let fingerprint = hex::encode(Sha256::digest(pem_block.contents.as_slice()));

    Ok(IssuedCertificate {
        chain_pem: chain_pem.to_string(),
        private_key_pem: private_key_pem.to_string(),
        not_before,
        not_after,
        domains,
        serial: cert.raw_serial_as_string(),
        fingerprint,
    })
}

fn timestamp(secs: i64) -> ReconcileResult<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| ReconcileError::AuthorityRejected(format!("invalid certificate time {secs}")))
}
