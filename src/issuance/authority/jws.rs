//! ES256 account keys and flattened JWS bodies for ACME requests.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::nid::Nid;
use openssl::pkey::Private;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::core::error::{ReconcileError, ReconcileResult};

/// P-256 account key. The public JWK and its thumbprint are computed once.
pub struct AccountKey {
    key: EcKey<Private>,
    jwk: Value,
    thumbprint: String,
}

impl AccountKey {
    pub fn generate() -> ReconcileResult<Self> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        Self::from_ec_key(EcKey::generate(&group)?)
    }

    /// Loads a PEM key (SEC1 or PKCS#8). Only P-256 keys are accepted.
    pub fn from_pem(pem: &[u8]) -> ReconcileResult<Self> {
        let key = EcKey::private_key_from_pem(pem)
            .or_else(|_| {
                openssl::pkey::PKey::private_key_from_pem(pem).and_then(|pkey| pkey.ec_key())
            })
            .map_err(|err| {
                ReconcileError::Configuration(format!("account key is not an EC key: {err}"))
            })?;
        if key.group().curve_name() != Some(Nid::X9_62_PRIME256V1) {
            return Err(ReconcileError::Configuration(
                "account key must use the P-256 curve".into(),
            ));
        }
        Self::from_ec_key(key)
    }

    fn from_ec_key(key: EcKey<Private>) -> ReconcileResult<Self> {
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        key.public_key()
            .affine_coordinates(key.group(), &mut x, &mut y, &mut ctx)?;
        let x = URL_SAFE_NO_PAD.encode(x.to_vec_padded(32)?);
        let y = URL_SAFE_NO_PAD.encode(y.to_vec_padded(32)?);
        // RFC 7638: members in lexicographic order, no whitespace.
        let canonical = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);
        let thumbprint = URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()));
        let jwk = json!({"crv": "P-256", "kty": "EC", "x": x, "y": y});
        Ok(Self {
            key,
            jwk,
            thumbprint,
        })
    }

    pub fn to_pem(&self) -> ReconcileResult<Zeroizing<String>> {
        let pem = self.key.private_key_to_pem()?;
        String::from_utf8(pem)
            .map(Zeroizing::new)
            .map_err(ReconcileError::internal)
    }

    pub fn jwk(&self) -> &Value {
        &self.jwk
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Raw `r || s` ES256 signature over `data`.
    pub fn sign(&self, data: &[u8]) -> ReconcileResult<Vec<u8>> {
        let digest = Sha256::digest(data);
        let sig = EcdsaSig::sign(&digest, &self.key)?;
        let mut raw = sig.r().to_vec_padded(32)?;
        raw.extend(sig.s().to_vec_padded(32)?);
        Ok(raw)
    }

    /// DNS-01 TXT value: base64url(SHA-256(token "." thumbprint)).
    pub fn dns01_value(&self, token: &str) -> String {
        dns01_value(token, &self.thumbprint)
    }
}

pub fn dns01_value(token: &str, thumbprint: &str) -> String {
    let key_authorization = format!("{token}.{thumbprint}");
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Identifies the signer: the JWK before an account exists, the account URL afterwards.
#[derive(Debug, Clone, Copy)]
pub enum KeyId<'a> {
    Jwk,
    Kid(&'a str),
}

/// Builds a flattened JWS. `payload` of `None` produces a POST-as-GET body.
pub fn build_jws(
    key: &AccountKey,
    key_id: KeyId<'_>,
    url: &str,
    nonce: &str,
    payload: Option<&Value>,
) -> ReconcileResult<Value> {
    let header = match key_id {
        KeyId::Jwk => json!({"alg": "ES256", "jwk": key.jwk(), "nonce": nonce, "url": url}),
        KeyId::Kid(kid) => json!({"alg": "ES256", "kid": kid, "nonce": nonce, "url": url}),
    };
    let protected = URL_SAFE_NO_PAD.encode(header.to_string().as_bytes());
    let payload = match payload {
        Some(value) => URL_SAFE_NO_PAD.encode(value.to_string().as_bytes()),
        None => String::new(),
    };
    let signature = key.sign(format!("{protected}.{payload}").as_bytes())?;
    Ok(json!({
        "protected": protected,
        "payload": payload,
        "signature": URL_SAFE_NO_PAD.encode(signature),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::ecdsa::EcdsaSig;

    fn decode_json(segment: &str) -> Value {
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segment).unwrap()).unwrap()
    }

    #[test]
    fn thumbprint_is_stable_across_pem_round_trip() {
        let key = AccountKey::generate().unwrap();
        let pem = key.to_pem().unwrap();
        let reloaded = AccountKey::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(key.thumbprint(), reloaded.thumbprint());
        assert_eq!(key.jwk(), reloaded.jwk());
        assert_eq!(URL_SAFE_NO_PAD.decode(key.thumbprint()).unwrap().len(), 32);
    }

    #[test]
    fn signature_verifies_with_public_key() {
        let key = AccountKey::generate().unwrap();
        let raw = key.sign(b"payload").unwrap();
        assert_eq!(raw.len(), 64);
        let r = BigNum::from_slice(&raw[..32]).unwrap();
        let s = BigNum::from_slice(&raw[32..]).unwrap();
        let sig = EcdsaSig::from_private_components(r, s).unwrap();
        let digest = Sha256::digest(b"payload");
        assert!(sig.verify(&digest, &key.key).unwrap());
    }

    #[test]
    fn jws_uses_jwk_then_kid() {
        let key = AccountKey::generate().unwrap();
        let body = build_jws(
            &key,
            KeyId::Jwk,
            "https://ca/new-acct",
            "nonce-1",
            Some(&json!({"termsOfServiceAgreed": true})),
        )
        .unwrap();
        let header = decode_json(body["protected"].as_str().unwrap());
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["nonce"], "nonce-1");
        assert!(header.get("jwk").is_some());
        assert!(header.get("kid").is_none());

        let body = build_jws(&key, KeyId::Kid("https://ca/acct/1"), "https://ca/order/1", "n2", None)
            .unwrap();
        let header = decode_json(body["protected"].as_str().unwrap());
        assert_eq!(header["kid"], "https://ca/acct/1");
        assert!(header.get("jwk").is_none());
        assert_eq!(body["payload"], "");
    }

    #[test]
    fn dns01_value_matches_rfc_8555_example_shape() {
        let value = dns01_value("evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA", "thumb");
        assert_eq!(value.len(), 43);
        assert!(!value.contains('='));
        assert_eq!(value, dns01_value("evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA", "thumb"));
    }

    #[test]
    fn rejects_non_p256_keys() {
        let group = EcGroup::from_curve_name(Nid::SECP384R1).unwrap();
        let key = EcKey::generate(&group).unwrap();
        let pem = key.private_key_to_pem().unwrap();
        assert!(AccountKey::from_pem(&pem).is_err());
    }
}
