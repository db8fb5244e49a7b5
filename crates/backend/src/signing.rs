//! Request signing schemes.
//!
//! A backend signs each request with the current [`Credential`]. Two schemes
//! are provided: a plain HMAC-SHA256 over a canonical string, and an
//! AWS SigV4-style scheme with a derived, date-scoped signing key.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::BackendError;
use crate::types::Credential;

type HmacSha256 = Hmac<Sha256>;

/// The parts of a request covered by a signature.
#[derive(Debug, Clone)]
pub struct SignableRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    /// Extra headers to sign; names are lowercased when canonicalised.
    pub headers: BTreeMap<String, String>,
    /// Lowercase hex SHA-256 of the body.
    pub payload_sha256: String,
    pub timestamp: DateTime<Utc>,
}

impl<'a> SignableRequest<'a> {
    pub fn new(method: &'a str, path: &'a str, payload: &[u8], timestamp: DateTime<Utc>) -> Self {
        Self {
            method,
            path,
            query: "",
            headers: BTreeMap::new(),
            payload_sha256: hex::encode(Sha256::digest(payload)),
            timestamp,
        }
    }

    pub fn with_query(mut self, query: &'a str) -> Self {
        self.query = query;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }
}

/// A computed signature: the authorization value plus headers the request
/// must carry alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub authorization: String,
    pub headers: BTreeMap<String, String>,
}

/// Signs requests with a credential.
pub trait RequestSigner: Send + Sync {
    /// Short scheme name for logs.
    fn scheme(&self) -> &'static str;

    fn sign(
        &self,
        credential: &Credential,
        request: &SignableRequest<'_>,
    ) -> Result<Signature, BackendError>;

    /// Recomputes the signature with `credential` and compares in constant time.
    fn verify(
        &self,
        credential: &Credential,
        request: &SignableRequest<'_>,
        signature: &Signature,
    ) -> Result<(), BackendError> {
        let expected = self.sign(credential, request)?;
        if constant_time_eq(
            expected.authorization.as_bytes(),
            signature.authorization.as_bytes(),
        ) {
            Ok(())
        } else {
            Err(BackendError::Unauthorized("signature mismatch".into()))
        }
    }
}

/// Compares two byte strings without early exit.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, BackendError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| BackendError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn canonical_headers(headers: &BTreeMap<String, String>) -> (String, String) {
    let mut canonical = String::new();
    for (name, value) in headers {
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(value.trim());
        canonical.push('\n');
    }
    let signed = headers.keys().map(String::as_str).collect::<Vec<_>>().join(";");
    (canonical, signed)
}

// ---------------------------------------------------------------------------
// HMAC-SHA256
// ---------------------------------------------------------------------------

/// HMAC-SHA256 of a newline-joined canonical request, keyed by the secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSha256Signer;

const DATE_HEADER: &str = "x-cg-date";
const TOKEN_HEADER: &str = "x-cg-security-token";

impl RequestSigner for HmacSha256Signer {
    fn scheme(&self) -> &'static str {
        "hmac-sha256"
    }

    fn sign(
        &self,
        credential: &Credential,
        request: &SignableRequest<'_>,
    ) -> Result<Signature, BackendError> {
        let mut headers = request.headers.clone();
        headers.insert(DATE_HEADER.into(), request.timestamp.to_rfc3339());
        if let Some(token) = &credential.session_token {
            headers.insert(TOKEN_HEADER.into(), token.clone());
        }
        let (canonical, signed) = canonical_headers(&headers);

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}{}\n{}",
            request.method, request.path, request.query, canonical, signed, request.payload_sha256
        );
        let mac = hmac_sha256(credential.secret.as_bytes(), string_to_sign.as_bytes())?;

        let authorization = format!(
            "HMAC-SHA256 Credential={}, SignedHeaders={}, Signature={}",
            credential.access_key,
            signed,
            hex::encode(mac)
        );
        Ok(Signature {
            authorization,
            headers,
        })
    }
}

// ---------------------------------------------------------------------------
// SigV4
// ---------------------------------------------------------------------------

/// AWS Signature Version 4 style signing.
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }

    fn signing_key(&self, secret: &str, date_stamp: &str) -> Result<Vec<u8>, BackendError> {
        let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, self.service.as_bytes())?;
        hmac_sha256(&k_service, b"aws4_request")
    }
}

impl RequestSigner for SigV4Signer {
    fn scheme(&self) -> &'static str {
        "sigv4"
    }

    fn sign(
        &self,
        credential: &Credential,
        request: &SignableRequest<'_>,
    ) -> Result<Signature, BackendError> {
        let date_stamp = request.timestamp.format("%Y%m%d").to_string();
        let amz_date = request.timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = request.headers.clone();
        headers.insert("x-amz-date".into(), amz_date.clone());
        headers.insert(
            "x-amz-content-sha256".into(),
            request.payload_sha256.clone(),
        );
        if let Some(token) = &credential.session_token {
            headers.insert("x-amz-security-token".into(), token.clone());
        }
        let (canonical, signed) = canonical_headers(&headers);

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method, request.path, request.query, canonical, signed, request.payload_sha256
        );
        let canonical_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));

        let scope = format!(
            "{date_stamp}/{}/{}/aws4_request",
            self.region, self.service
        );
        let string_to_sign = format!("AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{canonical_hash}");

        let key = self.signing_key(&credential.secret, &date_stamp)?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed}, Signature={signature}",
            credential.access_key
        );
        Ok(Signature {
            authorization,
            headers,
        })
    }
}
