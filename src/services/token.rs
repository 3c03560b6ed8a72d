//! Capability tokens binding a client to one `file_id`.
//!
//! A token is `hex(nonce)` when no shared secret is configured, and
//! `hex(nonce).hex(HMAC-SHA256(secret, file_id || "." || hex(nonce)))` when
//! one is. The signed form lets a storage node check a token offline; the
//! unsigned form is still unguessable but can only be checked by the master.
//!
//! The same secret signs the progress reports a storage node sends back, so
//! the master only accepts status changes from a node that holds it.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use thiserror::Error;

use crate::models::file_record::ProgressReport;

type HmacSha256 = Hmac<Sha256>;

/// Nonce length in bytes (32 hex characters).
const NONCE_BYTES: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("missing capability token")]
    Missing,
    #[error("malformed capability token")]
    Malformed,
    #[error("capability token does not match file `{0}`")]
    Mismatch(String),
    #[error("progress report for `{0}` carries no valid signature")]
    ReportSignature(String),
}

/// Issues and verifies capability tokens. Cheap to clone.
#[derive(Clone, Default)]
pub struct TokenIssuer {
    secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("signed", &self.secret.is_some())
            .finish()
    }
}

impl TokenIssuer {
    /// Issuer without a shared secret: tokens are random and unverifiable
    /// by storage nodes.
    pub fn unsigned() -> Self {
        Self { secret: None }
    }

    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }

    pub fn from_optional(secret: Option<String>) -> Self {
        match secret {
            Some(s) if !s.is_empty() => Self::with_secret(s.into_bytes()),
            _ => Self::unsigned(),
        }
    }

    /// Whether tokens carry a verifiable signature.
    pub fn is_signed(&self) -> bool {
        self.secret.is_some()
    }

    /// Issue a fresh token for `file_id`.
    pub fn issue(&self, file_id: &str) -> String {
        let mut nonce = [0u8; NONCE_BYTES];
        rand::thread_rng().fill(&mut nonce);
        let nonce = hex::encode(nonce);

        match &self.secret {
            Some(secret) => {
                let tag = sign(secret, file_id, &nonce);
                format!("{}.{}", nonce, hex::encode(tag))
            }
            None => nonce,
        }
    }

    /// Check that `token` was issued for `file_id`.
    ///
    /// Without a secret there is nothing to check against and every
    /// token, including a missing one, is accepted.
    pub fn verify(&self, file_id: &str, token: Option<&str>) -> Result<(), TokenError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let token = token.filter(|t| !t.is_empty()).ok_or(TokenError::Missing)?;
        let (nonce, tag_hex) = token.split_once('.').ok_or(TokenError::Malformed)?;
        if nonce.len() != NONCE_BYTES * 2 || !nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TokenError::Malformed);
        }
        let tag = hex::decode(tag_hex).map_err(|_| TokenError::Malformed)?;

        let mut mac = new_mac(secret);
        mac.update(file_id.as_bytes());
        mac.update(b".");
        mac.update(nonce.as_bytes());
        mac.verify_slice(&tag)
            .map_err(|_| TokenError::Mismatch(file_id.to_string()))
    }

    /// Hex signature over a progress report for `file_id`, or `None` when no
    /// secret is configured.
    pub fn sign_report(&self, file_id: &str, report: &ProgressReport) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mac = report_mac(secret, file_id, report);
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check the signature a storage node attached to a progress report.
    ///
    /// Every field of the report is covered, so a replayed signature cannot
    /// carry a different status, length or checksum.
    pub fn verify_report(
        &self,
        file_id: &str,
        report: &ProgressReport,
        signature: Option<&str>,
    ) -> Result<(), TokenError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let rejected = || TokenError::ReportSignature(file_id.to_string());
        let tag = signature
            .filter(|s| !s.is_empty())
            .and_then(|s| hex::decode(s).ok())
            .ok_or_else(rejected)?;
        report_mac(secret, file_id, report)
            .verify_slice(&tag)
            .map_err(|_| rejected())
    }
}

fn new_mac(secret: &[u8]) -> HmacSha256 {
    // HMAC is defined for keys of any length; `new_from_slice` cannot fail.
    match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts any key size"),
    }
}

fn sign(secret: &[u8], file_id: &str, nonce: &str) -> Vec<u8> {
    let mut mac = new_mac(secret);
    mac.update(file_id.as_bytes());
    mac.update(b".");
    mac.update(nonce.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn report_mac(secret: &[u8], file_id: &str, report: &ProgressReport) -> HmacSha256 {
    let bytes_stored = report.bytes_stored.to_string();
    let checksum = report.checksum.as_deref().unwrap_or("");
    let mut mac = new_mac(secret);
    mac.update(b"progress\n");
    for field in [file_id, report.status.as_str(), bytes_stored.as_str(), checksum] {
        mac.update(field.as_bytes());
        mac.update(b"\n");
    }
    mac
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim())
    } else {
        None
    }
}
