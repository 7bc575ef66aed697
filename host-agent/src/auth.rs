//! Token sub-protocol verification (spec.md §6, §7).
//!
//! Every session's initial URL carries `?token=<jwt>` in its query string.
//! The token is verified against a pre-loaded PEM/PKIX public key; claims
//! of interest are `hostUuid`, `logs`, `exec`, `containerIds`, `resourceId`.
//! Authorization failure (missing/invalid token, host UUID mismatch) closes
//! the session silently — no retry, no error surfaced to the peer (§7).
//!
//! `jsonwebtoken` is the verification crate used across the example pack
//! (`examples/other_examples/manifests/vishalbelsare-agentgateway/Cargo.toml`,
//! `.../zlovtnik-backend/Cargo.toml`); the teacher itself has no JWT
//! verification site to imitate, so this module follows that crate's own
//! idiomatic `DecodingKey` + `Validation` usage instead.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("missing token query parameter")]
    Missing,
    #[error("token verification failed: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("host uuid mismatch: token claims {claimed:?}, agent is {expected:?}")]
    HostUuidMismatch { claimed: String, expected: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    #[serde(rename = "hostUuid", default)]
    pub host_uuid: Option<String>,
    #[serde(default)]
    pub logs: Option<LogsClaim>,
    #[serde(default)]
    pub exec: Option<serde_json::Value>,
    #[serde(default, rename = "containerIds")]
    pub container_ids: Option<HashMap<String, String>>,
    #[serde(default, rename = "resourceId")]
    pub resource_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogsClaim {
    pub container: Option<String>,
    #[serde(default = "default_true")]
    pub follow: bool,
    #[serde(default = "default_lines")]
    pub lines: i64,
}

fn default_true() -> bool {
    true
}

fn default_lines() -> i64 {
    100
}

/// Loaded once at startup from the `public-key` config path. `None` key
/// means the `auth` config flag is off — every session is admitted with
/// empty claims rather than rejected outright, matching spec.md's `auth`
/// (bool) config switch.
#[derive(Clone)]
pub struct TokenVerifier {
    key: Option<DecodingKey>,
    host_uuid_check: bool,
    expected_host_uuid: String,
}

impl TokenVerifier {
    pub fn from_pem(pem: &[u8], host_uuid_check: bool, expected_host_uuid: String) -> anyhow::Result<Self> {
        let key = DecodingKey::from_rsa_pem(pem).or_else(|_| DecodingKey::from_ec_pem(pem))?;
        Ok(Self {
            key: Some(key),
            host_uuid_check,
            expected_host_uuid,
        })
    }

    /// Built when the `auth` config flag is disabled: accepts every
    /// session without verifying a token.
    pub fn disabled() -> Self {
        Self {
            key: None,
            host_uuid_check: false,
            expected_host_uuid: String::new(),
        }
    }

    /// Verify `token` and return its claims, enforcing the host-uuid match
    /// when `host_uuid_check` is enabled in config.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let Some(key) = &self.key else {
            return Ok(Claims::default());
        };
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<Claims>(token, key, &validation)?;
        let claims = data.claims;

        if self.host_uuid_check {
            if let Some(claimed) = &claims.host_uuid {
                if claimed != &self.expected_host_uuid {
                    return Err(TokenError::HostUuidMismatch {
                        claimed: claimed.clone(),
                        expected: self.expected_host_uuid.clone(),
                    });
                }
            }
        }

        Ok(claims)
    }
}

/// Extract the `token` query parameter from a session's initial URL.
pub fn extract_token(url: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "token").then(|| urlencoding_decode(v))
    })
}

/// Minimal percent-decoding for query values; tokens are base64url JWTs so
/// the only characters needing decoding in practice are `.`-adjacent `%2E`
/// escapes some clients add, but we decode generally for correctness.
fn urlencoding_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next();
            let lo = chars.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                    out.push(byte as char);
                    continue;
                }
            }
            out.push('%');
        } else if c == '+' {
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}
