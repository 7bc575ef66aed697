//! Stream handlers — one `Handler` impl per sub-protocol (spec.md §4.2-§4.6).

pub mod docker_socket;
pub mod exec;
pub mod http_proxy;
pub mod logs;
pub mod stats;

use crate::auth::{extract_token, TokenVerifier};
use anyhow::{bail, Result};

/// Shared first step of every handler: pull `token` off the session's
/// initial URL and verify it. Authorization failure closes the session
/// silently with no retry (spec.md §7) — callers should map a returned
/// error straight to a clean early return, not to a logged warning.
pub fn verify_session_token(
    verifier: &TokenVerifier,
    initial_message: &str,
) -> Result<crate::auth::Claims> {
    let token = match extract_token(initial_message) {
        Some(t) => t,
        None => bail!("missing token on session URL"),
    };
    Ok(verifier.verify(&token)?)
}
