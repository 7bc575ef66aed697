//! Exec handler (spec.md §4.3).
//!
//! Attaches a bidirectional binary stream to an engine-created exec
//! instance. Both legs are base64-encoded in `body` (binary-transparent);
//! on inbound close, a single EOT byte (`0x04`) is written to stdin before
//! the handler tears the exec session down.

use crate::engine::types::ExecConfig;
use crate::engine::ContainerEngine;
use crate::proxy::handler::{Handler, SessionIo};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use tracing::{debug, warn};

const EOT: u8 = 0x04;

pub struct ExecHandler {
    engine: Arc<dyn ContainerEngine>,
    verifier: Arc<crate::auth::TokenVerifier>,
}

impl ExecHandler {
    pub fn new(engine: Arc<dyn ContainerEngine>, verifier: Arc<crate::auth::TokenVerifier>) -> Self {
        Self { engine, verifier }
    }
}

#[async_trait]
impl Handler for ExecHandler {
    async fn handle(&self, initial_message: String, mut io: SessionIo) -> anyhow::Result<()> {
        let claims = match super::verify_session_token(&self.verifier, &initial_message) {
            Ok(c) => c,
            Err(e) => {
                debug!(err = %e, "exec session rejected");
                return Ok(());
            }
        };

        let raw = serde_json::to_value(&claims.extra).unwrap_or(serde_json::Value::Null);
        let cfg = ExecConfig::from_json(&raw);
        if cfg.container.is_empty() {
            debug!("exec claim missing container id — rejecting session");
            return Ok(());
        }

        let mut session = self.engine.create_exec(&cfg).await?;
        let mut stdout_rx = session.take_stdout();

        loop {
            tokio::select! {
                biased;
                inbound = io.inbound.recv() => {
                    match inbound {
                        Some(body) => {
                            let Ok(bytes) = BASE64.decode(body.as_bytes()) else {
                                warn!("dropping non-base64 exec stdin frame");
                                continue;
                            };
                            if session.write_stdin(&bytes).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = session.write_stdin(&[EOT]).await;
                            let _ = session.close_stdin().await;
                            break;
                        }
                    }
                }
                chunk = stdout_rx.recv() => {
                    let Some(bytes) = chunk else { break };
                    let encoded = BASE64.encode(bytes);
                    if io.send(encoded).await.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eot_byte_is_the_ascii_end_of_transmission_code() {
        assert_eq!(EOT, 0x04);
    }

    #[test]
    fn base64_round_trips_binary_stdin() {
        let payload = b"ping\n";
        let encoded = BASE64.encode(payload);
        let decoded = BASE64.decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, payload);
    }
}
