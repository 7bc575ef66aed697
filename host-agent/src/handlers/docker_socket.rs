//! Docker/engine control-socket proxy handler (spec.md §4.4).
//!
//! Same shape as the exec handler, but the backend is a UNIX-domain stream
//! socket — typically the container engine's own control socket — dialed
//! directly rather than mediated by the engine contract. Reads are
//! buffered at up to 1024 bytes; both legs are base64-framed.

use crate::engine::ContainerEngine;
use crate::proxy::handler::{Handler, SessionIo};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::warn;

const READ_BUF_SIZE: usize = 1024;

pub struct DockerSocketHandler {
    engine: Arc<dyn ContainerEngine>,
    verifier: Arc<crate::auth::TokenVerifier>,
}

impl DockerSocketHandler {
    pub fn new(engine: Arc<dyn ContainerEngine>, verifier: Arc<crate::auth::TokenVerifier>) -> Self {
        Self { engine, verifier }
    }
}

#[async_trait]
impl Handler for DockerSocketHandler {
    async fn handle(&self, initial_message: String, mut io: SessionIo) -> anyhow::Result<()> {
        if let Err(e) = super::verify_session_token(&self.verifier, &initial_message) {
            warn!(err = %e, "docker-socket session rejected");
            return Ok(());
        }

        let path = self.engine.control_socket_path();
        let mut sock = UnixStream::connect(&path).await?;
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            tokio::select! {
                biased;
                inbound = io.inbound.recv() => {
                    match inbound {
                        Some(body) => {
                            let Ok(bytes) = BASE64.decode(body.as_bytes()) else {
                                warn!("dropping non-base64 docker-socket frame");
                                continue;
                            };
                            if sock.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                n = sock.read(&mut buf) => {
                    match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let encoded = BASE64.encode(&buf[..n]);
                            if io.send(encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
