//! Stream multiplexer / backend agent (spec.md §4.1).
//!
//! Owns the single outbound websocket connection: performs the one-shot
//! token exchange with bounded retry, connects, decodes frames, and drives
//! the `SessionDemux` + outbound fan-in writer for the connection's
//! lifetime. Modeled on the teacher's `ipc::run` connection loop
//! (`examples/clawde-io-apps/daemon/src/ipc/mod.rs`): split the websocket
//! into sink/stream halves, one task reads, one task writes, `tokio::select!`
//! for shutdown.

pub mod frame;
pub mod handler;
pub mod session;

use anyhow::{Context, Result};
use frame::Frame;
use futures_util::{SinkExt, StreamExt};
use handler::Handler;
use serde::Deserialize;
use session::{SessionDemux, SessionTable};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};

const OUTBOUND_BUFFER: usize = 256;
const TOKEN_EXCHANGE_ATTEMPTS: u32 = 20;
const TOKEN_EXCHANGE_SPACING: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TokenExchangeError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
    /// HTTP 501 — upstream intentionally disabled. Per spec.md §9 open
    /// questions: block forever by design, never treated as an error the
    /// caller retries or aborts on.
    #[error("upstream reports disabled (501) — blocking forever by design")]
    Disabled,
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default, rename = "fieldName")]
    field_name: String,
}

/// Path-prefix → handler factory table (spec.md §4.1, §6). Routes accept
/// both `/v1/...` and `/v2-beta/...` prefixes; matching strips the version
/// prefix before comparing the route segment.
pub struct RouteTable {
    routes: Vec<(&'static str, Arc<dyn Fn() -> Arc<dyn Handler> + Send + Sync>)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn register(
        &mut self,
        prefix: &'static str,
        factory: impl Fn() -> Arc<dyn Handler> + Send + Sync + 'static,
    ) {
        self.routes.push((prefix, Arc::new(factory)));
    }

    /// Resolve a session's initial URL to a handler instance. Strips a
    /// leading `/v1/` or `/v2-beta/` before prefix matching.
    pub fn resolve(&self, url: &str) -> Option<Arc<dyn Handler>> {
        let path = url.split('?').next().unwrap_or(url);
        let stripped = path
            .strip_prefix("/v1/")
            .or_else(|| path.strip_prefix("/v2-beta/"))
            .unwrap_or(path.trim_start_matches('/'));

        self.routes
            .iter()
            .find(|(prefix, _)| stripped.starts_with(prefix))
            .map(|(_, factory)| factory())
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Exchange the agent's cattle credentials for a one-shot websocket URL +
/// token, retrying up to 20 times at 1-second spacing on a 422
/// `InvalidReference` response (the control plane hasn't registered this
/// host yet); any other error is fatal except 501, which means "never
/// connect" rather than "retry" (spec.md §4.1, §7, §9).
pub async fn exchange_token(
    client: &reqwest::Client,
    cattle_url: &str,
    access_key: &str,
    secret_key: &str,
) -> Result<(String, String), TokenExchangeError> {
    async fn attempt(
        client: &reqwest::Client,
        cattle_url: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<(String, String), TokenExchangeError> {
        let resp = client
            .post(cattle_url)
            .basic_auth(access_key, Some(secret_key))
            .send()
            .await
            .map_err(|e| TokenExchangeError::Retryable(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 501 {
            return Err(TokenExchangeError::Disabled);
        }
        if status.as_u16() == 422 {
            let body: ApiErrorBody = resp.json().await.unwrap_or(ApiErrorBody {
                code: String::new(),
                field_name: String::new(),
            });
            if body.code == "InvalidReference" && body.field_name == "reportedUuid" {
                return Err(TokenExchangeError::Retryable(
                    "host not yet registered (InvalidReference on reportedUuid)".to_string(),
                ));
            }
            return Err(TokenExchangeError::Fatal(format!(
                "422 {}: {}",
                body.code, body.field_name
            )));
        }
        if !status.is_success() {
            return Err(TokenExchangeError::Fatal(format!("token exchange failed: {status}")));
        }

        let body: TokenExchangeResponse = resp
            .json()
            .await
            .map_err(|e| TokenExchangeError::Fatal(e.to_string()))?;
        Ok((body.url, body.token))
    }

    // Distinct per-error-code policy (spec.md §7) rather than a blind
    // retry-on-anything loop: 422 InvalidReference retries up to 20 times
    // at 1 s spacing; 501 blocks forever; anything else is fatal immediately.
    let mut last_err = None;
    for attempt_no in 1..=TOKEN_EXCHANGE_ATTEMPTS {
        match attempt(client, cattle_url, access_key, secret_key).await {
            Ok(v) => return Ok(v),
            Err(TokenExchangeError::Disabled) => {
                warn!("token exchange reports upstream disabled (501) — blocking forever, will not connect");
                return Err(TokenExchangeError::Disabled);
            }
            Err(TokenExchangeError::Fatal(msg)) => return Err(TokenExchangeError::Fatal(msg)),
            Err(e @ TokenExchangeError::Retryable(_)) => {
                if attempt_no < TOKEN_EXCHANGE_ATTEMPTS {
                    warn!(attempt = attempt_no, "host not yet registered — retrying in 1s");
                    tokio::time::sleep(TOKEN_EXCHANGE_SPACING).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

/// Run the multiplexer for one connected session: read frames from the
/// websocket, dispatch through `routes`, drain the outbound fan-in queue
/// to the socket. Returns once the read side hits an error or EOF — per
/// spec.md §4.1, this cancels every live session (closes every inbound
/// channel) by dropping the session table, and a reconnect policy is out
/// of scope.
pub async fn run_connection(
    ws_url: &str,
    token: &str,
    routes: Arc<RouteTable>,
) -> Result<()> {
    let url = format!("{ws_url}?token={token}");
    let (ws, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .context("websocket connect failed")?;
    info!(url = %ws_url, "connected to upstream proxy");

    let (mut sink, mut stream) = ws.split();
    let table = Arc::new(SessionTable::new());
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = sink.send(WsMessage::Text(msg)).await {
                warn!(err = %e, "outbound write failed — stopping writer");
                break;
            }
        }
    });

    let demux = SessionDemux::new(table.clone(), out_tx.clone());
    let resolver = move |url: &str| routes.resolve(url);

    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => match Frame::from_json(&text) {
                Ok(frame) => demux.dispatch(frame, &resolver).await,
                Err(e) => warn!(err = %e, "dropping undecodable frame"),
            },
            Some(Ok(WsMessage::Close(_))) | None => {
                info!("upstream websocket closed");
                break;
            }
            Some(Ok(_)) => {
                // Binary/ping/pong frames carry no session data on this protocol.
            }
            Some(Err(e)) => {
                error!(err = %e, "websocket read error — tearing down all sessions");
                break;
            }
        }
    }

    drop(out_tx);
    writer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::handler::SessionIo;
    use async_trait::async_trait;

    struct NopHandler;

    #[async_trait]
    impl Handler for NopHandler {
        async fn handle(&self, _initial: String, _io: SessionIo) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn route_table_matches_v1_and_v2_beta_prefixes() {
        let mut routes = RouteTable::new();
        routes.register("logs/", || Arc::new(NopHandler));

        assert!(routes.resolve("/v1/logs/?token=abc").is_some());
        assert!(routes.resolve("/v2-beta/logs/?token=abc").is_some());
        assert!(routes.resolve("/v1/unknown/").is_none());
    }

    #[test]
    fn route_table_prefers_most_specific_first_registered() {
        let mut routes = RouteTable::new();
        routes.register("stats/", || Arc::new(NopHandler));
        routes.register("hoststats/", || Arc::new(NopHandler));
        assert!(routes.resolve("/v1/hoststats/").is_some());
    }
}
