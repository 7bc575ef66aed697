//! The handler capability set (spec.md §9 "Polymorphism").
//!
//! Every session kind — logs, exec, docker-socket proxy, HTTP tunnel,
//! stats — implements the same single-method trait; the demux dispatches
//! by path prefix to a handler factory, then calls `handle` once per
//! session and awaits it to completion. Grounded on the teacher's
//! `Runner` trait (`examples/clawde-io-apps/daemon/src/session/runner.rs`):
//! one capability set, `Send + Sync`, invoked through `Arc<dyn Trait>`.

use super::frame::Frame;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Per-session collaborator handed to every `Handler::handle` call.
///
/// `inbound` yields `Body` frame payloads in arrival order and closes
/// (ends iteration) the instant the session is torn down from either
/// direction — this is the sole cancellation signal (spec.md §5).
/// `outbound` is the shared fan-in sink feeding the websocket writer —
/// every message on the wire must be a serialized `{key,type,body}`
/// Frame (spec.md §6), so handlers call `send` rather than writing to
/// `outbound` directly; `send` wraps the payload in this session's
/// `key` before enqueueing it.
pub struct SessionIo {
    pub key: String,
    pub inbound: mpsc::Receiver<String>,
    pub outbound: mpsc::Sender<String>,
}

impl SessionIo {
    /// Wrap `payload` as this session's `Body` frame and enqueue it on
    /// the shared outbound fan-in sink.
    pub async fn send(&self, payload: impl Into<String>) -> Result<(), mpsc::error::SendError<String>> {
        self.outbound.send(Frame::body(self.key.clone(), payload).to_json()).await
    }
}

/// One sub-protocol implementation, selected by URL path prefix
/// (spec.md §6: `logs/`, `stats/`, `hoststats/`, `containerstats/`,
/// `exec/`, `console/`, `dockersocket/`, `container-proxy/`).
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run for the lifetime of one session. `initial_message` is the
    /// `Connect` frame's body (the request URL, carrying `?token=...`).
    /// Must return once `io.inbound` closes or the handler's own work is
    /// done; the caller (session demux) emits the terminal `Close` frame
    /// regardless of how this returns, including on error.
    async fn handle(&self, initial_message: String, io: SessionIo) -> anyhow::Result<()>;
}

/// Factory invoked once per matched `Connect` frame. Kept separate from
/// `Handler` itself so stateless handlers (most of them) can be shared via
/// one `Arc` while still receiving fresh per-session construction args
/// (engine handle, auth verifier) through the closure's captures.
pub type HandlerFactory = std::sync::Arc<dyn Fn() -> std::sync::Arc<dyn Handler> + Send + Sync>;
