//! Session registry and per-frame dispatch (spec.md §3, §4.1).
//!
//! A `Session` exists from the first `Connect{key}` frame until either the
//! handler returns or a `Close{key}` frame arrives for it — whichever
//! comes first; the other becomes a no-op. The registry is the "master
//! session registry" singleton named in spec.md §9, built the way the
//! teacher guards its own registries — a `Mutex`/`RwLock`-wrapped map,
//! constructed once, independently constructible in tests
//! (`examples/clawde-io-apps/daemon/src/session/mod.rs`'s
//! `handles: RwLock<HashMap<String, Arc<SessionHandle>>>`).

use super::frame::Frame;
use super::handler::{Handler, SessionIo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const INBOUND_BUFFER: usize = 256;

/// Live sessions keyed by `Frame::key`. Holding the inbound sender keeps
/// the handler's receiver open; dropping it (on explicit `Close`) ends the
/// handler's inbound stream without the demux blocking on it.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<String, mpsc::Sender<String>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Register a newly spawned session's inbound sender. Returns `false`
    /// (and does not replace the existing entry) if `key` is already live —
    /// "at most one live session per key" (spec.md §3).
    async fn insert(&self, key: String, tx: mpsc::Sender<String>) -> bool {
        let mut table = self.inner.lock().await;
        if table.contains_key(&key) {
            return false;
        }
        table.insert(key, tx);
        true
    }

    async fn remove(&self, key: &str) -> Option<mpsc::Sender<String>> {
        self.inner.lock().await.remove(key)
    }

    async fn get(&self, key: &str) -> Option<mpsc::Sender<String>> {
        self.inner.lock().await.get(key).cloned()
    }
}

/// Dispatches one decoded inbound `Frame` against the session table,
/// spawning new handler tasks on `Connect` and routing `Body`/`Close`
/// frames to the matching session's inbound channel.
///
/// `resolve` maps the `Connect` frame's initial URL to a handler instance
/// (the path-prefix table of spec.md §4.1); returning `None` means no
/// route matched and the session is refused (teardown with an immediate
/// `Close`, no handler spawned).
pub struct SessionDemux {
    table: Arc<SessionTable>,
    outbound: mpsc::Sender<String>,
}

impl SessionDemux {
    pub fn new(table: Arc<SessionTable>, outbound: mpsc::Sender<String>) -> Self {
        Self { table, outbound }
    }

    pub async fn dispatch(&self, frame: Frame, resolve: &(dyn Fn(&str) -> Option<Arc<dyn Handler>> + Send + Sync)) {
        match frame.frame_type {
            super::frame::FrameType::Connect => self.on_connect(frame, resolve).await,
            super::frame::FrameType::Body => self.on_body(frame).await,
            super::frame::FrameType::Close => self.on_close(frame).await,
        }
    }

    async fn on_connect(&self, frame: Frame, resolve: &(dyn Fn(&str) -> Option<Arc<dyn Handler>> + Send + Sync)) {
        let key = frame.key.clone();
        let handler = match resolve(&frame.body) {
            Some(h) => h,
            None => {
                warn!(key = %key, url = %frame.body, "no handler matched — refusing session");
                let _ = self.outbound.send(Frame::close(key).to_json()).await;
                return;
            }
        };

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        if !self.table.insert(key.clone(), tx).await {
            warn!(key = %key, "duplicate Connect for a live session — ignoring");
            return;
        }

        let table = self.table.clone();
        let outbound = self.outbound.clone();
        let initial_message = frame.body;
        tokio::spawn(async move {
            let io = SessionIo {
                key: key.clone(),
                inbound: rx,
                outbound: outbound.clone(),
            };
            let result = handler.handle(initial_message, io).await;
            if let Err(e) = result {
                warn!(key = %key, err = %e, "session handler returned an error");
            }
            table.remove(&key).await;
            // Teardown guarantee (spec.md §4.1): emitted exactly once, here,
            // regardless of the handler's exit path.
            let _ = outbound.send(Frame::close(key).to_json()).await;
        });
    }

    async fn on_body(&self, frame: Frame) {
        let Some(tx) = self.table.get(&frame.key).await else {
            debug!(key = %frame.key, "Body frame for unknown/dead session — dropping");
            return;
        };
        // Blocking here is intentional: a session's bounded inbound queue is
        // the sole backpressure signal all the way back to the websocket
        // read loop (spec.md §5). Ordering within this session is preserved;
        // no ordering is promised across sessions.
        let _ = tx.send(frame.body).await;
    }

    async fn on_close(&self, frame: Frame) {
        // Dropping the sender closes the handler's inbound receiver, which
        // is the sole cancellation signal (spec.md §5). No outbound Close
        // is sent here — the handler task's own teardown path owns that.
        let _ = self.table.remove(&frame.key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::handler::Handler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, _initial: String, mut io: SessionIo) -> anyhow::Result<()> {
            while let Some(msg) = io.inbound.recv().await {
                io.send(msg).await.ok();
            }
            Ok(())
        }
    }

    fn resolver(counter: Arc<AtomicUsize>) -> impl Fn(&str) -> Option<Arc<dyn Handler>> + Send + Sync {
        move |_url| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(EchoHandler) as Arc<dyn Handler>)
        }
    }

    #[tokio::test]
    async fn connect_body_close_emits_exactly_one_close_frame() {
        let table = Arc::new(SessionTable::new());
        let (out_tx, mut out_rx) = mpsc::channel(32);
        let demux = SessionDemux::new(table.clone(), out_tx);
        let counter = Arc::new(AtomicUsize::new(0));
        let resolve = resolver(counter);

        demux
            .dispatch(Frame::connect("k1", "/v1/echo/"), &resolve)
            .await;
        demux.dispatch(Frame::body("k1", "hello"), &resolve).await;
        demux.dispatch(Frame::close("k1"), &resolve).await;

        // The echoed body should arrive before the terminal Close.
        let first = out_rx.recv().await.unwrap();
        let echoed = Frame::from_json(&first).unwrap();
        assert_eq!(echoed.frame_type, super::super::frame::FrameType::Body);
        assert_eq!(echoed.body, "hello");
        assert_eq!(echoed.key, "k1");

        let second = out_rx.recv().await.unwrap();
        let close = Frame::from_json(&second).unwrap();
        assert_eq!(close.frame_type, super::super::frame::FrameType::Close);
        assert_eq!(close.key, "k1");

        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), out_rx.recv())
                .await
                .is_err(),
            "no second Close frame should follow"
        );
    }

    #[tokio::test]
    async fn unmatched_route_refuses_session_without_spawning_handler() {
        let table = Arc::new(SessionTable::new());
        let (out_tx, mut out_rx) = mpsc::channel(32);
        let demux = SessionDemux::new(table.clone(), out_tx);
        let resolve = |_url: &str| -> Option<Arc<dyn Handler>> { None };

        demux
            .dispatch(Frame::connect("k2", "/v1/unknown/"), &resolve)
            .await;

        let msg = out_rx.recv().await.unwrap();
        let close = Frame::from_json(&msg).unwrap();
        assert_eq!(close.frame_type, super::super::frame::FrameType::Close);
        assert_eq!(table.len().await, 0);
    }
}
