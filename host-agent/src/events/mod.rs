//! Container lifecycle reactor (spec.md §4.7-§4.9).
//!
//! `EventRouter` consumes the engine's event stream (plus synthetic events
//! from startup reconciliation and the state-directory watcher) and
//! dispatches each to its configured handler chain with bounded
//! concurrency. No teacher file implements an event-dispatch worker pool
//! directly; the closest pattern in the pack is the fixed-capacity
//! resource pool in `examples/clawde-io-apps/daemon/src/perf/connection_pool.rs`
//! (bounded concurrent workers, reconnect/backoff semantics) — the token
//! pool here plays the same "fixed number of slots, tasks wait for one"
//! role, built on `tokio::sync::Semaphore` rather than a hand-rolled queue.

pub mod reconcile;
pub mod resolv;
pub mod start_handler;
pub mod state_watcher;

use crate::engine::{ContainerEngine, ContainerEvent, ContainerStatus};
use crate::locks::LockTable;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

const WORKER_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, engine: &dyn ContainerEngine, locks: &LockTable, event: &ContainerEvent) -> anyhow::Result<()>;
}

pub struct EventRouter {
    engine: Arc<dyn ContainerEngine>,
    locks: Arc<LockTable>,
    handlers: HashMap<ContainerStatus, Vec<Arc<dyn EventHandler>>>,
    tokens: Arc<Semaphore>,
}

impl EventRouter {
    pub fn new(engine: Arc<dyn ContainerEngine>, pool_size: usize) -> Self {
        Self {
            engine,
            locks: Arc::new(LockTable::new()),
            handlers: HashMap::new(),
            tokens: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    pub fn register(&mut self, status: ContainerStatus, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(status).or_default().push(handler);
    }

    /// Drain `events` until the channel closes, dispatching each event to
    /// its handler chain on a bounded worker. Events are never dropped: a
    /// dispatch that can't get a worker token within 60 s just logs and
    /// keeps waiting for one (spec.md §4.7, §5).
    pub async fn run(&self, mut events: mpsc::Receiver<ContainerEvent>) {
        while let Some(event) = events.recv().await {
            let permit = loop {
                match tokio::time::timeout(WORKER_WAIT_TIMEOUT, self.tokens.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => break permit,
                    Ok(Err(_)) => return, // semaphore closed — router shutting down
                    Err(_) => {
                        warn!(id = %event.id, status = %event.status.as_str(), "no worker token free after 60s — still waiting");
                    }
                }
            };

            let chain = self.handlers.get(&event.status).cloned().unwrap_or_default();
            let engine = self.engine.clone();
            let locks = self.locks.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let _permit = permit;
                for handler in &chain {
                    if let Err(e) = handler.handle(engine.as_ref(), &locks, &event).await {
                        warn!(id = %event.id, status = %event.status.as_str(), err = %e, "event handler failed");
                    }
                }
            });
        }
    }
}
