//! Host stats handler (spec.md §4.6, no id in path).
//!
//! Samples CPU (aggregate + per-core), memory, disk and primary-NIC byte
//! counters once per second, and packages each sample as
//! `AggregatedStat{resourceType:"host", id: resourceId}`.
//!
//! `host_stats()` on the engine contract is a single request/response call,
//! not a stream, so the historical-backlog burst required on the first
//! tick (spec.md §4.6 "first tick may emit up to N historical samples") is
//! produced here by calling it `num_stats` times before starting the
//! once-per-second ticker; a failed call during the burst ends it early
//! (spec.md §8 "num-stats > available samples: emit only what is
//! available").

use super::aggregated::{AggregatedStat, ResourceType};
use crate::engine::ContainerEngine;
use crate::proxy::handler::{Handler, SessionIo};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct HostStatsHandler {
    engine: Arc<dyn ContainerEngine>,
    verifier: Arc<crate::auth::TokenVerifier>,
    num_stats: u32,
}

impl HostStatsHandler {
    pub fn new(engine: Arc<dyn ContainerEngine>, verifier: Arc<crate::auth::TokenVerifier>, num_stats: u32) -> Self {
        Self {
            engine,
            verifier,
            num_stats,
        }
    }
}

#[async_trait]
impl Handler for HostStatsHandler {
    async fn handle(&self, initial_message: String, mut io: SessionIo) -> anyhow::Result<()> {
        let claims = match super::super::verify_session_token(&self.verifier, &initial_message) {
            Ok(c) => c,
            Err(e) => {
                debug!(err = %e, "host-stats session rejected");
                return Ok(());
            }
        };
        let resource_id = claims.resource_id.unwrap_or_default();
        let mem_total = self.engine.host_mem_total().await.unwrap_or(0);

        for _ in 0..self.num_stats {
            match self.engine.host_stats().await {
                Ok(raw) => {
                    let stat = AggregatedStat::from_raw(resource_id.clone(), ResourceType::Host, mem_total, raw);
                    if io.send(stat.to_line()).await.is_err() {
                        return Ok(());
                    }
                }
                Err(_) => break,
            }
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                biased;
                inbound = io.inbound.recv() => {
                    if inbound.is_none() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.engine.host_stats().await {
                        Ok(raw) => {
                            let stat = AggregatedStat::from_raw(resource_id.clone(), ResourceType::Host, mem_total, raw);
                            if io.send(stat.to_line()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(err = %e, "host stats sample failed"),
                    }
                }
            }
        }

        Ok(())
    }
}
