//! Container stats handler (spec.md §4.6, id in path OR claim set).
//!
//! Resolution order for the target set:
//! 1. An id in the session's URL path ⇒ exactly that container, translated
//!    through the `containerIds` claim mapping if present (dropped if the
//!    mapping is present but lacks an entry for it).
//! 2. No path id, `containerIds` claim present ⇒ its keys are the watch
//!    set; values are the reported ids.
//! 3. No path id, no `containerIds` claim ⇒ every currently running or
//!    paused container, unfiltered (spec.md §8: "token with missing
//!    containerIds claim: stats handler serves all containers").
//!
//! Historical backlog on the first tick (spec.md §4.6) is the
//! responsibility of the engine's own `stream_container_stats` feed here —
//! unlike host stats, this is a genuine stream, so bursting its backlog
//! before settling into one-sample-per-second is naturally the producer's
//! job, not the handler's.

use super::aggregated::{AggregatedStat, ResourceType};
use crate::engine::ContainerEngine;
use crate::proxy::handler::{Handler, SessionIo};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct ContainerStatsHandler {
    engine: Arc<dyn ContainerEngine>,
    verifier: Arc<crate::auth::TokenVerifier>,
}

impl ContainerStatsHandler {
    pub fn new(engine: Arc<dyn ContainerEngine>, verifier: Arc<crate::auth::TokenVerifier>) -> Self {
        Self { engine, verifier }
    }

    /// Extract a trailing container-id path segment, if any, from a
    /// `containerstats/<id>` (or `stats/<id>`) style URL.
    fn path_container_id(initial_message: &str) -> Option<String> {
        let path = initial_message.split('?').next().unwrap_or(initial_message);
        let trimmed = path.trim_end_matches('/');
        let last = trimmed.rsplit('/').next()?;
        let last = last.trim();
        (!last.is_empty() && !last.eq_ignore_ascii_case("containerstats") && !last.eq_ignore_ascii_case("stats"))
            .then(|| last.to_string())
    }
}

#[async_trait]
impl Handler for ContainerStatsHandler {
    async fn handle(&self, initial_message: String, mut io: SessionIo) -> anyhow::Result<()> {
        let claims = match super::super::verify_session_token(&self.verifier, &initial_message) {
            Ok(c) => c,
            Err(e) => {
                debug!(err = %e, "container-stats session rejected");
                return Ok(());
            }
        };

        let targets: Vec<(String, String)> = if let Some(path_id) = Self::path_container_id(&initial_message) {
            match &claims.container_ids {
                Some(map) => match map.get(&path_id) {
                    Some(reported) => vec![(path_id, reported.clone())],
                    None => {
                        debug!(id = %path_id, "container id absent from containerIds mapping — dropping");
                        Vec::new()
                    }
                },
                None => vec![(path_id.clone(), path_id)],
            }
        } else if let Some(map) = &claims.container_ids {
            map.iter().map(|(ext, reported)| (ext.clone(), reported.clone())).collect()
        } else {
            match self.engine.list_running_or_paused().await {
                Ok(ids) => ids.into_iter().map(|id| (id.clone(), id)).collect(),
                Err(e) => {
                    warn!(err = %e, "failed to list containers for unfiltered stats — ending session");
                    return Ok(());
                }
            }
        };

        if targets.is_empty() {
            return Ok(());
        }

        let mem_total = self.engine.host_mem_total().await.unwrap_or(0);
        let (tx, mut rx) = mpsc::channel::<(String, crate::engine::RawStatSample)>(64);

        for (watch_id, reported_id) in targets {
            let mut feed = match self.engine.stream_container_stats(&watch_id).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(id = %watch_id, err = %e, "could not open container stats feed — skipping");
                    continue;
                }
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(sample) = feed.recv().await {
                    if tx.send((reported_id.clone(), sample)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        loop {
            tokio::select! {
                biased;
                inbound = io.inbound.recv() => {
                    if inbound.is_none() {
                        break;
                    }
                }
                sample = rx.recv() => {
                    let Some((id, raw)) = sample else { break };
                    let stat = AggregatedStat::from_raw(id, ResourceType::Container, mem_total, raw);
                    if io.send(stat.to_line()).await.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// cAdvisor/systemd cgroup path for a container id (supplemented from
/// `original_source/stats/stats.go`'s `useSystemd()` / `resolveContainer`,
/// not named in spec.md's own §4.6 but present in the Go original this
/// spec was distilled from). A concrete cAdvisor-backed `ContainerEngine`
/// uses this to pick the right cgroup before opening its stats feed; the
/// engine contract itself stays opaque to the distinction.
pub fn resolve_cgroup_path(container_id: &str, systemd_available: bool) -> String {
    if systemd_available {
        format!("/system.slice/docker-{container_id}.scope")
    } else {
        format!("/docker/{container_id}")
    }
}

/// `true` when this host's cgroup driver is systemd — detected by the
/// presence of `/run/systemd/system`, matching the Go original's
/// `useSystemd()`.
pub fn host_uses_systemd_cgroups() -> bool {
    std::path::Path::new("/run/systemd/system").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_path_picks_systemd_scope_form() {
        assert_eq!(
            resolve_cgroup_path("abc123", true),
            "/system.slice/docker-abc123.scope"
        );
    }

    #[test]
    fn cgroup_path_picks_plain_cgroupfs_form() {
        assert_eq!(resolve_cgroup_path("abc123", false), "/docker/abc123");
    }

    #[test]
    fn path_container_id_extracts_trailing_segment() {
        assert_eq!(
            ContainerStatsHandler::path_container_id("/v1/containerstats/C1?token=t"),
            Some("C1".to_string())
        );
    }

    #[test]
    fn path_container_id_none_when_bare_prefix() {
        assert_eq!(ContainerStatsHandler::path_container_id("/v1/containerstats/"), None);
        assert_eq!(ContainerStatsHandler::path_container_id("/v1/containerstats"), None);
    }
}
