//! Start handler: IP injection + DNS rewrite (spec.md §4.8).
//!
//! Runs for every `start` event, synthetic or real. Each step
//! short-circuits the remaining steps on its stated predicate; the state
//! machine for one event is linear and keeps no state across events.

use super::resolv;
use super::EventHandler;
use crate::engine::types::{labels, ContainerRecord, StateFile};
use crate::engine::{ContainerEngine, ContainerEvent};
use crate::locks::LockTable;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{info, warn};

/// MTU overhead subtracted from the default-gateway interface's MTU to
/// derive the reduced MTU given to ordinary (non-system) containers
/// (spec.md §4.8 step 6).
const MTU_OVERHEAD: u32 = 98;

pub struct StartHandler {
    state_dir: PathBuf,
    /// MTU for non-system containers: gateway MTU minus overhead, floored
    /// by the engine bridge's own MTU.
    user_mtu: u32,
    /// MTU for system containers: the gateway's raw MTU.
    system_mtu: u32,
}

impl StartHandler {
    pub async fn new(engine: &dyn ContainerEngine, state_dir: PathBuf) -> anyhow::Result<Self> {
        let gateway_mtu = engine.gateway_mtu().await?;
        let bridge_mtu = engine.bridge_mtu().await?;
        let user_mtu = gateway_mtu.saturating_sub(MTU_OVERHEAD).max(bridge_mtu);
        Ok(Self {
            state_dir,
            user_mtu,
            system_mtu: gateway_mtu,
        })
    }

    #[cfg(test)]
    fn with_mtus(state_dir: PathBuf, user_mtu: u32, system_mtu: u32) -> Self {
        Self {
            state_dir,
            user_mtu,
            system_mtu,
        }
    }

    /// Step 3: desired `<addr>/<cidr>`, in priority order — label, env,
    /// state-directory descriptor.
    async fn resolve_ip(&self, record: &ContainerRecord) -> Option<String> {
        if let Some(ip) = record.label(labels::CONTAINER_IP) {
            return Some(ip.to_string());
        }
        if let Some(ip) = record.rancher_ip_env() {
            return Some(ip.to_string());
        }
        let path = self.state_dir.join(&record.id);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        let state: StateFile = serde_json::from_str(&content).ok()?;
        state.primary_ip()
    }
}

#[async_trait]
impl EventHandler for StartHandler {
    async fn handle(&self, engine: &dyn ContainerEngine, locks: &LockTable, event: &ContainerEvent) -> anyhow::Result<()> {
        // Step 1: per-container serialization.
        let key = format!("start.{}", event.id);
        let Some(_guard) = locks.try_lock(&key) else {
            return Ok(());
        };

        let record = engine.inspect_container(&event.id).await?;

        // Step 2.
        if record.is_vm() {
            return Ok(());
        }

        // Step 3.
        let ip = self.resolve_ip(&record).await;

        // Step 4.
        if ip.is_none() && !record.dns_explicitly_enabled() {
            return Ok(());
        }

        if let Some(ip) = &ip {
            // Step 5.
            if !record.running {
                info!(id = %record.id, "container not running at IP-injection time — skipping");
                return Ok(());
            }

            // Step 6.
            let mtu = if record.is_system() { self.system_mtu } else { self.user_mtu };
            if let Err(e) = engine.configure_ip(record.pid, ip, mtu).await {
                let recheck = engine.inspect_container(&event.id).await?;
                if !recheck.running {
                    return Ok(());
                }
                return Err(e);
            }
        }

        // Step 7.
        if record.is_system() {
            return Ok(());
        }
        if record.dns_explicitly_disabled() && ip.is_none() {
            return Ok(());
        }
        if record.resolv_conf_path.is_empty() {
            warn!(id = %record.id, "no resolvConfPath on container record — skipping DNS rewrite");
            return Ok(());
        }

        let extra_domains = resolv::derive_search_domains(&record);
        resolv::rewrite_file(&record.resolv_conf_path, &extra_domains).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecConfig, ExecSession, LogChunk, LogOptions, RawStatSample};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct FakeEngine {
        record: ContainerRecord,
        configure_calls: Mutex<Vec<(i32, String, u32)>>,
        configure_fails: AtomicU32,
        recheck_running: bool,
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn inspect_container(&self, _id: &str) -> anyhow::Result<ContainerRecord> {
            if self.configure_fails.load(Ordering::SeqCst) > 0 {
                let mut r = self.record.clone();
                r.running = self.recheck_running;
                return Ok(r);
            }
            Ok(self.record.clone())
        }
        async fn list_running_or_paused(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn subscribe_events(&self) -> anyhow::Result<mpsc::Receiver<ContainerEvent>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        async fn stream_logs(&self, _c: &str, _o: LogOptions) -> anyhow::Result<mpsc::Receiver<LogChunk>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        async fn create_exec(&self, _cfg: &ExecConfig) -> anyhow::Result<Box<dyn ExecSession>> {
            anyhow::bail!("unused")
        }
        fn control_socket_path(&self) -> PathBuf {
            PathBuf::from("/dev/null")
        }
        async fn stream_container_stats(&self, _c: &str) -> anyhow::Result<mpsc::Receiver<RawStatSample>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        async fn host_stats(&self) -> anyhow::Result<RawStatSample> {
            anyhow::bail!("unused")
        }
        async fn host_mem_total(&self) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn configure_ip(&self, pid: i32, ip: &str, mtu: u32) -> anyhow::Result<()> {
            self.configure_calls.lock().unwrap().push((pid, ip.to_string(), mtu));
            if self.configure_fails.load(Ordering::SeqCst) > 0 {
                anyhow::bail!("helper exited nonzero");
            }
            Ok(())
        }
        async fn gateway_mtu(&self) -> anyhow::Result<u32> {
            Ok(1500)
        }
        async fn bridge_mtu(&self) -> anyhow::Result<u32> {
            Ok(1450)
        }
    }

    fn base_record() -> ContainerRecord {
        ContainerRecord {
            id: "C3".into(),
            running: true,
            pid: 42,
            resolv_conf_path: String::new(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn vm_label_skips_helper_entirely() {
        let mut record = base_record();
        record.labels.insert(labels::VM.to_string(), "true".to_string());
        let engine = FakeEngine {
            record,
            configure_calls: Mutex::new(vec![]),
            configure_fails: AtomicU32::new(0),
            recheck_running: true,
        };
        let locks = LockTable::new();
        let handler = StartHandler::with_mtus(PathBuf::from("/tmp/nonexistent"), 1402, 1500);

        handler
            .handle(&engine, &locks, &ContainerEvent::synthetic_start("C3", 0))
            .await
            .unwrap();

        assert!(engine.configure_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn happy_path_invokes_helper_with_labeled_ip_and_user_mtu() {
        let mut record = base_record();
        record.labels.insert(labels::CONTAINER_IP.to_string(), "10.1.2.3/16".to_string());
        let engine = FakeEngine {
            record,
            configure_calls: Mutex::new(vec![]),
            configure_fails: AtomicU32::new(0),
            recheck_running: true,
        };
        let locks = LockTable::new();
        let handler = StartHandler::with_mtus(PathBuf::from("/tmp/nonexistent"), 1402, 1500);

        handler
            .handle(&engine, &locks, &ContainerEvent::synthetic_start("C3", 0))
            .await
            .unwrap();

        let calls = engine.configure_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (42, "10.1.2.3/16".to_string(), 1402));
    }

    #[tokio::test]
    async fn helper_failure_on_stopped_container_returns_ok_not_error() {
        let mut record = base_record();
        record.labels.insert(labels::CONTAINER_IP.to_string(), "10.1.2.3/16".to_string());
        let engine = FakeEngine {
            record,
            configure_calls: Mutex::new(vec![]),
            configure_fails: AtomicU32::new(1),
            recheck_running: false,
        };
        let locks = LockTable::new();
        let handler = StartHandler::with_mtus(PathBuf::from("/tmp/nonexistent"), 1402, 1500);

        let result = handler
            .handle(&engine, &locks, &ContainerEvent::synthetic_start("C3", 0))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn helper_failure_on_still_running_container_propagates_error() {
        let mut record = base_record();
        record.labels.insert(labels::CONTAINER_IP.to_string(), "10.1.2.3/16".to_string());
        let engine = FakeEngine {
            record,
            configure_calls: Mutex::new(vec![]),
            configure_fails: AtomicU32::new(1),
            recheck_running: true,
        };
        let locks = LockTable::new();
        let handler = StartHandler::with_mtus(PathBuf::from("/tmp/nonexistent"), 1402, 1500);

        let result = handler
            .handle(&engine, &locks, &ContainerEvent::synthetic_start("C3", 0))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn no_ip_and_dns_not_true_returns_without_touching_anything() {
        let record = base_record();
        let engine = FakeEngine {
            record,
            configure_calls: Mutex::new(vec![]),
            configure_fails: AtomicU32::new(0),
            recheck_running: true,
        };
        let locks = LockTable::new();
        let handler = StartHandler::with_mtus(PathBuf::from("/tmp/nonexistent"), 1402, 1500);

        handler
            .handle(&engine, &locks, &ContainerEvent::synthetic_start("C3", 0))
            .await
            .unwrap();
        assert!(engine.configure_calls.lock().unwrap().is_empty());
    }
}
