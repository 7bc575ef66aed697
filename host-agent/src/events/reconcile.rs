//! Startup reconciliation (spec.md §4.7).
//!
//! On start, list every container already `paused`/`running` and inject a
//! synthetic `start` event for each, so handler chains see a consistent
//! view regardless of whether they were live when the container actually
//! started. Zero containers at startup emits zero events — no deadlock
//! (spec.md §8 boundary case).

use crate::engine::{ContainerEngine, ContainerEvent};
use tokio::sync::mpsc;
use tracing::info;

pub async fn reconcile(engine: &dyn ContainerEngine, events_tx: &mpsc::Sender<ContainerEvent>, now: i64) -> anyhow::Result<usize> {
    let ids = engine.list_running_or_paused().await?;
    let mut emitted = 0;
    for id in ids {
        if events_tx.send(ContainerEvent::synthetic_start(id, now)).await.is_err() {
            break;
        }
        emitted += 1;
    }
    info!(emitted, "startup reconciliation complete");
    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ContainerRecord;
    use crate::engine::{ExecConfig, ExecSession, LogChunk, LogOptions, RawStatSample};
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct FakeEngine {
        ids: Vec<String>,
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn inspect_container(&self, id: &str) -> anyhow::Result<ContainerRecord> {
            Ok(ContainerRecord {
                id: id.to_string(),
                ..Default::default()
            })
        }
        async fn list_running_or_paused(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.ids.clone())
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
        async fn configure_ip(&self, _pid: i32, _ip: &str, _mtu: u32) -> anyhow::Result<()> {
            Ok(())
        }
        async fn gateway_mtu(&self) -> anyhow::Result<u32> {
            Ok(1500)
        }
        async fn bridge_mtu(&self) -> anyhow::Result<u32> {
            Ok(1500)
        }
    }

    #[tokio::test]
    async fn zero_containers_emits_zero_events() {
        let engine = FakeEngine { ids: vec![] };
        let (tx, _rx) = mpsc::channel(8);
        let n = reconcile(&engine, &tx, 0).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn emits_one_synthetic_start_per_running_container() {
        let engine = FakeEngine {
            ids: vec!["C1".into(), "C2".into()],
        };
        let (tx, mut rx) = mpsc::channel(8);
        let n = reconcile(&engine, &tx, 42).await.unwrap();
        assert_eq!(n, 2);

        let e1 = rx.recv().await.unwrap();
        assert!(e1.is_synthetic());
        assert_eq!(e1.time, 42);
    }
}
