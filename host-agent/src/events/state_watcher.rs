//! State-directory watcher (spec.md §4.9).
//!
//! Synthesizes `start` events for container descriptors appearing on disk
//! and self-heals if the directory disappears from under it. Grounded on
//! the teacher's `MailboxWatcher`
//! (`examples/clawde-io-apps/daemon/src/mailbox/watcher.rs`): `notify`
//! callback forwarding into a tokio `mpsc` channel, processed on a
//! spawned task.

use crate::engine::ContainerEvent;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

const HEALTHCHECK_FILE: &str = ".healthcheck";
const TMP_PREFIX: &str = "tmp-";

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub healthcheck_interval: Duration,
    pub healthcheck_timeout: Duration,
    pub restart_attempts: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            healthcheck_interval: Duration::from_secs(8),
            healthcheck_timeout: Duration::from_secs(10),
            restart_attempts: 5,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WatchOutcome {
    Start(String),
    HealthcheckPing,
    Ignored,
}

fn classify(basename: &str) -> WatchOutcome {
    if basename == HEALTHCHECK_FILE {
        WatchOutcome::HealthcheckPing
    } else if basename.starts_with(TMP_PREFIX) {
        WatchOutcome::Ignored
    } else {
        WatchOutcome::Start(basename.to_string())
    }
}

/// Run the watcher until it declares itself unhealthy or the filesystem
/// channel closes, retrying with exponential back-off per
/// `config.restart_attempts` (spec.md §4.9's restart loop), via the same
/// generic helper the token-exchange loop uses.
pub async fn run_with_restarts(dir: PathBuf, events_tx: mpsc::Sender<ContainerEvent>, config: WatcherConfig) -> anyhow::Result<()> {
    let retry_cfg = crate::retry::RetryConfig::exponential(config.restart_attempts, Duration::from_secs(1));
    crate::retry::retry_with_backoff(&retry_cfg, |_attempt| {
        let dir = dir.clone();
        let events_tx = events_tx.clone();
        let config = config.clone();
        async move { run_once(&dir, &events_tx, &config).await }
    })
    .await
}

async fn run_once(dir: &Path, events_tx: &mpsc::Sender<ContainerEvent>, config: &WatcherConfig) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let (fs_tx, mut fs_rx) = mpsc::channel::<Result<Event, notify::Error>>(64);
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = fs_tx.blocking_send(res);
        },
        Config::default(),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    info!(path = %dir.display(), "watching container state directory");

    let healthcheck_path = dir.join(HEALTHCHECK_FILE);
    let hc_ping = Arc::new(Notify::new());

    let mut writer = tokio::spawn(healthcheck_writer(healthcheck_path, config.healthcheck_interval));
    let mut monitor = tokio::spawn(healthcheck_monitor(hc_ping.clone(), config.healthcheck_timeout));

    let outcome = tokio::select! {
        biased;
        joined = &mut monitor => {
            match joined {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => unreachable!("monitor only returns on failure"),
                Err(join_err) => Err(anyhow::anyhow!(join_err)),
            }
        }
        _ = process_events(&mut fs_rx, events_tx, &hc_ping) => {
            Err(anyhow::anyhow!("state-directory watch channel closed"))
        }
    };

    writer.abort();
    monitor.abort();
    drop(watcher);
    outcome
}

async fn process_events(fs_rx: &mut mpsc::Receiver<Result<Event, notify::Error>>, events_tx: &mpsc::Sender<ContainerEvent>, hc_ping: &Notify) {
    while let Some(event_res) = fs_rx.recv().await {
        match event_res {
            Ok(event) => handle_event(&event, events_tx, hc_ping).await,
            Err(e) => warn!(err = %e, "state-directory watcher error"),
        }
    }
}

async fn handle_event(event: &Event, events_tx: &mpsc::Sender<ContainerEvent>, hc_ping: &Notify) {
    if !matches!(event.kind, EventKind::Create(_)) {
        return;
    }
    for path in &event.paths {
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match classify(basename) {
            WatchOutcome::HealthcheckPing => hc_ping.notify_one(),
            WatchOutcome::Ignored => {}
            WatchOutcome::Start(id) => {
                let now = chrono::Utc::now().timestamp();
                if events_tx.send(ContainerEvent::synthetic_start(id, now)).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn healthcheck_writer(path: PathBuf, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = tokio::fs::write(&path, chrono::Utc::now().timestamp().to_string()).await {
            warn!(path = %path.display(), err = %e, "failed to write health-check sentinel");
        }
    }
}

async fn healthcheck_monitor(hc_ping: Arc<Notify>, timeout: Duration) -> anyhow::Result<()> {
    loop {
        if tokio::time::timeout(timeout, hc_ping.notified()).await.is_err() {
            anyhow::bail!("health-check sentinel not observed within {timeout:?} — watcher unhealthy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_healthcheck_file() {
        assert_eq!(classify(HEALTHCHECK_FILE), WatchOutcome::HealthcheckPing);
    }

    #[test]
    fn classifies_tmp_prefixed_names_as_ignored() {
        assert_eq!(classify("tmp-abc123"), WatchOutcome::Ignored);
    }

    #[test]
    fn classifies_ordinary_basename_as_start() {
        assert_eq!(classify("c_a1b2c3"), WatchOutcome::Start("c_a1b2c3".to_string()));
    }

    #[tokio::test]
    async fn new_file_in_watched_directory_emits_synthetic_start() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("containers");
        let (events_tx, mut events_rx) = mpsc::channel(8);

        let config = WatcherConfig {
            healthcheck_interval: Duration::from_millis(30),
            healthcheck_timeout: Duration::from_secs(5),
            restart_attempts: 1,
        };
        let dir_clone = dir.clone();
        let handle = tokio::spawn(async move { run_once(&dir_clone, &events_tx, &config).await });

        // Let the watcher establish itself before writing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::fs::write(dir.join("c_new"), b"{}").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("timed out waiting for synthetic start event")
            .expect("channel closed");
        assert_eq!(event.id, "c_new");
        assert!(event.is_synthetic());

        handle.abort();
    }

    #[tokio::test]
    async fn monitor_reports_unhealthy_when_no_ping_arrives() {
        let hc_ping = Arc::new(Notify::new());
        let result = healthcheck_monitor(hc_ping, Duration::from_millis(30)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn monitor_stays_healthy_while_pings_keep_arriving() {
        let hc_ping = Arc::new(Notify::new());
        let pinger = hc_ping.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                pinger.notify_one();
            }
        });
        let result = tokio::time::timeout(Duration::from_millis(200), healthcheck_monitor(hc_ping, Duration::from_millis(80))).await;
        assert!(result.is_err(), "monitor loop never returns on its own while healthy — timeout is expected");
    }
}
