//! HAProxy health-check poller mode (spec.md §4.10).
//!
//! Optional alternative entry point: instead of multiplexing proxy
//! sessions, the agent polls HAProxy's stats socket every 2 s and reports
//! backend status transitions to the control plane. Grounded on
//! `original_source/healthcheck/healthcheck.go`'s `Monitor` — the UNIX
//! stats-socket dial mirrors this crate's own `handlers::docker_socket`,
//! and the one-shot status POST mirrors `proxy::exchange_token`'s
//! `reqwest` + `basic_auth` usage.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{info, warn};

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/haproxy/admin.sock";
const SERVER_NAME_PREFIX: &str = "cattle-";
const SERVER_NAME_FIELD: &str = "svname";
const STATUS_FIELD: &str = "status";
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
const REPORTED_STATUS_TTL: Duration = Duration::from_secs(3600);

pub type Stat = HashMap<String, String>;

#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn read_stats(&self) -> anyhow::Result<Vec<Stat>>;
}

/// Dials HAProxy's UNIX stats socket, issues `show stat`, and parses the
/// CSV response.
pub struct UnixSocketStatsSource {
    socket_path: PathBuf,
}

impl UnixSocketStatsSource {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

#[async_trait]
impl StatsSource for UnixSocketStatsSource {
    async fn read_stats(&self) -> anyhow::Result<Vec<Stat>> {
        let mut sock = UnixStream::connect(&self.socket_path).await?;
        sock.write_all(b"show stat\n").await?;

        let mut buf = String::new();
        sock.read_to_string(&mut buf).await?;
        Ok(parse_csv_stats(&buf))
    }
}

/// HAProxy's stats CSV: a `# `-prefixed header row, then one row per
/// frontend/backend/server line, comma-separated, field count varying by
/// HAProxy version — rows shorter than the header are padded with empty
/// values rather than rejected.
fn parse_csv_stats(raw: &str) -> Vec<Stat> {
    let mut lines = raw.lines();
    let header_line = match lines.next() {
        Some(l) => l.trim_start_matches("# "),
        None => return Vec::new(),
    };
    let header: Vec<&str> = header_line.split(',').collect();

    lines
        .filter(|l| !l.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            header
                .iter()
                .enumerate()
                .map(|(i, name)| (name.to_string(), fields.get(i).copied().unwrap_or("").to_string()))
                .collect()
        })
        .collect()
}

#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, server_name: &str, status: &str, timestamp: i64) -> anyhow::Result<()>;
}

/// Posts a `ServiceEvent`-shaped payload to the control plane using the
/// same cattle API-key credentials as token exchange.
pub struct CattleStatusReporter {
    client: reqwest::Client,
    cattle_url: String,
    access_key: String,
    secret_key: String,
}

impl CattleStatusReporter {
    pub fn new(client: reqwest::Client, cattle_url: String, access_key: String, secret_key: String) -> Self {
        Self {
            client,
            cattle_url,
            access_key,
            secret_key,
        }
    }
}

#[async_trait]
impl StatusReporter for CattleStatusReporter {
    async fn report(&self, server_name: &str, status: &str, timestamp: i64) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.cattle_url)
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .json(&serde_json::json!({
                "healthcheckUuid": server_name,
                "reportedHealth": status,
                "externalTimestamp": timestamp,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("reporting status {server_name}={status} failed: {}", resp.status());
        }
        Ok(())
    }
}

struct CacheEntry {
    status: String,
    inserted_at: Instant,
}

/// Tracks last-reported status per server name with a 1 h TTL — an entry
/// older than the TTL is treated as absent, forcing a re-report even if
/// the observed status hasn't changed since.
pub struct Monitor<S: StatusReporter> {
    reporter: S,
    reported: HashMap<String, CacheEntry>,
}

impl<S: StatusReporter> Monitor<S> {
    pub fn new(reporter: S) -> Self {
        Self {
            reporter,
            reported: HashMap::new(),
        }
    }

    fn previous_status(&self, server_name: &str) -> Option<&str> {
        self.reported.get(server_name).and_then(|e| {
            if e.inserted_at.elapsed() < REPORTED_STATUS_TTL {
                Some(e.status.as_str())
            } else {
                None
            }
        })
    }

    /// Apply one HAProxy stat row's transition rules and report if the
    /// (TTL-aware) status changed.
    pub async fn process_stat(&mut self, stat: &Stat, now_unix: i64) {
        let Some(raw_name) = stat.get(SERVER_NAME_FIELD) else {
            return;
        };
        if !raw_name.starts_with(SERVER_NAME_PREFIX) {
            return;
        }
        let server_name = raw_name.trim_start_matches(SERVER_NAME_PREFIX).to_string();
        let mut current_status = stat.get(STATUS_FIELD).cloned().unwrap_or_default();

        // Partial "UP <reason>" (e.g. "UP going down") is a no-op.
        if current_status.starts_with("UP ") {
            return;
        }

        let previous = self.previous_status(&server_name);
        if current_status == "UP" && previous != Some("UP") && previous != Some("INIT") {
            current_status = "INIT".to_string();
        }

        if previous == Some(current_status.as_str()) {
            return;
        }

        match self.reporter.report(&server_name, &current_status, now_unix).await {
            Ok(()) => {
                info!(server = %server_name, status = %current_status, "reported health transition");
                self.reported.insert(
                    server_name,
                    CacheEntry {
                        status: current_status,
                        inserted_at: Instant::now(),
                    },
                );
            }
            Err(e) => warn!(server = %server_name, status = %current_status, err = %e, "failed to report health transition"),
        }
    }
}

/// Poll `source` every 2 s, forwarding `cattle-`-prefixed server rows
/// through `monitor`. Runs until `source.read_stats` repeatedly errors is
/// not a stop condition — individual poll failures are logged and
/// skipped, matching the original's "log and continue" loop.
pub async fn run<S: StatsSource, R: StatusReporter>(source: S, monitor: &mut Monitor<R>) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let stats = match source.read_stats().await {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to read haproxy stats");
                continue;
            }
        };

        let now = chrono::Utc::now().timestamp();
        for stat in &stats {
            monitor.process_stat(stat, now).await;
        }
    }
}

pub fn default_socket_path() -> PathBuf {
    Path::new(DEFAULT_SOCKET_PATH).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn parses_header_and_rows() {
        let raw = "# pxname,svname,status\nweb,cattle-abc,UP\nweb,cattle-def,DOWN\n";
        let stats = parse_csv_stats(raw);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].get("svname").unwrap(), "cattle-abc");
        assert_eq!(stats[0].get("status").unwrap(), "UP");
    }

    #[test]
    fn short_row_pads_missing_fields_as_empty() {
        let raw = "# pxname,svname,status,extra\nweb,cattle-abc,UP\n";
        let stats = parse_csv_stats(raw);
        assert_eq!(stats[0].get("extra").unwrap(), "");
    }

    struct RecordingReporter {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl StatusReporter for RecordingReporter {
        async fn report(&self, server_name: &str, status: &str, _timestamp: i64) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((server_name.to_string(), status.to_string()));
            Ok(())
        }
    }

    fn stat(svname: &str, status: &str) -> Stat {
        let mut s = Stat::new();
        s.insert(SERVER_NAME_FIELD.to_string(), svname.to_string());
        s.insert(STATUS_FIELD.to_string(), status.to_string());
        s
    }

    #[tokio::test]
    async fn non_prefixed_server_is_ignored() {
        let reporter = RecordingReporter { calls: Mutex::new(vec![]) };
        let mut monitor = Monitor::new(reporter);
        monitor.process_stat(&stat("other-abc", "UP"), 0).await;
        assert!(monitor.reporter.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_up_is_a_no_op() {
        let reporter = RecordingReporter { calls: Mutex::new(vec![]) };
        let mut monitor = Monitor::new(reporter);
        monitor.process_stat(&stat("cattle-web1", "UP going down"), 0).await;
        assert!(monitor.reporter.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_up_transition_reports_init_then_next_up_reports_up() {
        let reporter = RecordingReporter { calls: Mutex::new(vec![]) };
        let mut monitor = Monitor::new(reporter);

        monitor.process_stat(&stat("cattle-web1", "UP"), 0).await;
        {
            let calls = monitor.reporter.calls.lock().unwrap();
            assert_eq!(calls.last().unwrap(), &("web1".to_string(), "INIT".to_string()));
        }

        monitor.process_stat(&stat("cattle-web1", "UP"), 1).await;
        let calls = monitor.reporter.calls.lock().unwrap();
        assert_eq!(calls.last().unwrap(), &("web1".to_string(), "UP".to_string()));
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn unchanged_status_is_not_re_reported() {
        let reporter = RecordingReporter { calls: Mutex::new(vec![]) };
        let mut monitor = Monitor::new(reporter);
        monitor.process_stat(&stat("cattle-web1", "DOWN"), 0).await;
        monitor.process_stat(&stat("cattle-web1", "DOWN"), 1).await;
        assert_eq!(monitor.reporter.calls.lock().unwrap().len(), 1);
    }
}
