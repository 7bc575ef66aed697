//! The container-engine contract.
//!
//! spec.md §1 lists "the concrete container-engine API" as an external
//! collaborator consumed only as a contract. `ContainerEngine` is that
//! contract: every handler and the event reactor depend on this trait,
//! never on a concrete client. A real binary wires up a production
//! implementation (talking to the engine's control socket); tests use
//! an in-memory fake defined locally in each module's `#[cfg(test)]`
//! block (see `events::mod::tests::FakeEngine`).
//!
//! Grounded on the teacher's `Runner` trait
//! (`examples/clawde-io-apps/daemon/src/session/runner.rs`): a small
//! `#[async_trait]` capability set, one impl per backend, held behind
//! `Arc<dyn Trait>`.

pub mod types;

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;

pub use types::{ContainerEvent, ContainerRecord, ContainerStatus, ExecConfig};

/// Log line tag, per spec.md §4.2: TTY-attached containers interleave
/// stdout/stderr as a single combined stream; otherwise each chunk is
/// labelled with its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    Combined,
}

impl LogStream {
    /// Two-digit prefix used by the log-framing sentinel protocol (§4.2).
    pub fn prefix(self) -> &'static str {
        match self {
            LogStream::Stdout => "01",
            LogStream::Stderr => "02",
            LogStream::Combined => "00",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogChunk {
    pub stream: LogStream,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub follow: bool,
    pub lines: i64,
    pub timestamps: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: true,
            lines: 100,
            timestamps: true,
        }
    }
}

/// One raw sample as delivered by the engine's native stats feed —
/// pre-translation into the `AggregatedStat` wire shape (spec.md §3,
/// §4.6). Field set matches `original_source/stats/common.go`'s
/// `containerStats` (cpu/diskio/memory/network), trimmed to what the
/// aggregation step actually forwards.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RawStatSample {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cpu: serde_json::Value,
    pub diskio: serde_json::Value,
    pub memory: serde_json::Value,
    pub network: serde_json::Value,
    pub filesystem: serde_json::Value,
}

/// A live exec instance: one stdin sink, one stdout/stderr source.
#[async_trait]
pub trait ExecSession: Send + Sync {
    async fn write_stdin(&self, data: &[u8]) -> anyhow::Result<()>;
    /// Signal end-of-input (EOT, `0x04`) then close stdin.
    async fn close_stdin(&self) -> anyhow::Result<()>;
    /// Take ownership of the stdout/stderr receiver. Called once.
    fn take_stdout(&mut self) -> mpsc::Receiver<Vec<u8>>;
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Inspect a container by id; read-only snapshot (spec.md §3).
    async fn inspect_container(&self, id: &str) -> anyhow::Result<ContainerRecord>;

    /// All containers currently `paused` or `running` (startup
    /// reconciliation, spec.md §4.7).
    async fn list_running_or_paused(&self) -> anyhow::Result<Vec<String>>;

    /// Subscribe to the engine's native lifecycle event stream.
    async fn subscribe_events(&self) -> anyhow::Result<mpsc::Receiver<ContainerEvent>>;

    /// Open a streaming log read (§4.2).
    async fn stream_logs(
        &self,
        container: &str,
        opts: LogOptions,
    ) -> anyhow::Result<mpsc::Receiver<LogChunk>>;

    /// Create and start an exec instance (§4.3).
    async fn create_exec(&self, cfg: &ExecConfig) -> anyhow::Result<Box<dyn ExecSession>>;

    /// Filesystem path to the engine's UNIX control socket (§4.4). The
    /// handler dials this directly; the engine need not mediate.
    fn control_socket_path(&self) -> PathBuf;

    /// Open a streaming per-container stats feed (§4.6); one sample
    /// decoded per tick.
    async fn stream_container_stats(
        &self,
        container: &str,
    ) -> anyhow::Result<mpsc::Receiver<RawStatSample>>;

    /// Host-wide resource sample (§4.6): aggregate + per-core CPU,
    /// virtual memory used, aggregate disk byte counters, primary NIC
    /// byte counters, plus the machine's total memory (used as
    /// `memLimit` on every container sample too — original
    /// `stats/host_stats.go`).
    async fn host_stats(&self) -> anyhow::Result<RawStatSample>;

    async fn host_mem_total(&self) -> anyhow::Result<u64>;

    /// Invoke the in-kernel IP-assignment helper as an opaque subprocess
    /// (§4.8 step 6): `net-util.sh -p <pid> -i <ip> -m <mtu>`.
    async fn configure_ip(&self, pid: i32, ip: &str, mtu: u32) -> anyhow::Result<()>;

    /// MTU of the interface carrying the default route, and of the
    /// engine's own bridge — used to derive the reduced MTU for user
    /// containers (§4.8 step 6).
    async fn gateway_mtu(&self) -> anyhow::Result<u32>;
    async fn bridge_mtu(&self) -> anyhow::Result<u32>;
}
