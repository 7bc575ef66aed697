//! Data model shared by the container-engine contract and every handler.
//!
//! `ContainerEngine` (see `engine::mod`) is the opaque collaborator; these
//! types are what flows across that boundary. Field names track the
//! wire shapes in spec.md §3 rather than any concrete engine's native types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `{id, status, from, time}` — one container lifecycle notification.
///
/// `from == "watcher-simulated"` marks a synthetic event injected by
/// startup reconciliation or the state-directory watcher (spec.md §3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub id: String,
    pub status: ContainerStatus,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub time: i64,
}

/// Reserved `from` marker for events synthesized by reconciliation or the
/// state-directory watcher rather than observed on the engine's own stream.
pub const SIMULATED_FROM: &str = "watcher-simulated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Start,
    Stop,
    Die,
    Kill,
    Destroy,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Start => "start",
            ContainerStatus::Stop => "stop",
            ContainerStatus::Die => "die",
            ContainerStatus::Kill => "kill",
            ContainerStatus::Destroy => "destroy",
        }
    }
}

impl ContainerEvent {
    /// Build a synthetic `start` event as emitted by reconciliation or the
    /// state-directory watcher.
    pub fn synthetic_start(id: impl Into<String>, time: i64) -> Self {
        Self {
            id: id.into(),
            status: ContainerStatus::Start,
            from: SIMULATED_FROM.to_string(),
            time,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.from == SIMULATED_FROM
    }
}

/// Inspected container snapshot (spec.md §3 `ContainerRecord`).
///
/// Read-only within a single handler invocation — no mutable container
/// state is retained across events.
#[derive(Debug, Clone, Default)]
pub struct ContainerRecord {
    pub id: String,
    pub running: bool,
    pub pid: i32,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub resolv_conf_path: String,
    pub dns_search: Vec<String>,
}

/// Labels of interest, per spec.md §3.
pub mod labels {
    pub const CONTAINER_IP: &str = "container.ip";
    pub const CONTAINER_SYSTEM: &str = "container.system";
    pub const CONTAINER_DNS: &str = "container.dns";
    pub const VM: &str = "vm";
    pub const STACK_SERVICE_NAME: &str = "stack_service.name";
}

impl ContainerRecord {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn is_vm(&self) -> bool {
        self.label(labels::VM) == Some("true")
    }

    pub fn is_system(&self) -> bool {
        self.labels.contains_key(labels::CONTAINER_SYSTEM)
    }

    /// `true` when `container.dns` is the literal string `"false"`.
    pub fn dns_explicitly_disabled(&self) -> bool {
        self.label(labels::CONTAINER_DNS) == Some("false")
    }

    /// `true` when `container.dns` is the literal string `"true"`.
    pub fn dns_explicitly_enabled(&self) -> bool {
        self.label(labels::CONTAINER_DNS) == Some("true")
    }

    /// Env var `RANCHER_IP=<value>`, if present.
    pub fn rancher_ip_env(&self) -> Option<&str> {
        const PREFIX: &str = "RANCHER_IP=";
        self.env
            .iter()
            .find_map(|e| e.strip_prefix(PREFIX))
    }
}

/// `<stateDir>/<id>` JSON descriptor (spec.md §3 `StateFile`).
#[derive(Debug, Clone, Deserialize)]
pub struct StateFile {
    pub nics: Vec<Nic>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Nic {
    #[serde(rename = "ipAddresses", default)]
    pub ip_addresses: Vec<IpAddressEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpAddressEntry {
    pub address: String,
    #[serde(default)]
    pub role: String,
    pub subnet: Subnet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subnet {
    #[serde(rename = "cidrSize")]
    pub cidr_size: u32,
}

impl StateFile {
    /// The first `nics[0].ipAddresses` entry with `role == "primary"`,
    /// formatted as `address/cidrSize` (spec.md §4.8 step 3c).
    pub fn primary_ip(&self) -> Option<String> {
        let nic = self.nics.first()?;
        let addr = nic.ip_addresses.iter().find(|a| a.role == "primary")?;
        Some(format!("{}/{}", addr.address, addr.subnet.cidr_size))
    }
}

/// Exec config restricted to the fields the spec allows through (§4.3).
/// Unknown keys and non-conforming types are silently dropped by the
/// deserializer performing a best-effort field-by-field conversion, not
/// strict schema validation — mirrors `original_source/exec/exec.go`'s
/// `convert`.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub container: String,
    pub cmd: Vec<String>,
}

impl ExecConfig {
    /// Best-effort extraction from a loosely-typed JSON object, dropping
    /// unknown keys and type mismatches instead of failing.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut cfg = ExecConfig::default();
        let obj = match value.as_object() {
            Some(o) => o,
            None => return cfg,
        };
        if let Some(b) = obj.get("AttachStdin").and_then(|v| v.as_bool()) {
            cfg.attach_stdin = b;
        }
        if let Some(b) = obj.get("AttachStdout").and_then(|v| v.as_bool()) {
            cfg.attach_stdout = b;
        }
        if let Some(b) = obj.get("AttachStderr").and_then(|v| v.as_bool()) {
            cfg.attach_stderr = b;
        }
        if let Some(b) = obj.get("Tty").and_then(|v| v.as_bool()) {
            cfg.tty = b;
        }
        if let Some(s) = obj.get("Container").and_then(|v| v.as_str()) {
            cfg.container = s.to_string();
        }
        if let Some(arr) = obj.get("Cmd").and_then(|v| v.as_array()) {
            cfg.cmd = arr
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
        cfg
    }
}
