//! Layered configuration (SPEC_FULL.md §11).
//!
//! Priority, highest first: CLI flags → `HOST_API_`-prefixed environment
//! variables → a TOML file pointed to by `HOST_API_CONFIG_FILE` → built-in
//! defaults. Adapted from the teacher's `config::DaemonConfig::new`
//! (`examples/clawde-io-apps/daemon/src/config/mod.rs`), which layers
//! CLI/env over a `{data_dir}/config.toml` over defaults the same way.

use serde::Deserialize;
use std::path::PathBuf;
use tracing::error;

const DEFAULT_PORT: u16 = 9345;
const DEFAULT_NUM_STATS: u32 = 20;
const DEFAULT_EVENTS_POOL_SIZE: usize = 5;
const DEFAULT_CADVISOR_URL: &str = "http://169.254.169.250:9344";
const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
const DEFAULT_CATTLE_STATE_DIR: &str = "/var/lib/rancher/state";

#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    ip: Option<String>,
    cadvisor_url: Option<String>,
    docker_host: Option<String>,
    num_stats: Option<u32>,
    auth: Option<bool>,
    host_uuid: Option<String>,
    host_uuid_check: Option<bool>,
    public_key: Option<PathBuf>,
    cattle_url: Option<String>,
    cattle_access_key: Option<String>,
    cattle_secret_key: Option<String>,
    cattle_state_dir: Option<PathBuf>,
    events_pool_size: Option<usize>,
    pid_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    log: Option<String>,
    haproxy_monitor: Option<bool>,
}

fn load_toml() -> TomlConfig {
    let path = match std::env::var("HOST_API_CONFIG_FILE") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => return TomlConfig::default(),
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
                TomlConfig::default()
            }
        },
        Err(e) => {
            error!(path = %path.display(), err = %e, "could not read HOST_API_CONFIG_FILE — using defaults");
            TomlConfig::default()
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).and_then(|s| s.parse().ok())
}

fn env_num<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.parse().ok())
}

/// CLI-supplied overrides, passed through from clap in `main.rs`. Every
/// field is `Option` so an unset flag falls through to env/TOML/default.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub ip: Option<String>,
    pub cadvisor_url: Option<String>,
    pub docker_host: Option<String>,
    pub num_stats: Option<u32>,
    pub auth: Option<bool>,
    pub host_uuid: Option<String>,
    pub host_uuid_check: Option<bool>,
    pub public_key: Option<PathBuf>,
    pub cattle_url: Option<String>,
    pub cattle_access_key: Option<String>,
    pub cattle_secret_key: Option<String>,
    pub cattle_state_dir: Option<PathBuf>,
    pub events_pool_size: Option<usize>,
    pub pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log: Option<String>,
    pub haproxy_monitor: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub port: u16,
    pub ip: String,
    pub cadvisor_url: String,
    pub docker_host: String,
    pub num_stats: u32,
    pub auth: bool,
    pub host_uuid: String,
    pub host_uuid_check: bool,
    pub public_key: Option<PathBuf>,
    pub cattle_url: Option<String>,
    pub cattle_access_key: Option<String>,
    pub cattle_secret_key: Option<String>,
    pub cattle_state_dir: PathBuf,
    pub events_pool_size: usize,
    pub pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log: String,
    pub haproxy_monitor: bool,
}

impl AgentConfig {
    /// Resolve config from CLI overrides, `HOST_API_*` env vars, the TOML
    /// file named by `HOST_API_CONFIG_FILE`, and defaults, in that priority.
    pub fn load(cli: CliOverrides) -> Self {
        let toml = load_toml();

        Self {
            port: cli
                .port
                .or_else(|| env_num("HOST_API_PORT"))
                .or(toml.port)
                .unwrap_or(DEFAULT_PORT),
            ip: cli
                .ip
                .or_else(|| env_string("HOST_API_IP"))
                .or(toml.ip)
                .unwrap_or_default(),
            cadvisor_url: cli
                .cadvisor_url
                .or_else(|| env_string("HOST_API_CADVISOR_URL"))
                .or(toml.cadvisor_url)
                .unwrap_or_else(|| DEFAULT_CADVISOR_URL.to_string()),
            docker_host: cli
                .docker_host
                .or_else(|| env_string("HOST_API_DOCKER_HOST"))
                .or(toml.docker_host)
                .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string()),
            num_stats: cli
                .num_stats
                .or_else(|| env_num("HOST_API_NUM_STATS"))
                .or(toml.num_stats)
                .unwrap_or(DEFAULT_NUM_STATS),
            auth: cli
                .auth
                .or_else(|| env_bool("HOST_API_AUTH"))
                .or(toml.auth)
                .unwrap_or(true),
            host_uuid: cli
                .host_uuid
                .or_else(|| env_string("HOST_API_HOST_UUID"))
                .or(toml.host_uuid)
                .unwrap_or_default(),
            host_uuid_check: cli
                .host_uuid_check
                .or_else(|| env_bool("HOST_API_HOST_UUID_CHECK"))
                .or(toml.host_uuid_check)
                .unwrap_or(true),
            public_key: cli
                .public_key
                .or_else(|| env_string("HOST_API_PUBLIC_KEY").map(PathBuf::from))
                .or(toml.public_key),
            cattle_url: cli
                .cattle_url
                .or_else(|| env_string("HOST_API_CATTLE_URL"))
                .or(toml.cattle_url),
            cattle_access_key: cli
                .cattle_access_key
                .or_else(|| env_string("HOST_API_CATTLE_ACCESS_KEY"))
                .or(toml.cattle_access_key),
            cattle_secret_key: cli
                .cattle_secret_key
                .or_else(|| env_string("HOST_API_CATTLE_SECRET_KEY"))
                .or(toml.cattle_secret_key),
            cattle_state_dir: cli
                .cattle_state_dir
                .or_else(|| env_string("HOST_API_CATTLE_STATE_DIR").map(PathBuf::from))
                .or(toml.cattle_state_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATTLE_STATE_DIR)),
            events_pool_size: cli
                .events_pool_size
                .or_else(|| env_num("HOST_API_EVENTS_POOL_SIZE"))
                .or(toml.events_pool_size)
                .unwrap_or(DEFAULT_EVENTS_POOL_SIZE),
            pid_file: cli
                .pid_file
                .or_else(|| env_string("HOST_API_PID_FILE").map(PathBuf::from))
                .or(toml.pid_file),
            log_file: cli
                .log_file
                .or_else(|| env_string("HOST_API_LOG_FILE").map(PathBuf::from))
                .or(toml.log_file),
            log: cli
                .log
                .or_else(|| env_string("HOST_API_LOG"))
                .or(toml.log)
                .unwrap_or_else(|| "info".to_string()),
            haproxy_monitor: cli
                .haproxy_monitor
                .or_else(|| env_bool("HOST_API_HAPROXY_MONITOR"))
                .or(toml.haproxy_monitor)
                .unwrap_or(false),
        }
    }
}
