//! CLI entry point: resolves configuration, wires the stream multiplexer
//! and the container lifecycle reactor together, and runs until a signal
//! arrives. Logging/shutdown scaffolding is adapted from the teacher's
//! `main.rs` (`setup_logging`) and `ipc::mod::make_shutdown_future`
//! (`examples/clawde-io-apps/daemon/src/{main,ipc/mod}.rs`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use host_agent::auth::TokenVerifier;
use host_agent::config::{AgentConfig, CliOverrides};
use host_agent::engine::types::ContainerRecord;
use host_agent::engine::{ContainerEngine, ContainerEvent, ContainerStatus, ExecConfig, ExecSession, LogChunk, LogOptions, RawStatSample};
use host_agent::events::start_handler::StartHandler;
use host_agent::events::{reconcile, state_watcher, EventRouter};
use host_agent::handlers::{docker_socket, exec, http_proxy, logs, stats};
use host_agent::healthcheck;
use host_agent::proxy::{exchange_token, run_connection, RouteTable};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "host-agent", about = "Per-host container session multiplexer + lifecycle reactor", version)]
struct Args {
    #[arg(long, env = "HOST_API_PORT")]
    port: Option<u16>,
    #[arg(long, env = "HOST_API_IP")]
    ip: Option<String>,
    #[arg(long = "cadvisor-url", env = "HOST_API_CADVISOR_URL")]
    cadvisor_url: Option<String>,
    #[arg(long = "docker-host", env = "HOST_API_DOCKER_HOST")]
    docker_host: Option<String>,
    #[arg(long = "num-stats", env = "HOST_API_NUM_STATS")]
    num_stats: Option<u32>,
    #[arg(long, env = "HOST_API_AUTH")]
    auth: Option<bool>,
    #[arg(long = "host-uuid", env = "HOST_API_HOST_UUID")]
    host_uuid: Option<String>,
    #[arg(long = "host-uuid-check", env = "HOST_API_HOST_UUID_CHECK")]
    host_uuid_check: Option<bool>,
    #[arg(long = "public-key", env = "HOST_API_PUBLIC_KEY")]
    public_key: Option<PathBuf>,
    #[arg(long = "cattle-url", env = "HOST_API_CATTLE_URL")]
    cattle_url: Option<String>,
    #[arg(long = "cattle-access-key", env = "HOST_API_CATTLE_ACCESS_KEY")]
    cattle_access_key: Option<String>,
    #[arg(long = "cattle-secret-key", env = "HOST_API_CATTLE_SECRET_KEY")]
    cattle_secret_key: Option<String>,
    #[arg(long = "cattle-state-dir", env = "HOST_API_CATTLE_STATE_DIR")]
    cattle_state_dir: Option<PathBuf>,
    #[arg(long = "events-pool-size", env = "HOST_API_EVENTS_POOL_SIZE")]
    events_pool_size: Option<usize>,
    #[arg(long = "pid-file", env = "HOST_API_PID_FILE")]
    pid_file: Option<PathBuf>,
    #[arg(long = "log-file", env = "HOST_API_LOG_FILE")]
    log_file: Option<PathBuf>,
    #[arg(long, env = "HOST_API_LOG")]
    log: Option<String>,
    #[arg(long = "haproxy-monitor", env = "HOST_API_HAPROXY_MONITOR")]
    haproxy_monitor: Option<bool>,
}

impl From<Args> for CliOverrides {
    fn from(a: Args) -> Self {
        Self {
            port: a.port,
            ip: a.ip,
            cadvisor_url: a.cadvisor_url,
            docker_host: a.docker_host,
            num_stats: a.num_stats,
            auth: a.auth,
            host_uuid: a.host_uuid,
            host_uuid_check: a.host_uuid_check,
            public_key: a.public_key,
            cattle_url: a.cattle_url,
            cattle_access_key: a.cattle_access_key,
            cattle_secret_key: a.cattle_secret_key,
            cattle_state_dir: a.cattle_state_dir,
            events_pool_size: a.events_pool_size,
            pid_file: a.pid_file,
            log_file: a.log_file,
            log: a.log,
            haproxy_monitor: a.haproxy_monitor,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cli: CliOverrides = args.into();
    let config = AgentConfig::load(cli);

    let _log_guard = setup_logging(&config.log, config.log_file.as_deref());

    if let Some(pid_path) = &config.pid_file {
        if let Some(stale) = read_pid_file(pid_path) {
            if is_process_alive(stale) {
                anyhow::bail!("pid file {} names running process {stale} — refusing to start a second instance", pid_path.display());
            }
            warn!(path = %pid_path.display(), pid = stale, "removing stale pid file");
        }
        if let Err(e) = std::fs::write(pid_path, std::process::id().to_string()) {
            warn!(path = %pid_path.display(), err = %e, "failed to write pid file");
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), port = config.port, "host-agent starting");

    if config.haproxy_monitor {
        return run_haproxy_monitor(&config).await;
    }

    run_agent(config).await
}

/// Initialize the tracing subscriber. Mirrors the teacher's
/// stdout-plus-optional-rolling-file setup; falls back to stdout-only if
/// the log directory can't be created rather than panicking.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        return None;
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("host-agent.log"));

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    Some(guard)
}

fn read_pid_file(path: &std::path::Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// `kill(pid, 0)` liveness check — POSIX returns success if the process
/// exists and we have permission to signal it, without actually sending
/// anything. Adapted from the teacher's `process_pool::is_process_alive`
/// (`examples/clawde-io-apps/daemon/src/process_pool.rs`).
#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn run_haproxy_monitor(config: &AgentConfig) -> Result<()> {
    let cattle_url = config.cattle_url.clone().context("cattle-url is required in haproxy-monitor mode")?;
    let access_key = config.cattle_access_key.clone().unwrap_or_default();
    let secret_key = config.cattle_secret_key.clone().unwrap_or_default();

    let client = reqwest::Client::new();
    let reporter = healthcheck::CattleStatusReporter::new(client, cattle_url, access_key, secret_key);
    let mut monitor = healthcheck::Monitor::new(reporter);
    let source = healthcheck::UnixSocketStatsSource::new(healthcheck::default_socket_path());

    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    tokio::select! {
        result = healthcheck::run(source, &mut monitor) => result,
        _ = &mut shutdown => {
            info!("shutdown signal received — stopping haproxy monitor");
            Ok(())
        }
    }
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let engine: Arc<dyn ContainerEngine> = Arc::new(UnimplementedEngine);

    let verifier = Arc::new(load_verifier(&config)?);

    let mut routes = RouteTable::new();
    {
        let engine = engine.clone();
        let verifier = verifier.clone();
        routes.register("logs/", move || Arc::new(logs::LogsHandler::new(engine.clone(), verifier.clone())));
    }
    {
        let engine = engine.clone();
        let verifier = verifier.clone();
        let num_stats = config.num_stats;
        routes.register("hoststats/", move || Arc::new(stats::HostStatsHandler::new(engine.clone(), verifier.clone(), num_stats)));
    }
    for prefix in ["stats/", "containerstats/"] {
        let engine = engine.clone();
        let verifier = verifier.clone();
        routes.register(prefix, move || Arc::new(stats::ContainerStatsHandler::new(engine.clone(), verifier.clone())));
    }
    for prefix in ["exec/", "console/"] {
        let engine = engine.clone();
        let verifier = verifier.clone();
        routes.register(prefix, move || Arc::new(exec::ExecHandler::new(engine.clone(), verifier.clone())));
    }
    {
        let engine = engine.clone();
        let verifier = verifier.clone();
        routes.register("dockersocket/", move || Arc::new(docker_socket::DockerSocketHandler::new(engine.clone(), verifier.clone())));
    }
    {
        let verifier = verifier.clone();
        routes.register("container-proxy/", move || Arc::new(http_proxy::HttpTunnelHandler::new(verifier.clone())));
    }
    let routes = Arc::new(routes);

    let (events_tx, events_rx) = mpsc::channel::<ContainerEvent>(256);

    let mut router = EventRouter::new(engine.clone(), config.events_pool_size);
    let start_handler = StartHandler::new(engine.as_ref(), config.cattle_state_dir.clone())
        .await
        .context("failed to derive startup MTU from engine")?;
    router.register(ContainerStatus::Start, Arc::new(start_handler));
    let router = Arc::new(router);

    let router_task = tokio::spawn({
        let router = router.clone();
        async move { router.run(events_rx).await }
    });

    if let Err(e) = reconcile::reconcile(engine.as_ref(), &events_tx, chrono::Utc::now().timestamp()).await {
        warn!(err = %e, "startup reconciliation failed");
    }

    let watcher_task = tokio::spawn(state_watcher::run_with_restarts(
        config.cattle_state_dir.clone(),
        events_tx.clone(),
        state_watcher::WatcherConfig::default(),
    ));

    let engine_events_task = tokio::spawn(forward_engine_events(engine.clone(), events_tx.clone()));

    if let Some(cattle_url) = config.cattle_url.clone() {
        let client = reqwest::Client::new();
        let access_key = config.cattle_access_key.clone().unwrap_or_default();
        let secret_key = config.cattle_secret_key.clone().unwrap_or_default();

        let shutdown = make_shutdown_future();
        tokio::pin!(shutdown);

        let outcome = tokio::select! {
            result = run_once(&client, &cattle_url, &access_key, &secret_key, routes) => result,
            _ = &mut shutdown => {
                info!("shutdown signal received — stopping host-agent");
                Ok(())
            }
        };
        router_task.abort();
        watcher_task.abort();
        engine_events_task.abort();
        outcome
    } else {
        warn!("cattle-url not configured — nothing to connect to, idling until signalled");
        make_shutdown_future().await;
        router_task.abort();
        watcher_task.abort();
        engine_events_task.abort();
        Ok(())
    }
}

/// Bridges the engine's own lifecycle stream (start/stop/die/kill/destroy,
/// spec.md §4.7) into the same channel `reconcile` and the state-dir
/// watcher feed — without this, only synthetic startup/watcher events
/// ever reach the router, and containers started after boot never get IP
/// injection / DNS rewrite.
async fn forward_engine_events(engine: Arc<dyn ContainerEngine>, events_tx: mpsc::Sender<ContainerEvent>) {
    let mut native = match engine.subscribe_events().await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(err = %e, "engine event stream unavailable — only synthetic events will be processed");
            return;
        }
    };
    while let Some(event) = native.recv().await {
        if events_tx.send(event).await.is_err() {
            break;
        }
    }
    warn!("engine event stream closed");
}

async fn run_once(client: &reqwest::Client, cattle_url: &str, access_key: &str, secret_key: &str, routes: Arc<RouteTable>) -> Result<()> {
    match exchange_token(client, cattle_url, access_key, secret_key).await {
        Ok((ws_url, token)) => run_connection(&ws_url, &token, routes).await,
        Err(e) => {
            if matches!(e, host_agent::proxy::TokenExchangeError::Disabled) {
                // By design: block forever rather than exit.
                std::future::pending::<()>().await;
                Ok(())
            } else {
                Err(anyhow::anyhow!("token exchange failed: {e}"))
            }
        }
    }
}

fn load_verifier(config: &AgentConfig) -> Result<TokenVerifier> {
    if !config.auth {
        warn!("auth disabled — every session will be admitted without token verification");
        return Ok(TokenVerifier::disabled());
    }
    let key_path = config.public_key.clone().context("public-key path is required when auth is enabled")?;
    let pem = std::fs::read(&key_path).with_context(|| format!("failed to read public key at {}", key_path.display()))?;
    TokenVerifier::from_pem(&pem, config.host_uuid_check, config.host_uuid.clone())
}

/// Placeholder for the concrete container-engine backend (spec.md §1 names
/// "the concrete container-engine API" an external collaborator consumed
/// only as a contract). A real deployment swaps this for a client talking
/// to the engine's control socket; every method here either no-ops safely
/// or fails loudly rather than silently fabricating data.
struct UnimplementedEngine;

#[async_trait]
impl ContainerEngine for UnimplementedEngine {
    async fn inspect_container(&self, id: &str) -> anyhow::Result<ContainerRecord> {
        anyhow::bail!("no container-engine backend wired into this build (id={id})")
    }
    async fn list_running_or_paused(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn subscribe_events(&self) -> anyhow::Result<mpsc::Receiver<ContainerEvent>> {
        anyhow::bail!("no container-engine backend wired into this build")
    }
    async fn stream_logs(&self, _container: &str, _opts: LogOptions) -> anyhow::Result<mpsc::Receiver<LogChunk>> {
        anyhow::bail!("no container-engine backend wired into this build")
    }
    async fn create_exec(&self, _cfg: &ExecConfig) -> anyhow::Result<Box<dyn ExecSession>> {
        anyhow::bail!("no container-engine backend wired into this build")
    }
    fn control_socket_path(&self) -> PathBuf {
        PathBuf::from("/var/run/docker.sock")
    }
    async fn stream_container_stats(&self, _container: &str) -> anyhow::Result<mpsc::Receiver<RawStatSample>> {
        anyhow::bail!("no container-engine backend wired into this build")
    }
    async fn host_stats(&self) -> anyhow::Result<RawStatSample> {
        anyhow::bail!("no container-engine backend wired into this build")
    }
    async fn host_mem_total(&self) -> anyhow::Result<u64> {
        Ok(0)
    }
    async fn configure_ip(&self, _pid: i32, _ip: &str, _mtu: u32) -> anyhow::Result<()> {
        anyhow::bail!("no container-engine backend wired into this build")
    }
    async fn gateway_mtu(&self) -> anyhow::Result<u32> {
        Ok(1500)
    }
    async fn bridge_mtu(&self) -> anyhow::Result<u32> {
        Ok(1500)
    }
}
