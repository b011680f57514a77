//! Node entry point.
//!
//! Configuration comes from `OREN_*` environment variables with CLI
//! flags layered on top; see [`oren_node::config`] for the full list.
//! With no configuration at all the node runs against the in-process
//! machine emulator, which is enough to exercise the whole service tree.
//!
//! ## Bring-up
//!
//! 1. Parse flags, read the environment, validate.
//! 2. Initialize tracing at the configured level.
//! 3. Remote mode: optionally spawn and supervise the machine manager,
//!    then load the snapshot through it.
//! 4. Start the node supervisor: telemetry, inspect API, advance loop,
//!    claimer, in that order.
//! 5. Run until SIGINT or SIGTERM, then drain everything and tear the
//!    machine down while the manager is still alive.
//!
//! Exit code 1 on a fatal initialization or service failure, 0 on a
//! clean shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use oren_machine::emulated::EmulatedHost;
use oren_machine::{CartesiMachine, MachineBinding, MachineRunner, RollupMachine, RuntimeConfig};
use oren_node::{
    inspect_router, Advancer, Claimer, InMemoryRepository, MockTransactionSender, NodeConfig,
};
use oren_services::{
    telemetry_router, CommandService, CommandSpec, HealthProbes, HttpService, Service,
    ServiceError, ServiceResult, Supervisor,
};

// ════════════════════════════════════════════════════════════════════════════
// CLI
// ════════════════════════════════════════════════════════════════════════════

/// Optimistic rollup execution node.
#[derive(Parser, Debug)]
#[command(name = "oren-node", version, about = "Optimistic rollup execution node")]
struct Cli {
    /// Machine manager endpoint (`host:port`), or `mock` for the built-in emulator.
    #[arg(long)]
    machine_endpoint: Option<String>,

    /// Snapshot directory to load (remote mode).
    #[arg(long)]
    snapshot_path: Option<PathBuf>,

    /// Application whose inbox this node executes.
    #[arg(long)]
    app: Option<String>,

    /// Log level: debug, info, warn or error.
    #[arg(long)]
    log_level: Option<String>,

    /// Poll interval for the advance and claim loops, in milliseconds.
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Blocks per claim epoch.
    #[arg(long)]
    epoch_length: Option<u64>,

    /// Inspect API listen address.
    #[arg(long)]
    inspect_address: Option<SocketAddr>,

    /// Telemetry (probe) listen address.
    #[arg(long)]
    telemetry_address: Option<SocketAddr>,
}

impl Cli {
    /// Lays the flags over the environment-derived configuration.
    fn apply(self, config: &mut NodeConfig) {
        if let Some(machine_endpoint) = self.machine_endpoint {
            config.machine_endpoint = machine_endpoint;
        }
        if let Some(snapshot_path) = self.snapshot_path {
            config.snapshot_path = Some(snapshot_path);
        }
        if let Some(app) = self.app {
            config.app = app;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(poll_interval_ms);
        }
        if let Some(epoch_length) = self.epoch_length {
            config.epoch_length = epoch_length;
        }
        if let Some(inspect_address) = self.inspect_address {
            config.inspect_address = inspect_address;
        }
        if let Some(telemetry_address) = self.telemetry_address {
            config.telemetry_address = telemetry_address;
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ENTRY POINT
// ════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            std::process::exit(1);
        }
    };
    cli.apply(&mut config);
    if let Err(error) = config.validate() {
        eprintln!("configuration error: {error}");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .with_target(false)
        .init();

    info!("═══════════════════════════════════════════════════════════════");
    info!("                          oren node");
    info!("═══════════════════════════════════════════════════════════════");
    info!("node id:     {}", config.node_id);
    info!("application: {}", config.app);
    info!("machine:     {}", config.machine_endpoint);
    info!("inspect:     {}", config.inspect_address);
    info!("telemetry:   {}", config.telemetry_address);
    info!("═══════════════════════════════════════════════════════════════");

    match run(config).await {
        Ok(()) => {
            info!("node stopped cleanly");
        }
        Err(error) => {
            error!("node failed: {error}");
            std::process::exit(1);
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// BRING-UP
// ════════════════════════════════════════════════════════════════════════════

async fn run(config: NodeConfig) -> ServiceResult<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    {
        let cancel_tx = cancel_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown requested");
            let _ = cancel_tx.send(true);
        });
    }

    if config.is_mock() {
        info!("running against the in-process machine emulator");
        let host = Arc::new(EmulatedHost::new());
        let rollup = RollupMachine::new(host.load(Vec::new()), config.cycle_budget())
            .await
            .map_err(|error| {
                ServiceError::Other(anyhow::anyhow!("loading the emulated machine: {error}"))
            })?;
        let runner = Arc::new(MachineRunner::new(rollup, config.inspect_concurrency));
        let result = run_services(&config, Arc::clone(&runner), cancel_rx).await;
        teardown_runner(&runner).await;
        return result;
    }

    // Remote mode. If the node owns the manager binary it must be up and
    // probed ready before the snapshot can be loaded through it.
    let manager = match &config.machine_manager_bin {
        Some(bin) => Some(start_manager(&config, bin.clone()).await?),
        None => None,
    };

    let Some(snapshot_path) = config.snapshot_path.clone() else {
        return Err(ServiceError::Other(anyhow::anyhow!(
            "remote mode requires a snapshot path"
        )));
    };
    let rollup = RollupMachine::<CartesiMachine>::load(
        &config.machine_endpoint,
        &snapshot_path.to_string_lossy(),
        &RuntimeConfig::default(),
        config.cycle_budget(),
    )
    .await
    .map_err(|error| ServiceError::Other(anyhow::anyhow!("loading the machine: {error}")))?;
    let runner = Arc::new(MachineRunner::new(rollup, config.inspect_concurrency));

    match manager {
        None => {
            let result = run_services(&config, Arc::clone(&runner), cancel_rx).await;
            teardown_runner(&runner).await;
            result
        }
        Some(manager) => {
            let ManagerTask {
                cancel: manager_cancel,
                handle: mut manager_handle,
            } = manager;
            let services = run_services(&config, Arc::clone(&runner), cancel_rx.clone());
            tokio::pin!(services);

            let mut manager_failure: Option<ServiceError> = None;
            let mut manager_running = true;
            let services_result = tokio::select! {
                result = &mut services => result,
                joined = &mut manager_handle => {
                    manager_running = false;
                    error!("machine manager stopped; shutting the node down");
                    if let Err(error) = flatten_join(joined) {
                        manager_failure = Some(error);
                    }
                    let _ = cancel_tx.send(true);
                    services.await
                }
            };

            // The teardown RPCs need the manager alive, so it stops last.
            teardown_runner(&runner).await;
            let _ = manager_cancel.send(true);
            if manager_running {
                if let Err(error) = flatten_join(manager_handle.await) {
                    manager_failure.get_or_insert(error);
                }
            }

            match manager_failure {
                Some(error) => Err(error),
                None => services_result,
            }
        }
    }
}

/// Assembles and runs the node's own service tree until cancellation.
async fn run_services<B: MachineBinding>(
    config: &NodeConfig,
    runner: Arc<MachineRunner<B>>,
    node_ctx: watch::Receiver<bool>,
) -> ServiceResult<()> {
    let repository = Arc::new(InMemoryRepository::new());
    let probes = HealthProbes::new();

    let telemetry = HttpService::new(
        "telemetry",
        config.telemetry_address,
        telemetry_router("node", probes.clone()),
    );
    let inspect = HttpService::new(
        "inspect",
        config.inspect_address,
        inspect_router(Arc::clone(&runner)),
    );
    let advancer = Advancer::new(
        config.app.clone(),
        Arc::clone(&runner),
        Arc::clone(&repository),
        config.poll_interval,
        config.epoch_length,
        probes,
    );
    let claimer = Claimer::new(
        config.app.clone(),
        repository,
        Arc::new(MockTransactionSender::new()),
        config.poll_interval,
    );

    let mut supervisor = Supervisor::new("node")
        .add(telemetry)
        .add(inspect)
        .add(advancer)
        .add(claimer);
    let (ready_tx, _ready_rx) = oneshot::channel();
    supervisor.start(node_ctx, ready_tx).await
}

// ════════════════════════════════════════════════════════════════════════════
// MACHINE MANAGER
// ════════════════════════════════════════════════════════════════════════════

struct ManagerTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<ServiceResult<()>>,
}

/// Spawns the manager under its own supervisor and waits for readiness.
async fn start_manager(config: &NodeConfig, bin: PathBuf) -> ServiceResult<ManagerTask> {
    let mut spec = CommandSpec::new("machine-manager", bin)
        .healthcheck_port(config.manager_healthcheck_port)
        .bypass_log(config.manager_bypass_log);
    for arg in &config.machine_manager_args {
        spec = spec.arg(arg.clone());
    }

    let mut supervisor = Supervisor::new("machine-manager").add(CommandService::new(spec));
    let (cancel, ctx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel();
    let handle = tokio::spawn(async move { supervisor.start(ctx, ready_tx).await });

    if ready_rx.await.is_err() {
        return match flatten_join(handle.await) {
            Err(error) => Err(error),
            Ok(()) => Err(ServiceError::Other(anyhow::anyhow!(
                "machine manager stopped before becoming ready"
            ))),
        };
    }
    info!("machine manager ready");
    Ok(ManagerTask { cancel, handle })
}

// ════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════

async fn teardown_runner<B: MachineBinding>(runner: &MachineRunner<B>) {
    if let Err(error) = runner.shutdown().await {
        warn!(%error, "machine teardown failed");
    }
}

fn flatten_join(joined: Result<ServiceResult<()>, tokio::task::JoinError>) -> ServiceResult<()> {
    match joined {
        Ok(result) => result,
        Err(join_error) => Err(ServiceError::Other(anyhow::anyhow!(
            "manager task failed: {join_error}"
        ))),
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                warn!(%error, "cannot listen for SIGTERM, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> NodeConfig {
        NodeConfig {
            node_id: "test".to_string(),
            app: "dapp".to_string(),
            machine_endpoint: "mock".to_string(),
            snapshot_path: None,
            machine_manager_bin: None,
            machine_manager_args: Vec::new(),
            manager_healthcheck_port: 0,
            manager_bypass_log: false,
            poll_interval: Duration::from_millis(1000),
            epoch_length: 7200,
            cycle_increment: 10_000_000,
            max_cycles: 1_000_000_000,
            inspect_concurrency: 8,
            inspect_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            telemetry_address: SocketAddr::from(([0, 0, 0, 0], 8081)),
            log_level: "info".to_string(),
            auth: None,
        }
    }

    #[test]
    fn no_flags_parse_cleanly() {
        let cli = Cli::try_parse_from(["oren-node"]).unwrap();
        assert!(cli.machine_endpoint.is_none());
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn flags_override_the_environment() {
        let cli = Cli::try_parse_from([
            "oren-node",
            "--machine-endpoint",
            "127.0.0.1:5000",
            "--snapshot-path",
            "/srv/snapshot",
            "--poll-interval-ms",
            "250",
            "--log-level",
            "debug",
        ])
        .unwrap();

        let mut config = base_config();
        cli.apply(&mut config);
        assert_eq!(config.machine_endpoint, "127.0.0.1:5000");
        assert_eq!(config.snapshot_path.as_deref(), Some(std::path::Path::new("/srv/snapshot")));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn bad_address_flag_is_rejected() {
        let parse = Cli::try_parse_from(["oren-node", "--inspect-address", "not-an-address"]);
        assert!(parse.is_err());
    }
}
