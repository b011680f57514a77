//! Child processes as supervised services.
//!
//! A [`CommandService`] spawns one external binary (the remote machine
//! manager, in practice) and folds it into the service life cycle:
//!
//! - readiness is a successful TCP dial against the child's healthcheck
//!   port, retried on a fixed interval until the child answers;
//! - stdout and stderr are pumped through the line writer into the log,
//!   unless the spec asks for a passthrough;
//! - shutdown kills the child's descendants outright, asks the child
//!   itself to stop, and escalates after a short drain.
//!
//! ## Dynamic ports
//!
//! With `healthcheck_port` set to zero the service does not know where
//! to probe until the child announces its port on stderr. The stderr
//! scanner publishes the announced port through [`CommandService::bound_port`]
//! and the probe starts dialing only then. A zero port therefore requires
//! piped logs; with `bypass_log` there is nothing to scan and readiness
//! never fires.
//!
//! ## Shutdown order
//!
//! The machine manager forks one worker per machine, and those workers
//! survive a signal aimed only at the parent. Teardown therefore walks
//! the direct descendants first and SIGKILLs them before the parent gets
//! its SIGTERM.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::linewriter::{BoundPortScanner, LineSink, LineWriter, TracingSink};
use crate::supervisor::{cancelled, Service, ServiceError, ServiceResult};

// ════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// Delay between readiness dials while the child is still coming up.
pub const READY_PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// How long a child gets between SIGTERM and SIGKILL.
pub const TERMINATION_DRAIN: Duration = Duration::from_millis(200);

// ════════════════════════════════════════════════════════════════════════════
// COMMAND SERVICE
// ════════════════════════════════════════════════════════════════════════════

/// Description of a child process to run and watch.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Service name for logs and errors.
    pub name: String,
    /// Binary to execute.
    pub path: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// TCP port dialed for readiness. Zero means the port is dynamic and
    /// is learned from the child's stderr announcement.
    pub healthcheck_port: u16,
    /// Inherit the parent's stdio instead of piping through the log.
    pub bypass_log: bool,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args: Vec::new(),
            env: Vec::new(),
            healthcheck_port: 0,
            bypass_log: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn healthcheck_port(mut self, port: u16) -> Self {
        self.healthcheck_port = port;
        self
    }

    pub fn bypass_log(mut self, bypass: bool) -> Self {
        self.bypass_log = bypass;
        self
    }
}

/// Runs one child process under the service life cycle.
pub struct CommandService {
    spec: CommandSpec,
    port_tx: Option<watch::Sender<Option<u16>>>,
    port_rx: watch::Receiver<Option<u16>>,
}

impl CommandService {
    pub fn new(spec: CommandSpec) -> Self {
        let (port_tx, port_rx) = watch::channel(None);
        Self {
            spec,
            port_tx: Some(port_tx),
            port_rx,
        }
    }

    /// Port the child announced on stderr; stays `None` until the
    /// announcement is seen.
    pub fn bound_port(&self) -> watch::Receiver<Option<u16>> {
        self.port_rx.clone()
    }

    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            kill_descendants(pid).await;
            unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        }
        match timeout(TERMINATION_DRAIN, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(service = %self.spec.name, %status, "child stopped");
            }
            Ok(Err(error)) => {
                warn!(service = %self.spec.name, %error, "reaping the child failed");
            }
            Err(_) => {
                warn!(service = %self.spec.name, "child ignored the stop request, killing it");
                if let Err(error) = child.kill().await {
                    warn!(service = %self.spec.name, %error, "killing the child failed");
                }
            }
        }
    }
}

#[async_trait]
impl Service for CommandService {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn start(
        &mut self,
        mut ctx: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> ServiceResult<()> {
        let mut command = Command::new(&self.spec.path);
        command
            .args(&self.spec.args)
            .envs(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.spec.bypass_log {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|source| ServiceError::Spawn {
            service: self.spec.name.clone(),
            source,
        })?;
        info!(service = %self.spec.name, pid = child.id(), "spawned child process");

        let port_tx = self.port_tx.take();
        if !self.spec.bypass_log {
            if let Some(stdout) = child.stdout.take() {
                let sink = TracingSink::new(&self.spec.name, "stdout");
                tokio::spawn(pump(stdout, LineWriter::new(sink)));
            }
            if let Some(stderr) = child.stderr.take() {
                let sink = TracingSink::new(&self.spec.name, "stderr");
                match port_tx {
                    Some(port_tx) => {
                        let scanner = BoundPortScanner::new(sink, move |port| {
                            let _ = port_tx.send(Some(port));
                        });
                        tokio::spawn(pump(stderr, LineWriter::new(scanner)));
                    }
                    None => {
                        tokio::spawn(pump(stderr, LineWriter::new(sink)));
                    }
                }
            }
        }

        let probe = probe_until_ready(self.spec.healthcheck_port, self.port_rx.clone());
        tokio::pin!(probe);

        // Startup: the child must answer the probe before it exits.
        tokio::select! {
            port = &mut probe => {
                info!(service = %self.spec.name, port, "child accepted the readiness probe");
                let _ = ready.send(());
            }
            status = child.wait() => {
                return Err(exit_error(&self.spec.name, status));
            }
            _ = cancelled(&mut ctx) => {
                self.terminate(&mut child).await;
                return Ok(());
            }
        }

        // Steady state: only an exit or a shutdown request gets us out.
        tokio::select! {
            status = child.wait() => Err(exit_error(&self.spec.name, status)),
            _ = cancelled(&mut ctx) => {
                self.terminate(&mut child).await;
                Ok(())
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════

/// Resolves the healthcheck port, then dials it until the child answers.
async fn probe_until_ready(configured: u16, announced: watch::Receiver<Option<u16>>) -> u16 {
    let port = wait_port(configured, announced).await;
    let address = format!("0.0.0.0:{port}");
    loop {
        match TcpStream::connect(&address).await {
            Ok(_) => return port,
            Err(_) => sleep(READY_PROBE_INTERVAL).await,
        }
    }
}

async fn wait_port(configured: u16, mut announced: watch::Receiver<Option<u16>>) -> u16 {
    if configured != 0 {
        return configured;
    }
    loop {
        if let Some(port) = *announced.borrow() {
            return port;
        }
        if announced.changed().await.is_err() {
            // No announcement is coming; park until the service is cancelled.
            std::future::pending::<()>().await;
        }
    }
}

fn exit_error(service: &str, status: std::io::Result<std::process::ExitStatus>) -> ServiceError {
    match status {
        Ok(status) => ServiceError::Exited {
            service: service.to_string(),
            status: status.to_string(),
        },
        Err(source) => ServiceError::Other(anyhow::anyhow!(
            "waiting on child `{service}`: {source}"
        )),
    }
}

/// Drains a child stream into the line writer until EOF.
async fn pump<R, S>(mut reader: R, mut writer: LineWriter<S>)
where
    R: AsyncRead + Unpin + Send + 'static,
    S: LineSink + 'static,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => writer.write(&chunk[..n]),
        }
    }
    writer.finish();
}

/// SIGKILLs every direct descendant of `pid`. The machine manager's
/// workers hold the forked machines and do not react to the parent
/// going away.
#[cfg(unix)]
async fn kill_descendants(pid: u32) {
    let listed = Command::new("pgrep")
        .arg("-P")
        .arg(pid.to_string())
        .output()
        .await;
    let Ok(output) = listed else { return };
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Ok(descendant) = line.trim().parse::<i32>() {
            debug!(descendant, "force-killing child process descendant");
            unsafe { libc::kill(descendant, libc::SIGKILL) };
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    async fn launch(
        spec: CommandSpec,
    ) -> (
        watch::Sender<bool>,
        oneshot::Receiver<()>,
        JoinHandle<ServiceResult<()>>,
        watch::Receiver<Option<u16>>,
    ) {
        let mut service = CommandService::new(spec);
        let announced = service.bound_port();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(async move { service.start(cancel_rx, ready_tx).await });
        (cancel_tx, ready_rx, handle, announced)
    }

    // ────────────────────────────────────────────────────────────────────────
    // A. Readiness
    // ────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ready_fires_once_the_port_answers() {
        // The probe only cares that the port accepts; a listener owned by
        // the test stands in for the child's own server.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let spec = CommandSpec::new("sleeper", "sh")
            .arg("-c")
            .arg("sleep 5")
            .healthcheck_port(port);
        let (cancel_tx, ready_rx, handle, _) = launch(spec).await;

        ready_rx.await.unwrap();
        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn announced_port_feeds_the_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Port zero: the service must learn the port from stderr.
        let spec = CommandSpec::new("announcer", "sh")
            .arg("-c")
            .arg("echo \"machine manager bound to port $ANNOUNCE\" 1>&2; sleep 5")
            .env("ANNOUNCE", port.to_string());
        let (cancel_tx, ready_rx, handle, mut announced) = launch(spec).await;

        ready_rx.await.unwrap();
        let seen = announced.wait_for(|p| p.is_some()).await.unwrap();
        assert_eq!(*seen, Some(port));

        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    // ────────────────────────────────────────────────────────────────────────
    // B. Exit handling
    // ────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn early_exit_is_an_error() {
        let spec = CommandSpec::new("quitter", "sh")
            .arg("-c")
            .arg("exit 3")
            .healthcheck_port(1);
        let (_cancel_tx, _ready_rx, handle, _) = launch(spec).await;

        let error = handle.await.unwrap().unwrap_err();
        assert!(matches!(error, ServiceError::Exited { ref service, .. } if service == "quitter"));
        assert!(error.to_string().contains('3'));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let spec = CommandSpec::new("ghost", "/nonexistent/binary");
        let (_cancel_tx, _ready_rx, handle, _) = launch(spec).await;

        let error = handle.await.unwrap().unwrap_err();
        assert!(matches!(error, ServiceError::Spawn { service, .. } if service == "ghost"));
    }

    // ────────────────────────────────────────────────────────────────────────
    // C. Termination
    // ────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cooperative_child_stops_on_sigterm() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let spec = CommandSpec::new("sleeper", "sh")
            .arg("-c")
            .arg("sleep 30")
            .healthcheck_port(port);
        let (cancel_tx, ready_rx, handle, _) = launch(spec).await;
        ready_rx.await.unwrap();

        let begun = Instant::now();
        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(begun.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stubborn_child_is_killed_after_the_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let spec = CommandSpec::new("stubborn", "sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .healthcheck_port(port);
        let (cancel_tx, ready_rx, handle, _) = launch(spec).await;
        ready_rx.await.unwrap();

        let begun = Instant::now();
        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        // SIGTERM is ignored, so this exercised the drain plus SIGKILL.
        assert!(begun.elapsed() < Duration::from_secs(5));
    }
}
