//! Launch, health-check and tear down standalone worker processes.
//!
//! Only models with `execution.mode = subprocess` and `launch.enabled`
//! come through here. Shared workers started by someone else are reached
//! directly by their adapter.

mod probe;

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::model_spec::{Launch, ModelSpec, ProbeKind, ReadySpec};

use probe::ProbeOutcome;

const PORT_PLACEHOLDER: &str = "{port}";
const LOG_BUFFER_LINES: usize = 1024;

/// A running worker owned by one registry entry.
///
/// Dropping the handle kills the process; `ProcessSupervisor::stop` is the
/// graceful path.
pub struct WorkerHandle {
    model_id: String,
    port: u16,
    child: Child,
    logs: broadcast::Receiver<String>,
    readers: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("model_id", &self.model_id)
            .field("port", &self.port)
            .field("pid", &self.child.id())
            .finish()
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    http_client: reqwest::Client,
    grace: Duration,
    probe_interval: Duration,
}

impl ProcessSupervisor {
    pub fn new(grace: Duration, probe_interval: Duration) -> Self {
        Self {
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            grace,
            probe_interval: probe_interval.max(Duration::from_millis(10)),
        }
    }

    /// Start the worker and wait for it to become ready. On any failure the
    /// worker is stopped before the error is returned.
    pub async fn launch(&self, spec: &ModelSpec) -> Result<WorkerHandle> {
        let mut handle = self.start(spec)?;
        let ready = launch_config(spec)?.ready.clone();
        match self.await_ready(&mut handle, &ready).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                warn!("Worker for {} failed to start: {}", spec.id, e);
                self.stop(handle).await;
                Err(e)
            }
        }
    }

    /// Spawn the configured command. Does not wait for readiness.
    pub fn start(&self, spec: &ModelSpec) -> Result<WorkerHandle> {
        let launch = launch_config(spec)?;
        let (program, args) = launch
            .cmd
            .split_first()
            .ok_or_else(|| RuntimeError::load(&spec.id, "launch command is empty"))?;

        let port = reserve_port().map_err(|e| RuntimeError::load(&spec.id, e))?;
        let program = substitute_port(program, port);
        let resolved = which::which(&program).map_err(|_| {
            RuntimeError::load(&spec.id, format!("worker program not found: {}", program))
        })?;

        let mut cmd = Command::new(&resolved);
        cmd.args(args.iter().map(|a| substitute_port(a, port)))
            .envs(launch.env.iter().map(|(k, v)| (k, substitute_port(v, port))))
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Starting worker for {}: {} (port {})", spec.id, resolved.display(), port);
        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::load(&spec.id, format!("failed to spawn worker: {}", e)))?;

        let (tx, logs) = broadcast::channel(LOG_BUFFER_LINES);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(spec.id.clone(), "stdout", stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(spec.id.clone(), "stderr", stderr, tx));
        }

        Ok(WorkerHandle {
            model_id: spec.id.clone(),
            port,
            child,
            logs,
            readers,
        })
    }

    /// Block until the probe passes, the worker exits or `ready.timeout_sec`
    /// runs out.
    pub async fn await_ready(&self, handle: &mut WorkerHandle, ready: &ReadySpec) -> Result<()> {
        let timeout = ready.timeout();
        let deadline = Instant::now() + timeout;
        let started = Instant::now();

        let outcome = match ready.kind {
            ProbeKind::Http => {
                let template = ready.http_url.as_deref().ok_or_else(|| {
                    RuntimeError::load(&handle.model_id, "http readiness probe has no url")
                })?;
                let url = substitute_port(template, handle.port);
                let client = self.http_client.clone();
                probe::http(&client, &url, self.probe_interval, deadline, || handle.exit_status()).await
            }
            ProbeKind::LogRegex => {
                let pattern = ready.log_regex.as_deref().unwrap_or_default();
                let pattern = regex::Regex::new(pattern).map_err(|e| {
                    RuntimeError::load(&handle.model_id, format!("invalid readiness regex: {}", e))
                })?;
                let mut logs = handle.logs.resubscribe();
                // Lines emitted before this call are still queued on the handle's receiver.
                std::mem::swap(&mut logs, &mut handle.logs);
                probe::log_regex(&pattern, &mut logs, self.probe_interval, deadline, || {
                    handle.exit_status()
                })
                .await
            }
        };

        match outcome {
            ProbeOutcome::Ready => {
                info!(
                    model_id = %handle.model_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Worker is ready on port {}", handle.port
                );
                Ok(())
            }
            ProbeOutcome::TimedOut => Err(RuntimeError::ReadinessTimeout {
                model_id: handle.model_id.clone(),
                timeout,
            }),
            ProbeOutcome::Exited(status) => Err(RuntimeError::load(
                &handle.model_id,
                format!("worker exited before becoming ready ({})", status),
            )),
        }
    }

    /// Graceful termination signal, then a forceful kill after the grace period.
    pub async fn stop(&self, mut handle: WorkerHandle) {
        if handle.exit_status().is_none() {
            send_terminate(&mut handle);
            match tokio::time::timeout(self.grace, handle.child.wait()).await {
                Ok(Ok(status)) => info!("Worker for {} stopped ({})", handle.model_id, status),
                Ok(Err(e)) => warn!("Failed to wait for worker {}: {}", handle.model_id, e),
                Err(_) => {
                    warn!(
                        "Worker for {} ignored termination for {:?}, killing",
                        handle.model_id, self.grace
                    );
                    if let Err(e) = handle.child.kill().await {
                        warn!("Failed to kill worker {}: {}", handle.model_id, e);
                    }
                }
            }
        }
        for reader in handle.readers.drain(..) {
            reader.abort();
        }
    }
}

fn launch_config(spec: &ModelSpec) -> Result<&Launch> {
    match spec.launch.as_ref() {
        Some(launch) if launch.enabled => Ok(launch),
        _ => Err(RuntimeError::load(&spec.id, "model has no enabled launch configuration")),
    }
}

#[cfg(unix)]
fn send_terminate(handle: &mut WorkerHandle) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match handle.child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Some(Signal::SIGTERM)) {
                warn!("Failed to send SIGTERM to worker {}: {}", pid, e);
            }
        }
        None => debug!("Worker for {} already reaped", handle.model_id),
    }
}

#[cfg(not(unix))]
fn send_terminate(handle: &mut WorkerHandle) {
    // No graceful signal here; start the kill and let `wait` observe it.
    if let Err(e) = handle.child.start_kill() {
        warn!("Failed to terminate worker {}: {}", handle.model_id, e);
    }
}

fn forward_lines<R>(
    model_id: String,
    stream: &'static str,
    reader: R,
    tx: broadcast::Sender<String>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(model_id = %model_id, stream, "{}", line);
                    // No subscribers once readiness is settled; that's fine.
                    let _ = tx.send(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(model_id = %model_id, stream, "worker output closed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Ask the OS for a free loopback port. The listener is closed right away,
/// so the worker must bind it soon after.
fn reserve_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

pub(crate) fn substitute_port(template: &str, port: u16) -> String {
    template.replace(PORT_PLACEHOLDER, &port.to_string())
}
