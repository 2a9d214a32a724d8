use crate::config::WorkerConfig;
use crate::launch::{LaunchParams, READY_MARKER};
use crate::ports::PortSlot;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a worker never became ready
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnError {
    /// No port slot was free
    #[error("no free port slot")]
    NoCapacity,
    /// The OS refused to start the process
    #[error("failed to launch worker: {0}")]
    Launch(String),
    /// The process exited before signalling readiness
    #[error("worker exited before becoming ready (exit code {0:?})")]
    Exited(Option<i32>),
    #[error("worker did not become ready within {0:?}")]
    Timeout(Duration),
    /// The control channel closed without a readiness signal
    #[error("worker control channel closed before readiness")]
    ChannelClosed,
    #[error("worker stopped while starting")]
    Stopped,
    #[error("supervisor is not running")]
    SupervisorGone,
}

/// What the supervisor asks a launcher to start
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub graph: String,
    pub slot: PortSlot,
    pub bind_address: Option<String>,
    pub analytics_id: Option<String>,
}

impl LaunchSpec {
    pub fn params(&self) -> LaunchParams {
        LaunchParams {
            graph: self.graph.clone(),
            app_port: self.slot.app_port,
            ws_port: self.slot.ws_port,
            bind_address: self.bind_address.clone(),
            analytics_id: self.analytics_id.clone(),
        }
    }
}

/// Owner-side handle used to stop a worker.
///
/// Dropping the handle stops the worker as well, so a worker never outlives
/// the table entry that owns it.
pub struct WorkerHandle {
    pid: Option<u32>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Create a handle and the receiving end the worker's monitor listens on
    pub fn channel(pid: Option<u32>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                pid,
                stop: Some(tx),
                task: None,
            },
            rx,
        )
    }

    /// Attach the monitor task so [`WorkerHandle::shutdown`] can wait for it
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the worker to stop. Returns immediately.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }

    /// Stop the worker and wait until its process is gone
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("stopping", &self.stop.is_none())
            .finish()
    }
}

/// A launched worker
pub struct WorkerProcess {
    pub pid: Option<u32>,
    /// Resolves exactly once with the startup outcome
    pub ready: oneshot::Receiver<Result<(), SpawnError>>,
    /// Resolves with the exit code when a ready worker's process ends
    pub exited: oneshot::Receiver<Option<i32>>,
    pub handle: WorkerHandle,
}

/// Starts worker processes. The supervisor only talks to workers through
/// this trait.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerProcess, SpawnError>;
}

pub type SharedLauncher = Arc<dyn Launcher>;

/// Launches workers as local child processes
pub struct ProcessLauncher {
    config: WorkerConfig,
}

impl ProcessLauncher {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerProcess, SpawnError> {
        let graph = spec.graph.as_str();
        info!(
            graph,
            index = spec.slot.index,
            app_port = spec.slot.app_port,
            ws_port = spec.slot.ws_port,
            command = %self.config.command,
            "Starting worker"
        );

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        // Launch parameters win over configured environment
        for (key, value) in spec.params().env() {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| SpawnError::Launch(e.to_string()))?;
        let pid = child.id();
        info!(graph, pid, "Worker process spawned");

        if let Some(stderr) = child.stderr.take() {
            let graph = graph.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(graph = %graph, "worker stderr: {}", line);
                }
            });
        }

        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (handle, stop_rx) = WorkerHandle::channel(pid);

        let task = tokio::spawn(monitor_worker(
            spec.graph.clone(),
            child,
            stdout,
            ready_tx,
            exit_tx,
            stop_rx,
            self.config.shutdown_grace_period(),
        ));

        Ok(WorkerProcess {
            pid,
            ready: ready_rx,
            exited: exit_rx,
            handle: handle.with_task(task),
        })
    }
}

/// Watch one worker process for its whole life: relay its stdout, deliver
/// the readiness signal, report its exit and stop it on request.
async fn monitor_worker(
    graph: String,
    mut child: Child,
    mut stdout: Option<Lines<BufReader<ChildStdout>>>,
    ready_tx: oneshot::Sender<Result<(), SpawnError>>,
    exit_tx: oneshot::Sender<Option<i32>>,
    mut stop_rx: oneshot::Receiver<()>,
    grace_period: Duration,
) {
    let mut ready_tx = Some(ready_tx);
    let mut stdout_open = stdout.is_some();

    loop {
        tokio::select! {
            line = next_line(&mut stdout), if stdout_open => {
                match line {
                    Some(line) => handle_control_line(&graph, &line, &mut ready_tx),
                    None => stdout_open = false,
                }
            }
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                match ready_tx.take() {
                    Some(tx) => {
                        warn!(graph, ?code, "Worker exited before signalling readiness");
                        let _ = tx.send(Err(SpawnError::Exited(code)));
                    }
                    None => {
                        warn!(graph, ?code, "Worker exited");
                        let _ = exit_tx.send(code);
                    }
                }
                return;
            }
            _ = &mut stop_rx => {
                // Also reached when the owning handle is dropped
                let status = stop_child(&graph, &mut child, grace_period).await;
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(SpawnError::Stopped));
                } else {
                    let _ = exit_tx.send(status.and_then(|s| s.code()));
                }
                return;
            }
        }
    }
}

async fn next_line<R>(lines: &mut Option<Lines<BufReader<R>>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines.as_mut() {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

fn handle_control_line(
    graph: &str,
    line: &str,
    ready_tx: &mut Option<oneshot::Sender<Result<(), SpawnError>>>,
) {
    if line.trim() != READY_MARKER {
        debug!(graph, "worker: {}", line);
        return;
    }
    match ready_tx.take() {
        Some(tx) => {
            debug!(graph, "Worker signalled readiness");
            let _ = tx.send(Ok(()));
        }
        None => {
            warn!(graph, "Protocol violation: worker signalled readiness more than once");
        }
    }
}

/// Send SIGTERM, then SIGKILL once the grace period runs out
async fn stop_child(graph: &str, child: &mut Child, grace_period: Duration) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        info!(graph, pid, "Sending SIGTERM to worker");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(graph, ?status, "Worker exited gracefully");
            Some(status)
        }
        Ok(Err(e)) => {
            warn!(graph, error = %e, "Error waiting for worker to exit");
            None
        }
        Err(_) => {
            warn!(
                graph,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn slot() -> PortSlot {
        PortSlot {
            index: 1,
            app_port: 3901,
            ws_port: 4901,
        }
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            graph: "rome".to_string(),
            slot: slot(),
            bind_address: None,
            analytics_id: None,
        }
    }

    fn shell_worker(script: &str) -> ProcessLauncher {
        ProcessLauncher::new(WorkerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            env: HashMap::new(),
            shutdown_grace_period_secs: 1,
            ..WorkerConfig::default()
        })
    }

    #[test]
    fn test_launch_spec_params() {
        let params = spec().params();
        assert_eq!(params.graph, "rome");
        assert_eq!(params.app_port, 3901);
        assert_eq!(params.ws_port, 4901);
    }

    #[tokio::test]
    async fn test_launch_missing_command() {
        let launcher = ProcessLauncher::new(WorkerConfig {
            command: "/nonexistent/graph-worker".to_string(),
            ..WorkerConfig::default()
        });

        match launcher.launch(&spec()) {
            Err(SpawnError::Launch(_)) => {}
            other => panic!("expected launch error, got {:?}", other.map(|p| p.pid)),
        }
    }

    #[tokio::test]
    async fn test_ready_marker_resolves_ready() {
        let launcher = shell_worker("echo booting; echo GRAPHMUX_READY; sleep 30");
        let process = launcher.launch(&spec()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), process.ready)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Ok(()));

        process.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_launch_params_reach_the_child() {
        let launcher = shell_worker(
            "[ \"$GRAPHMUX_GRAPH\" = rome ] && [ \"$PORT\" = 3901 ] && echo GRAPHMUX_READY; sleep 30",
        );
        let process = launcher.launch(&spec()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), process.ready)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Ok(()));

        process.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_reported() {
        let launcher = shell_worker("exit 3");
        let process = launcher.launch(&spec()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), process.ready)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Err(SpawnError::Exited(Some(3))));
    }

    #[tokio::test]
    async fn test_exit_after_ready_is_reported() {
        let launcher = shell_worker("echo GRAPHMUX_READY; sleep 0.2; exit 0");
        let process = launcher.launch(&spec()).unwrap();

        assert_eq!(process.ready.await.unwrap(), Ok(()));
        let code = tokio::time::timeout(Duration::from_secs(5), process.exited)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn test_stop_terminates_running_worker() {
        let launcher = shell_worker("echo GRAPHMUX_READY; exec sleep 30");
        let mut process = launcher.launch(&spec()).unwrap();
        assert_eq!(process.ready.await.unwrap(), Ok(()));

        process.handle.stop();
        let exited = tokio::time::timeout(Duration::from_secs(5), process.exited).await;
        assert!(exited.is_ok(), "worker did not stop in time");
    }

    #[tokio::test]
    async fn test_stop_while_starting_reports_stopped() {
        let launcher = shell_worker("exec sleep 30");
        let mut process = launcher.launch(&spec()).unwrap();

        process.handle.stop();
        let outcome = tokio::time::timeout(Duration::from_secs(5), process.ready)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Err(SpawnError::Stopped));
    }
}
