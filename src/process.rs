use crate::config::SupervisorConfig;
use crate::discovery;
use crate::error::{Result, SupervisorError};
use crate::pidfile;
use crate::signal::{self, HostSignals, ServerType, Signal};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Interval for polling process liveness after a stop signal (in milliseconds)
const STOP_POLL_INTERVAL_MS: u64 = 50;

/// Lifecycle of a [`Supervisor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Constructed, `run` not called yet
    Uninitialized,
    /// Deciding between spawning and attaching
    Resolving,
    /// Starting a new process
    Spawning,
    /// Taking over a process found through the PID file
    Attaching,
    /// Relaying signals and waiting for the process to exit
    Monitoring,
    /// A termination signal was relayed, waiting for the process to exit
    Stopping,
    /// The process has exited
    Terminated,
}

/// Handle to the supervised process
pub enum ProcessHandle {
    /// Started by us; stdio is inherited and the exit status can be awaited
    Spawned { child: Child, pid: u32 },
    /// Found through the PID file; only known by its PID
    Attached { pid: u32 },
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        match self {
            ProcessHandle::Spawned { pid, .. } | ProcessHandle::Attached { pid } => *pid,
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, ProcessHandle::Attached { .. })
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        signal::send(self.pid(), sig)
    }

    /// Wait for a spawned child to exit.
    ///
    /// Attached processes are not our children, so the OS will not report
    /// their exit status to us; this fails with
    /// [`SupervisorError::WaitUnsupported`] for them.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        match self {
            ProcessHandle::Spawned { child, pid } => child
                .wait()
                .await
                .map_err(|source| SupervisorError::Wait { pid: *pid, source }),
            ProcessHandle::Attached { pid } => Err(SupervisorError::WaitUnsupported { pid: *pid }),
        }
    }
}

/// Sent once per [`Supervisor::run`] as soon as the process is known to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Started {
    pub pid: u32,
    pub attached: bool,
}

/// How `run` obtains a process when none is running yet
#[derive(Debug, Clone, PartialEq, Eq)]
enum Launch {
    Spawn { program: String, args: Vec<String> },
    AttachOnly,
}

enum Target {
    Attach(u32),
    Spawn(String, Vec<String>),
}

/// Background tasks and channels of the current run
struct Monitor {
    target: Started,
    exit_rx: watch::Receiver<Option<i32>>,
    workers: Arc<watch::Sender<Vec<u32>>>,
    shutdown_tx: mpsc::Sender<Signal>,
}

/// Stop and phased restart by PID file.
///
/// Works against whatever process the PID file names, whether or not a
/// [`Supervisor`] in this process started it.
#[derive(Debug, Clone)]
pub struct PidFileController {
    pid_file: PathBuf,
    stop_timeout: Duration,
}

impl PidFileController {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
            stop_timeout: SupervisorConfig::default().stop_timeout(),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            pid_file: config.pid_file_path(),
            stop_timeout: config.stop_timeout(),
        }
    }

    /// Set how long `stop` waits for the process to exit (builder pattern)
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn read_pid(&self) -> Result<u32> {
        pidfile::read(&self.pid_file)
    }

    /// Send SIGTERM to the process in the PID file and wait for it to exit.
    ///
    /// A missing process is reported as [`SupervisorError::ProcessNotFound`];
    /// callers decide whether that counts as stopped. A process still alive
    /// after the stop timeout yields [`SupervisorError::ShutdownTimeout`] and
    /// is left running.
    pub async fn stop(&self) -> Result<()> {
        let pid = self.read_pid()?;
        info!(pid, path = %self.pid_file.display(), "Stopping upstream process");

        signal::send(pid, Signal::Terminate)?;
        wait_until_gone(pid, Signal::Terminate, self.stop_timeout).await?;

        info!(pid, "Upstream process stopped");
        Ok(())
    }

    /// Ask the server in the PID file to reload its workers without dropping connections
    pub fn phased_restart(&self, server_type: &str) -> Result<()> {
        let sig = server_type.parse::<ServerType>()?.phased_restart_signal();
        let pid = self.read_pid()?;

        info!(pid, server_type, signal = %sig, "Phased restart of upstream");
        signal::send(pid, sig)
    }
}

async fn wait_until_gone(pid: u32, sig: Signal, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;

    while signal::is_alive(pid) {
        if Instant::now() >= deadline {
            warn!(pid, timeout_ms = timeout.as_millis(), "Upstream did not exit in time");
            return Err(SupervisorError::ShutdownTimeout {
                pid,
                signal: sig,
                timeout,
            });
        }
        tokio::time::sleep(Duration::from_millis(STOP_POLL_INTERVAL_MS)).await;
    }

    Ok(())
}

/// Supervises one upstream application server.
///
/// # Usage
///
/// ```ignore
/// let mut supervisor = Supervisor::new(SupervisorConfig::command("bin/rails").with_args(args))?;
/// let started = supervisor.started();
/// let exit_code = supervisor.run().await?;
/// ```
///
/// `run` either spawns the configured command or, when the PID file names a
/// live process, attaches to it. Either way two background tasks are
/// started: one waits for the process to exit and publishes its exit code,
/// the other relays host SIGINT/SIGTERM to the discovered workers and then
/// to the root process.
pub struct Supervisor {
    config: SupervisorConfig,
    launch: Launch,
    controller: PidFileController,
    state: Arc<watch::Sender<SupervisorState>>,
    started_tx: Option<oneshot::Sender<Started>>,
    monitor: Option<Monitor>,
    span: tracing::Span,
}

impl Supervisor {
    /// Resolve the command to run.
    ///
    /// An explicit command wins; otherwise the launcher is used when it
    /// exists on disk. Without either, the PID file must already exist so
    /// `run` can attach. Nothing is spawned until `run`.
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let controller = PidFileController::from_config(&config);
        let span = info_span!("supervisor", pid_file = %controller.pid_file().display());
        let launch = span.in_scope(|| resolve_launch(&config));

        if launch == Launch::AttachOnly && !controller.pid_file().exists() {
            let err = SupervisorError::Configuration {
                launcher: config.launcher_path(),
                pid_file: controller.pid_file().to_path_buf(),
            };
            span.in_scope(|| error!(error = %err, "Nothing to run or attach to"));
            return Err(err);
        }

        let (state, _) = watch::channel(SupervisorState::Uninitialized);

        Ok(Self {
            config,
            launch,
            controller,
            state: Arc::new(state),
            started_tx: None,
            monitor: None,
            span,
        })
    }

    /// Receiver for the next run's "started" notification.
    ///
    /// Only the receiver from the most recent call is notified.
    pub fn started(&mut self) -> oneshot::Receiver<Started> {
        let (tx, rx) = oneshot::channel();
        self.started_tx = Some(tx);
        rx
    }

    /// The command `run` would spawn, `None` when it can only attach
    pub fn command(&self) -> Option<(&str, &[String])> {
        match &self.launch {
            Launch::Spawn { program, args } => Some((program.as_str(), args.as_slice())),
            Launch::AttachOnly => None,
        }
    }

    pub fn pid_file(&self) -> &Path {
        self.controller.pid_file()
    }

    pub fn controller(&self) -> &PidFileController {
        &self.controller
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// The process of the current or last run
    pub fn target(&self) -> Option<Started> {
        self.monitor.as_ref().map(|m| m.target)
    }

    /// Workers found for the current run; emptied by a termination sweep
    pub fn workers(&self) -> Vec<u32> {
        self.monitor
            .as_ref()
            .map(|m| m.workers.borrow().clone())
            .unwrap_or_default()
    }

    /// Start or attach to the upstream process.
    ///
    /// In synchronous mode this returns the process's exit code once it
    /// exits. Otherwise it returns 0 as soon as the process is started (and,
    /// with worker discovery, its PID file has appeared). Processes that die
    /// from a signal, and attached processes, report 0.
    ///
    /// If the PID file does not appear in time the error is returned but the
    /// spawned process is left running and its signals are still relayed.
    ///
    /// # Host signals
    ///
    /// `run` installs SIGINT and SIGTERM handlers in the calling process and
    /// they stay installed for the life of the process: once the supervised
    /// process has exited, SIGINT and SIGTERM no longer terminate the caller.
    /// Callers running detached or attached that want to stay killable must
    /// listen for those signals themselves (for example with
    /// [`HostSignals`](crate::signal::HostSignals)) and exit on receipt.
    pub async fn run(&mut self) -> Result<i32> {
        if let Some(monitor) = &self.monitor {
            if self.state() != SupervisorState::Terminated {
                return Err(SupervisorError::AlreadyRunning {
                    pid: monitor.target.pid,
                });
            }
        }

        let span = self.span.clone();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<i32> {
        self.state.send_replace(SupervisorState::Resolving);
        let target = self.resolve_target().map_err(|e| self.abandon(e))?;
        match target {
            Target::Attach(pid) => self.attach(pid).await,
            Target::Spawn(program, args) => self.spawn(program, args).await,
        }
    }

    /// Send SIGTERM to the process named in the PID file and wait for it to exit
    pub async fn stop(&self) -> Result<()> {
        self.controller.stop().instrument(self.span.clone()).await
    }

    /// Send the phased restart signal of `server_type` to the process in the PID file
    pub fn phased_restart(&self, server_type: &str) -> Result<()> {
        self.span.in_scope(|| self.controller.phased_restart(server_type))
    }

    /// Relay `sig` to the workers and the root process as if the host had
    /// delivered it, then wait for the root to exit and return its exit code
    pub async fn shutdown(&self, sig: Signal) -> Result<i32> {
        let monitor = self.monitor.as_ref().ok_or(SupervisorError::NotRunning)?;

        // The relay task is gone once the process has exited on its own
        if monitor.shutdown_tx.send(sig).await.is_err() {
            debug!(pid = monitor.target.pid, "Relay already finished");
        }

        let mut exit_rx = monitor.exit_rx.clone();
        Ok(wait_exit(&mut exit_rx).await)
    }

    /// Wait for the supervised process to exit and return its exit code
    pub async fn wait_for_exit(&self) -> Result<i32> {
        let monitor = self.monitor.as_ref().ok_or(SupervisorError::NotRunning)?;
        let mut exit_rx = monitor.exit_rx.clone();
        Ok(wait_exit(&mut exit_rx).await)
    }

    fn resolve_target(&self) -> Result<Target> {
        let pid_file = self.controller.pid_file();

        match (pidfile::read(pid_file), &self.launch) {
            (Ok(pid), _) if signal::is_alive(pid) => Ok(Target::Attach(pid)),
            (Ok(pid), Launch::Spawn { program, args }) => {
                warn!(pid, path = %pid_file.display(), "Ignoring stale PID file");
                Ok(Target::Spawn(program.clone(), args.clone()))
            }
            (Ok(pid), Launch::AttachOnly) => Err(SupervisorError::ProcessNotFound { pid }),
            (Err(e), Launch::Spawn { program, args }) => {
                debug!(reason = %e, "No running upstream to attach to");
                Ok(Target::Spawn(program.clone(), args.clone()))
            }
            (Err(e), Launch::AttachOnly) => Err(e),
        }
    }

    async fn attach(&mut self, pid: u32) -> Result<i32> {
        self.state.send_replace(SupervisorState::Attaching);
        info!(pid, "Connected to running upstream");

        let host = HostSignals::register().map_err(|e| self.abandon(e))?;
        let mut exit_rx = self.start_monitoring(ProcessHandle::Attached { pid }, host);

        if self.config.synchronous {
            wait_exit(&mut exit_rx).await;
        }
        Ok(0)
    }

    async fn spawn(&mut self, program: String, args: Vec<String>) -> Result<i32> {
        self.state.send_replace(SupervisorState::Spawning);
        info!(command = %program, ?args, "Starting upstream process");

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        if let Some(port) = self.config.target_port {
            cmd.env("PORT", port.to_string());
        }

        // Listen before spawning so the child is never running unrelayed
        let host = HostSignals::register().map_err(|e| self.abandon(e))?;

        // A leftover PID file must be rewritten before it confirms this child
        let leftover = if self.config.discover_workers {
            pidfile::snapshot(self.controller.pid_file())
        } else {
            None
        };
        if leftover.is_some() {
            debug!(path = %self.controller.pid_file().display(), "PID file already present, waiting for it to be rewritten");
        }

        let child = cmd.spawn().map_err(|source| {
            self.abandon(SupervisorError::Spawn {
                command: program.clone(),
                source,
            })
        })?;
        let pid = child.id().ok_or_else(|| {
            self.abandon(SupervisorError::Spawn {
                command: program.clone(),
                source: std::io::Error::other("spawned process has no PID"),
            })
        })?;
        info!(pid, "Upstream process spawned");

        let mut exit_rx = self.start_monitoring(ProcessHandle::Spawned { child, pid }, host);

        if self.config.discover_workers {
            self.discover_workers(pid, leftover.as_ref(), exit_rx.clone()).await?;
        }

        if self.config.synchronous {
            return Ok(wait_exit(&mut exit_rx).await);
        }
        Ok(0)
    }

    /// Roll the state back after a run failed before any process was monitored
    fn abandon(&self, err: SupervisorError) -> SupervisorError {
        let state = if self.monitor.is_some() {
            SupervisorState::Terminated
        } else {
            SupervisorState::Uninitialized
        };
        self.state.send_replace(state);
        err
    }

    /// Start the exit waiter and the signal relay, then announce the process
    fn start_monitoring(&mut self, handle: ProcessHandle, host: HostSignals) -> watch::Receiver<Option<i32>> {
        let target = Started {
            pid: handle.pid(),
            attached: handle.is_attached(),
        };
        let (exit_tx, exit_rx) = watch::channel(None);
        let (workers, _) = watch::channel(Vec::new());
        let workers = Arc::new(workers);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        // Before the waiter exists, so a fast exit cannot be overwritten
        self.state.send_replace(SupervisorState::Monitoring);

        tokio::spawn(
            watch_exit(
                handle,
                self.config.liveness_poll_interval(),
                exit_tx,
                Arc::clone(&self.state),
            )
            .in_current_span(),
        );
        tokio::spawn(
            relay_signals(
                host,
                shutdown_rx,
                target.pid,
                Arc::clone(&workers),
                exit_rx.clone(),
                Arc::clone(&self.state),
            )
            .in_current_span(),
        );

        if let Some(tx) = self.started_tx.take() {
            let _ = tx.send(target);
        }

        self.monitor = Some(Monitor {
            target,
            exit_rx: exit_rx.clone(),
            workers,
            shutdown_tx,
        });
        exit_rx
    }

    async fn discover_workers(
        &self,
        root: u32,
        leftover: Option<&pidfile::Snapshot>,
        mut exit_rx: watch::Receiver<Option<i32>>,
    ) -> Result<()> {
        let pid_file = self.controller.pid_file();

        tokio::select! {
            created = pidfile::wait_for_update(
                pid_file,
                leftover,
                self.config.pid_file_timeout(),
                self.config.pid_file_poll_interval(),
            ) => {
                if let Err(e) = created {
                    error!(pid = root, error = %e, "PID file never appeared, leaving upstream running");
                    return Err(e);
                }
            }
            exit_code = wait_exit(&mut exit_rx) => {
                warn!(pid = root, exit_code, "Upstream exited before writing its PID file");
                return Ok(());
            }
        }

        let found = discovery::find_children(root);
        info!(pid = root, workers = ?found, "Worker discovery complete");
        if let Some(monitor) = &self.monitor {
            monitor.workers.send_replace(found);
        }
        Ok(())
    }
}

fn resolve_launch(config: &SupervisorConfig) -> Launch {
    if let Some(command) = config.command.as_deref().filter(|c| !c.is_empty()) {
        return Launch::Spawn {
            program: command.to_string(),
            args: config.args.clone(),
        };
    }

    let launcher = config.launcher_path();
    if launcher.is_file() {
        debug!(launcher = %launcher.display(), "No command given, using launcher");
        return Launch::Spawn {
            program: launcher.to_string_lossy().into_owned(),
            args: config.launcher_args.clone(),
        };
    }

    Launch::AttachOnly
}

/// Wait until the exit waiter has published an exit code
async fn wait_exit(exit_rx: &mut watch::Receiver<Option<i32>>) -> i32 {
    loop {
        let current = *exit_rx.borrow_and_update();
        if let Some(code) = current {
            return code;
        }
        if exit_rx.changed().await.is_err() {
            let last = *exit_rx.borrow();
            return last.unwrap_or(0);
        }
    }
}

fn exit_code(pid: u32, status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => {
            info!(pid, exit_code = code, "Upstream process exited");
            code
        }
        None => {
            info!(pid, signal = ?status.signal(), "Upstream process terminated by signal");
            0
        }
    }
}

/// Exit waiter: publish the exit code once the process is gone
async fn watch_exit(
    mut handle: ProcessHandle,
    liveness_interval: Duration,
    exit_tx: watch::Sender<Option<i32>>,
    state: Arc<watch::Sender<SupervisorState>>,
) {
    let pid = handle.pid();

    let code = if handle.is_attached() {
        while signal::is_alive(pid) {
            tokio::time::sleep(liveness_interval).await;
        }
        info!(pid, "Attached upstream process is gone");
        0
    } else {
        match handle.wait().await {
            Ok(status) => exit_code(pid, status),
            Err(e) => {
                warn!(pid, error = %e, "Unable to collect upstream exit status");
                0
            }
        }
    };

    state.send_replace(SupervisorState::Terminated);
    exit_tx.send_replace(Some(code));
}

/// Signal relay: forward the first host or requested termination signal,
/// workers first, then wait for the root to exit
async fn relay_signals(
    mut host: HostSignals,
    mut requests: mpsc::Receiver<Signal>,
    root: u32,
    workers: Arc<watch::Sender<Vec<u32>>>,
    mut exit_rx: watch::Receiver<Option<i32>>,
    state: Arc<watch::Sender<SupervisorState>>,
) {
    // An exit that is already known wins over a pending request: the PID may be reused
    let sig = tokio::select! {
        biased;
        _ = wait_exit(&mut exit_rx) => {
            debug!(pid = root, "Upstream exited, signal relay finished");
            return;
        }
        Some(sig) = requests.recv() => sig,
        Some(sig) = host.recv() => sig,
    };

    state.send_replace(SupervisorState::Stopping);
    info!(pid = root, signal = %sig, "Relaying signal to upstream");
    terminate_tree(root, sig, &workers, signal::send);

    let exit_code = wait_exit(&mut exit_rx).await;
    info!(pid = root, exit_code, "Upstream shut down");
}

/// Signal every worker, then the root. The worker set is cleared.
fn terminate_tree<F>(root: u32, sig: Signal, workers: &watch::Sender<Vec<u32>>, mut send: F)
where
    F: FnMut(u32, Signal) -> Result<()>,
{
    let workers = workers.send_replace(Vec::new());

    for pid in workers {
        match send(pid, sig) {
            Ok(()) => info!(pid, signal = %sig, "Signaled worker process"),
            Err(SupervisorError::ProcessNotFound { .. }) => debug!(pid, "Worker already exited"),
            Err(e) => warn!(pid, error = %e, "Failed to signal worker process"),
        }
    }

    match send(root, sig) {
        Ok(()) => {}
        Err(SupervisorError::ProcessNotFound { .. }) => debug!(pid = root, "Upstream already exited"),
        Err(e) => warn!(pid = root, error = %e, "Failed to signal upstream process"),
    }
}
