//! Error taxonomy for the supervisor
//!
//! Every failure is returned to the caller with the PID, path or OS error
//! that caused it. Nothing in this crate retries on its own.

use crate::signal::Signal;
use std::path::PathBuf;
use std::time::Duration;

/// Errors produced while resolving, running, signalling or stopping the upstream process
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No command was given, no launcher exists and no PID file is present
    #[error(
        "no command given and launcher {} not found; PID file {} does not exist either",
        launcher.display(),
        pid_file.display()
    )]
    Configuration { launcher: PathBuf, pid_file: PathBuf },

    /// The PID file does not exist
    #[error("PID file {} does not exist", path.display())]
    PidFileMissing { path: PathBuf },

    /// The PID file exists but could not be read
    #[error("failed to read PID file {}: {source}", path.display())]
    PidFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The PID file does not hold a usable process id
    #[error("PID file {} does not contain a valid process id: {contents:?}", path.display())]
    PidFileCorrupt { path: PathBuf, contents: String },

    /// The spawned process did not write its PID file in time
    #[error("timed out after {timeout:?} waiting for PID file {}", path.display())]
    PidFileTimeout { path: PathBuf, timeout: Duration },

    /// No process with this id exists
    #[error("no process with PID {pid}")]
    ProcessNotFound { pid: u32 },

    /// Signal delivery failed for a reason other than a missing process
    #[error("failed to send {signal} to PID {pid}: {source}")]
    SignalFailed {
        pid: u32,
        signal: Signal,
        #[source]
        source: std::io::Error,
    },

    /// Phased restart was requested for a server family we have no signal for
    #[error("unknown server type: {0}")]
    UnsupportedServerType(String),

    /// The process was signalled but did not exit within the bound
    #[error("PID {pid} still running {timeout:?} after {signal}")]
    ShutdownTimeout {
        pid: u32,
        signal: Signal,
        timeout: Duration,
    },

    /// The command could not be started
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Native wait was requested on a process we attached to instead of spawning
    #[error("PID {pid} was attached via PID file and cannot be waited on")]
    WaitUnsupported { pid: u32 },

    /// Waiting on a spawned child failed
    #[error("failed to wait for PID {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// An operation needed a supervised process but `run` has not started one
    #[error("no upstream process is being supervised")]
    NotRunning,

    /// Host signal handlers could not be installed
    #[error("failed to install host signal handlers: {0}")]
    SignalListener(#[source] std::io::Error),

    /// `run` was called while a previous run is still being monitored
    #[error("already supervising PID {pid}")]
    AlreadyRunning { pid: u32 },

    /// The upstream port did not answer the readiness probe in time
    #[error("upstream on port {port} not ready after {timeout:?}")]
    ReadinessTimeout { port: u16, timeout: Duration },
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
