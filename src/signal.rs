//! Signal delivery to upstream processes and host signal subscription
//!
//! Signals are the only control channel to the upstream: termination is
//! passed through unchanged, and phased restarts use the server family's
//! own reload signal.

use crate::discovery;
use crate::error::{Result, SupervisorError};
use std::fmt;
use std::str::FromStr;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info};

/// Signals the supervisor sends or relays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGINT
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGUSR1
    User1,
    /// SIGUSR2
    User2,
    /// SIGKILL, only used by collaborators escalating a timed out stop
    Kill,
}

impl Signal {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::User1 => libc::SIGUSR1,
            Signal::User2 => libc::SIGUSR2,
            Signal::Kill => libc::SIGKILL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
            Signal::Kill => "SIGKILL",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Application server families with a known phased restart signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Puma,
    Unicorn,
}

impl ServerType {
    /// The signal that makes this server reload its workers without dropping connections
    pub fn phased_restart_signal(self) -> Signal {
        match self {
            ServerType::Puma => Signal::User1,
            ServerType::Unicorn => Signal::User2,
        }
    }
}

impl FromStr for ServerType {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "puma" => Ok(ServerType::Puma),
            "unicorn" => Ok(ServerType::Unicorn),
            other => Err(SupervisorError::UnsupportedServerType(other.to_string())),
        }
    }
}

fn to_pid_t(pid: u32) -> Result<libc::pid_t> {
    // 0 and negative values address process groups, never a single process
    match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => Err(SupervisorError::ProcessNotFound { pid }),
    }
}

/// Deliver `sig` to `pid`.
///
/// Returns [`SupervisorError::ProcessNotFound`] when the process is gone,
/// even if the caller considers that harmless.
pub fn send(pid: u32, sig: Signal) -> Result<()> {
    let raw_pid = to_pid_t(pid)?;
    let result = unsafe { libc::kill(raw_pid, sig.as_raw()) };

    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Err(SupervisorError::ProcessNotFound { pid });
        }
        return Err(SupervisorError::SignalFailed {
            pid,
            signal: sig,
            source: err,
        });
    }

    debug!(pid, signal = %sig, "Signal delivered");
    Ok(())
}

/// Check whether `pid` names a live process.
///
/// A process we may not signal (EPERM) still exists. Zombies count as
/// exited: they have terminated and only wait for their parent to reap them.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw_pid) = to_pid_t(pid) else {
        return false;
    };

    let result = unsafe { libc::kill(raw_pid, 0) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        return err.raw_os_error() == Some(libc::EPERM);
    }

    !discovery::is_zombie(pid)
}

/// Termination signals delivered to this process by the host
pub struct HostSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

impl HostSignals {
    /// Install handlers for SIGINT and SIGTERM.
    ///
    /// Once installed, these signals no longer terminate the supervisor
    /// itself; they are only observed through [`recv`](Self::recv). The
    /// handlers are never uninstalled, even after this value is dropped.
    pub fn register() -> Result<Self> {
        let interrupt = signal(SignalKind::interrupt()).map_err(SupervisorError::SignalListener)?;
        let terminate = signal(SignalKind::terminate()).map_err(SupervisorError::SignalListener)?;
        Ok(Self {
            interrupt,
            terminate,
        })
    }

    /// Wait for the next host termination signal
    pub async fn recv(&mut self) -> Option<Signal> {
        let sig = tokio::select! {
            received = self.interrupt.recv() => received.map(|_| Signal::Interrupt),
            received = self.terminate.recv() => received.map(|_| Signal::Terminate),
        };
        if let Some(sig) = sig {
            info!(signal = %sig, "Received host signal");
        }
        sig
    }
}
