//! Railvisor - supervises an upstream application server behind a reverse proxy
//!
//! This library provides the process side of a front-end proxy that:
//! - Spawns the upstream server (an explicit command, or `bin/rails server`)
//! - Attaches to an already running server found through its PID file
//! - Relays SIGINT/SIGTERM to the server's workers and then the server itself
//! - Stops or phased-restarts a server by PID file, from any process
//! - Probes the server's port to tell when it is ready for traffic

#[cfg(not(unix))]
compile_error!("railvisor controls upstream processes with POSIX signals and only supports unix targets");

pub mod config;
pub mod discovery;
pub mod error;
pub mod healthcheck;
pub mod pidfile;
pub mod process;
pub mod signal;

pub use error::{Result, SupervisorError};
pub use process::{PidFileController, ProcessHandle, Started, Supervisor, SupervisorState};
