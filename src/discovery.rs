//! Worker discovery through the OS process table
//!
//! Pre-fork servers (puma in cluster mode, unicorn) run request handling in
//! direct children of the root process. Those workers are looked up once,
//! after the root has written its PID file, so a termination sweep can reach
//! them before the root itself.

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

/// Find the direct children of `parent`, sorted by PID.
///
/// No children is the normal case for single-process servers and yields an
/// empty list. Threads and zombies are not workers and are skipped.
pub fn find_children(parent: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let parent_pid = Pid::from_u32(parent);
    let mut children: Vec<u32> = system
        .processes()
        .values()
        .filter(|process| process.thread_kind().is_none())
        .filter(|process| process.parent() == Some(parent_pid))
        .filter(|process| process.status() != ProcessStatus::Zombie)
        .map(|process| process.pid().as_u32())
        .collect();
    children.sort_unstable();

    debug!(parent, workers = ?children, "Discovered worker processes");
    children
}

/// Whether `pid` has exited but not been reaped yet
pub(crate) fn is_zombie(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    system
        .process(pid)
        .map(|process| process.status() == ProcessStatus::Zombie)
        .unwrap_or(false)
}
