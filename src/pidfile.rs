//! Reading the PID file written by the upstream application
//!
//! The application owns this file: it writes it after booting and may
//! remove it, or leave it stale, when it exits. The supervisor only reads.

use crate::error::{Result, SupervisorError};
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info};

/// Conventional PID file location of a Rails application
pub const DEFAULT_PID_FILE: &str = "tmp/pids/server.pid";

/// Read the process id stored at `path`.
///
/// Surrounding whitespace is ignored. A missing file, an unreadable file
/// and unparsable contents are reported as distinct errors.
pub fn read(path: &Path) -> Result<u32> {
    let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => SupervisorError::PidFileMissing {
            path: path.to_path_buf(),
        },
        _ => SupervisorError::PidFileUnreadable {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    parse(&contents).ok_or_else(|| SupervisorError::PidFileCorrupt {
        path: path.to_path_buf(),
        contents: contents.trim().to_string(),
    })
}

fn parse(contents: &str) -> Option<u32> {
    let pid: u32 = contents.trim().parse().ok()?;
    // pid 0 and anything beyond pid_t would address process groups when signalled
    if pid == 0 || libc::pid_t::try_from(pid).is_err() {
        return None;
    }
    Some(pid)
}

/// What a PID file looked like at one moment.
///
/// Taken before spawning over a leftover file, so a rewrite by the new
/// process can be told apart from the stale contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    modified: Option<SystemTime>,
    contents: String,
}

/// Capture the current state of `path`, `None` when it cannot be read
pub fn snapshot(path: &Path) -> Option<Snapshot> {
    let contents = std::fs::read_to_string(path).ok()?;
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    Some(Snapshot { modified, contents })
}

/// Poll until `path` exists, checking every `poll_interval` for at most `timeout`
pub async fn wait_for_creation(path: &Path, timeout: Duration, poll_interval: Duration) -> Result<()> {
    wait_for_update(path, None, timeout, poll_interval).await
}

/// Poll until `path` has been written since `previous` was taken.
///
/// Without a previous snapshot this is plain existence. With one, the file
/// must hold non-empty contents that differ from it, by contents or by
/// modification time.
pub async fn wait_for_update(
    path: &Path,
    previous: Option<&Snapshot>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        if is_updated(path, previous) {
            info!(path = %path.display(), "PID file found");
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(SupervisorError::PidFileTimeout {
                path: path.to_path_buf(),
                timeout,
            });
        }

        debug!(path = %path.display(), stale = previous.is_some(), "Waiting for PID file");
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

fn is_updated(path: &Path, previous: Option<&Snapshot>) -> bool {
    let Some(previous) = previous else {
        return path.exists();
    };

    match snapshot(path) {
        // A writer may have truncated the file but not filled it yet
        Some(current) => !current.contents.trim().is_empty() && current != *previous,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_read_tolerates_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");

        fs::write(&path, "  4242\n\n").unwrap();
        assert_eq!(read(&path).unwrap(), 4242);

        fs::write(&path, "\t17 ").unwrap();
        assert_eq!(read(&path).unwrap(), 17);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.pid");

        let err = read(&path).unwrap_err();
        assert!(matches!(err, SupervisorError::PidFileMissing { path: ref p } if *p == path));
    }

    #[test]
    fn test_read_unreadable_file() {
        // A directory exists but cannot be read as a file
        let dir = tempfile::tempdir().unwrap();

        let err = read(dir.path()).unwrap_err();
        assert!(matches!(err, SupervisorError::PidFileUnreadable { .. }));
    }

    #[test]
    fn test_read_corrupt_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");

        for contents in ["not-a-pid", "", "-12", "12 34", "3.5", "0", "99999999999"] {
            fs::write(&path, contents).unwrap();
            let err = read(&path).unwrap_err();
            assert!(
                matches!(err, SupervisorError::PidFileCorrupt { .. }),
                "expected corrupt for {:?}, got {:?}",
                contents,
                err
            );
        }
    }

    #[test]
    fn test_read_does_not_modify_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        fs::write(&path, "123\n").unwrap();

        read(&path).unwrap();
        read(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "123\n");
    }

    #[tokio::test]
    async fn test_wait_for_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        fs::write(&path, "1").unwrap();

        wait_for_creation(&path, Duration::from_millis(100), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_file_created_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::write(writer_path, "99").unwrap();
        });

        wait_for_creation(&path, Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(read(&path).unwrap(), 99);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.pid");

        let start = std::time::Instant::now();
        let err = wait_for_creation(&path, Duration::from_millis(100), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::PidFileTimeout { timeout, .. } if timeout == Duration::from_millis(100)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_wait_for_update_ignores_leftover_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        fs::write(&path, "4242\n").unwrap();
        let stale = snapshot(&path).unwrap();

        let err = wait_for_update(&path, Some(&stale), Duration::from_millis(100), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::PidFileTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_update_sees_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        fs::write(&path, "4242\n").unwrap();
        let stale = snapshot(&path).unwrap();

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            // Truncated first, as a shell redirect would
            fs::write(&writer_path, "").unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::write(&writer_path, "777\n").unwrap();
        });

        wait_for_update(&path, Some(&stale), Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(read(&path).unwrap(), 777);
    }

    #[test]
    fn test_snapshot_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(snapshot(&dir.path().join("absent.pid")).is_none());
    }
}
