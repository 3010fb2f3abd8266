//! Client-side daemon bootstrap.
//!
//! Spawns the daemon detached (working directory = home, stdio pointed at
//! the log file) and polls its socket until it becomes connectable, for up
//! to two seconds at a 10 ms interval.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use tokio::net::UnixStream;
use tracing::debug;

use crate::config::{BridgeDirs, DAEMON_POLL_INTERVAL, DAEMON_WAIT};

/// Make sure a daemon is serving `dirs`, spawning `program` if needed.
///
/// The configuration directory is created with mode 0700 when missing;
/// permissions of an existing directory are left alone.
pub async fn ensure_daemon(
    dirs: &BridgeDirs,
    program: impl AsRef<Path>,
    title: Option<&str>,
) -> anyhow::Result<()> {
    if UnixStream::connect(dirs.socket_file()).await.is_ok() {
        debug!("daemon already reachable");
        return Ok(());
    }

    dirs.ensure().context("creating the configuration directory")?;
    spawn_daemon(dirs, program.as_ref(), title)?;
    await_daemon(dirs).await
}

/// Spawn the daemon process detached from the caller.
pub fn spawn_daemon(dirs: &BridgeDirs, program: &Path, title: Option<&str>) -> anyhow::Result<()> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dirs.log_file())
        .with_context(|| format!("opening log file {}", dirs.log_file().display()))?;
    let log_stderr = log.try_clone().context("duplicating the log descriptor")?;

    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));

    let mut command = Command::new(program);
    command
        .arg(dirs.root())
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_stderr)
        .current_dir(home);
    if let Some(title) = title {
        command.arg(title);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command
        .spawn()
        .with_context(|| format!("spawning daemon {}", program.display()))?;
    debug!(program = %program.display(), "daemon spawned");
    Ok(())
}

/// Wait for the daemon socket to accept a connection.
pub async fn await_daemon(dirs: &BridgeDirs) -> anyhow::Result<()> {
    let socket = dirs.socket_file();
    let attempts = (DAEMON_WAIT.as_millis() / DAEMON_POLL_INTERVAL.as_millis()) as usize;

    let stream = (|| async { UnixStream::connect(&socket).await })
        .retry(
            ConstantBuilder::default()
                .with_delay(DAEMON_POLL_INTERVAL)
                .with_max_times(attempts),
        )
        .await
        .with_context(|| format!("daemon socket {} did not become connectable", socket.display()))?;
    drop(stream);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_await_daemon_times_out_without_listener() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dirs = BridgeDirs::new(tmp.path());
        assert!(await_daemon(&dirs).await.is_err());
    }

    #[tokio::test]
    async fn test_await_daemon_connects_to_listener() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dirs = BridgeDirs::new(tmp.path());
        let _listener = tokio::net::UnixListener::bind(dirs.socket_file()).expect("bind");

        await_daemon(&dirs).await.expect("connectable");
    }
}
