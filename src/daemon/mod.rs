//! Daemon bootstrap: single-instance lock, listener and signal-driven
//! shutdown.
//!
//! The daemon refuses to run without its configuration directory, takes an
//! exclusive advisory lock on `<dir>/lock` (exiting silently when another
//! instance holds it), writes its pid there, binds the Unix socket at
//! `<dir>/sock` and serves clients until SIGHUP, SIGINT or SIGTERM. On
//! shutdown it stops accepting, lets every in-flight handler finish its
//! current execution step, drains the pool and releases the lock.

mod handler;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use nix::fcntl::{Flock, FlockArg};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::BridgeDirs;
use crate::pool::ConnectionPool;

pub use handler::serve_client;

/// Held single-instance lock. Dropping it truncates the pidfile and
/// releases the advisory lock.
pub struct DaemonLock {
    flock: Flock<File>,
}

impl DaemonLock {
    /// Try to acquire the exclusive daemon lock.
    ///
    /// Returns `Ok(None)` when another live daemon holds it.
    pub fn acquire(dirs: &BridgeDirs) -> anyhow::Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dirs.lock_file())
            .with_context(|| format!("opening lock file {}", dirs.lock_file().display()))?;

        let mut flock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => flock,
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => return Ok(None),
            Err((_, errno)) => {
                return Err(anyhow::anyhow!(errno).context("locking the daemon lock file"));
            }
        };

        flock.set_len(0).context("truncating the pidfile")?;
        writeln!(flock, "{}", std::process::id()).context("writing the pidfile")?;
        flock.flush().context("flushing the pidfile")?;

        Ok(Some(Self { flock }))
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = self.flock.set_len(0);
    }
}

/// Run the daemon until a shutdown signal arrives.
pub async fn run(dirs: BridgeDirs, title: Option<String>) -> anyhow::Result<()> {
    anyhow::ensure!(
        dirs.exists(),
        "configuration directory {} does not exist",
        dirs.root().display()
    );

    let Some(lock) = DaemonLock::acquire(&dirs)? else {
        info!("another daemon instance holds the lock; exiting");
        return Ok(());
    };

    if let Some(title) = &title {
        info!(title = %title, "starting daemon");
    } else {
        info!("starting daemon");
    }

    let socket_path = dirs.socket_file();
    // A previous daemon may have died without unlinking its endpoint.
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    info!(path = %socket_path.display(), "daemon listening");

    let pool = Arc::new(ConnectionPool::new());
    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone());

    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    tracker.spawn(serve_client(stream, pool.clone(), shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "failed to accept client connection"),
            },
        }
    }

    info!("shutdown signal received; draining clients");
    drop(listener);
    tracker.close();
    tracker.wait().await;

    pool.clear().await;
    let _ = std::fs::remove_file(&socket_path);
    drop(lock);
    info!("daemon stopped");
    Ok(())
}

/// Cancel the token on SIGHUP, SIGINT or SIGTERM.
fn spawn_signal_watcher(shutdown: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = hangup.recv() => info!("received SIGHUP"),
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        shutdown.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_within_process() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dirs = BridgeDirs::new(tmp.path());

        let first = DaemonLock::acquire(&dirs).expect("acquire").expect("lock");
        // flock is per open-file-description, so a second acquisition in
        // the same process must still be refused.
        assert!(DaemonLock::acquire(&dirs).expect("acquire").is_none());
        drop(first);

        let again = DaemonLock::acquire(&dirs).expect("acquire");
        assert!(again.is_some());
    }

    #[test]
    fn test_lock_writes_pid() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dirs = BridgeDirs::new(tmp.path());

        let lock = DaemonLock::acquire(&dirs).expect("acquire").expect("lock");
        let contents = std::fs::read_to_string(dirs.lock_file()).expect("read pidfile");
        assert_eq!(contents, format!("{}\n", std::process::id()));
        drop(lock);

        let contents = std::fs::read_to_string(dirs.lock_file()).expect("read pidfile");
        assert!(contents.is_empty());
    }

    #[tokio::test]
    async fn test_run_refuses_missing_config_dir() {
        let dirs = BridgeDirs::new("/nonexistent/ssh-bridge-test");
        let err = run(dirs, None).await.expect_err("missing dir");
        assert!(err.to_string().contains("does not exist"));
    }
}
