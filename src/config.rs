//! Configuration resolution for the SSH bridge.
//!
//! Values are resolved with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_BRIDGE_DIR` | `~/.ssh-bridge` | Configuration directory |
//! | `SSH_BRIDGE_READY_TIMEOUT` | 10s | SSH ready timeout in seconds |
//! | `SSH_BRIDGE_IDLE_TTL` | 43200s | Retention of reusable idle sessions in seconds |

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout for an SSH connection to become ready, in seconds.
pub(crate) const DEFAULT_READY_TIMEOUT_SECS: u64 = 10;

/// Keepalive probe interval on established SSH sessions.
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Number of unanswered keepalive probes tolerated before the session drops.
pub(crate) const KEEPALIVE_MAX: usize = 3;

/// Default retention of an idle reusable session, in seconds (12 hours).
pub(crate) const DEFAULT_IDLE_TTL_SECS: u64 = 12 * 60 * 60;

/// Retention of a shared session awaiting pickup via its share key.
pub(crate) const SHARE_TTL: Duration = Duration::from_secs(5);

/// How long a client waits for a freshly spawned daemon to become connectable.
pub(crate) const DAEMON_WAIT: Duration = Duration::from_secs(2);

/// Poll interval while waiting for the daemon socket.
pub(crate) const DAEMON_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Environment variable name for the configuration directory
pub(crate) const CONFIG_DIR_ENV_VAR: &str = "SSH_BRIDGE_DIR";

/// Environment variable name for the SSH ready timeout
pub(crate) const READY_TIMEOUT_ENV_VAR: &str = "SSH_BRIDGE_READY_TIMEOUT";

/// Environment variable name for the idle session TTL
pub(crate) const IDLE_TTL_ENV_VAR: &str = "SSH_BRIDGE_IDLE_TTL";

/// Name of the configuration directory under the home directory.
const DEFAULT_DIR_NAME: &str = ".ssh-bridge";

/// Resolve the SSH ready timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_ready_timeout(timeout_param: Option<u64>) -> Duration {
    if let Some(timeout) = timeout_param {
        return Duration::from_secs(timeout);
    }

    if let Ok(env_timeout) = env::var(READY_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return Duration::from_secs(timeout);
    }

    Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS)
}

/// Resolve the idle session TTL with priority: parameter -> env var -> default
pub(crate) fn resolve_idle_ttl(ttl_param: Option<u64>) -> Duration {
    if let Some(ttl) = ttl_param {
        return Duration::from_secs(ttl);
    }

    if let Ok(env_ttl) = env::var(IDLE_TTL_ENV_VAR)
        && let Ok(ttl) = env_ttl.parse::<u64>()
    {
        return Duration::from_secs(ttl);
    }

    Duration::from_secs(DEFAULT_IDLE_TTL_SECS)
}

/// Resolve the configuration directory with priority: parameter -> env var -> default.
///
/// The default is `<home>/.ssh-bridge`; when the home directory cannot be
/// determined the current directory is used as a last resort.
pub fn resolve_config_dir(dir_param: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = dir_param {
        return dir;
    }

    if let Ok(env_dir) = env::var(CONFIG_DIR_ENV_VAR)
        && !env_dir.is_empty()
    {
        return PathBuf::from(env_dir);
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_DIR_NAME)
}

/// Well-known file locations inside the configuration directory.
///
/// The directory holds three files: `lock` (pidfile and advisory lock
/// target), `sock` (the Unix domain stream endpoint) and `log` (append-only
/// stdout+stderr of the daemon).
#[derive(Debug, Clone)]
pub struct BridgeDirs {
    root: PathBuf,
}

impl BridgeDirs {
    /// Create a view over an explicit configuration directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a view over the resolved default configuration directory.
    pub fn resolve() -> Self {
        Self::new(resolve_config_dir(None))
    }

    /// The configuration directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the single-instance lock file (also the pidfile).
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Path of the Unix domain socket endpoint.
    pub fn socket_file(&self) -> PathBuf {
        self.root.join("sock")
    }

    /// Path of the daemon log file.
    pub fn log_file(&self) -> PathBuf {
        self.root.join("log")
    }

    /// Whether the configuration directory exists.
    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the configuration directory with mode `0700` if it is missing.
    ///
    /// Permissions of an existing directory are left untouched.
    pub fn ensure(&self) -> std::io::Result<()> {
        if self.root.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod config_dir {
        use super::*;

        #[test]
        fn test_parameter_takes_priority() {
            let dir = resolve_config_dir(Some(PathBuf::from("/tmp/explicit")));
            assert_eq!(dir, PathBuf::from("/tmp/explicit"));
        }

        #[test]
        fn test_default_ends_with_dot_ssh_bridge() {
            // Only meaningful when the env var is unset in the test environment.
            if env::var(CONFIG_DIR_ENV_VAR).is_err() {
                let dir = resolve_config_dir(None);
                assert!(dir.ends_with(".ssh-bridge"));
            }
        }
    }

    mod dirs_layout {
        use super::*;

        #[test]
        fn test_file_names() {
            let dirs = BridgeDirs::new("/tmp/bridge");
            assert_eq!(dirs.lock_file(), PathBuf::from("/tmp/bridge/lock"));
            assert_eq!(dirs.socket_file(), PathBuf::from("/tmp/bridge/sock"));
            assert_eq!(dirs.log_file(), PathBuf::from("/tmp/bridge/log"));
        }

        #[test]
        fn test_ensure_creates_directory_with_private_mode() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let dirs = BridgeDirs::new(tmp.path().join("cfg"));
            assert!(!dirs.exists());

            dirs.ensure().expect("create config dir");
            assert!(dirs.exists());

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = std::fs::metadata(dirs.root())
                    .expect("metadata")
                    .permissions()
                    .mode();
                assert_eq!(mode & 0o777, 0o700);
            }
        }

        #[test]
        fn test_ensure_leaves_existing_permissions_alone() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let dirs = BridgeDirs::new(tmp.path().join("cfg"));
            dirs.ensure().expect("create config dir");

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dirs.root(), std::fs::Permissions::from_mode(0o750))
                    .expect("chmod");
                dirs.ensure().expect("second ensure");
                let mode = std::fs::metadata(dirs.root())
                    .expect("metadata")
                    .permissions()
                    .mode();
                assert_eq!(mode & 0o777, 0o750);
            }
        }
    }

    mod timeouts {
        use super::*;

        #[test]
        fn test_ready_timeout_parameter_priority() {
            assert_eq!(resolve_ready_timeout(Some(3)), Duration::from_secs(3));
        }

        #[test]
        fn test_idle_ttl_parameter_priority() {
            assert_eq!(resolve_idle_ttl(Some(60)), Duration::from_secs(60));
        }

        #[test]
        fn test_default_idle_ttl_is_twelve_hours() {
            assert_eq!(DEFAULT_IDLE_TTL_SECS, 43_200);
        }

        #[test]
        fn test_share_ttl_is_five_seconds() {
            assert_eq!(SHARE_TTL, Duration::from_secs(5));
        }

        #[test]
        fn test_daemon_wait_bounds() {
            assert_eq!(DAEMON_WAIT, Duration::from_secs(2));
            assert_eq!(DAEMON_POLL_INTERVAL, Duration::from_millis(10));
        }
    }
}
