//! SSH adapter: everything that touches the russh library directly.
//!
//! Submodules:
//!
//! - `observer`: the event capability sessions report through
//! - `handler`: russh client handler and shared session state
//! - `auth`: authentication strategies (Strategy pattern)
//! - `session`: the owning session handle and its channel pump
//!
//! The entry point is [`establish`], which turns a validated connect
//! request into an authenticated [`SshSession`] or a classified
//! [`SshFailure`], reporting `Connected`/`Unconnected`/`Challenge` events
//! through the supplied observer along the way.

pub(crate) mod auth;
pub(crate) mod handler;
pub mod observer;
pub mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use russh::client;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{KEEPALIVE_INTERVAL, KEEPALIVE_MAX, resolve_ready_timeout};
use crate::error::{SshErrorKind, SshFailure};
use crate::request::{CacheKey, Credentials, WindowSize};

use auth::{AuthChain, KeyAuth, KeyboardInteractiveAuth, PasswordAuth};
use handler::{BridgeHandler, SessionShared};
use observer::{SessionEvent, SessionObserver};
use session::SshSession;

pub(crate) use auth::parse_private_key;
pub use handler::host_key_fingerprint;

/// Outcome of a successful [`establish`] call.
pub struct Established {
    pub session: SshSession,
    /// Whether the server issued a keyboard-interactive challenge; the pool
    /// refuses to cache credentials of challenged connects.
    pub challenged: bool,
}

/// Build the russh client configuration for brokered sessions.
///
/// Sessions have no inactivity timeout; their lifetime is governed by the
/// pool's retention timers. Keepalives detect dead peers instead.
fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    })
}

/// Classify a russh error into the failure taxonomy.
pub(crate) fn classify_ssh_error(error: russh::Error) -> SshFailure {
    match error {
        russh::Error::IO(e) => SshFailure::new(SshErrorKind::Socket, e.to_string()),
        other => SshFailure::new(SshErrorKind::Handshake, other.to_string()),
    }
}

/// Establish and authenticate an outbound SSH connection.
///
/// Reports `Connected` on success and `Unconnected` with the classified
/// reason on failure; keyboard-interactive challenges are reported as
/// `Challenge` events and answered through `challenges`.
pub async fn establish(
    key: &CacheKey,
    expected_fingerprint: Option<&str>,
    credentials: &Credentials,
    reusable: bool,
    window: WindowSize,
    observer: &SessionObserver,
    challenges: mpsc::UnboundedReceiver<Vec<String>>,
) -> Result<Established, SshFailure> {
    match try_establish(
        key,
        expected_fingerprint,
        credentials,
        reusable,
        window,
        observer,
        challenges,
    )
    .await
    {
        Ok(established) => {
            info!(key = %key, fingerprint = %established.session.fingerprint(), "ssh session established");
            observer.notify(SessionEvent::Connected {
                fingerprint: established.session.fingerprint().to_string(),
                banner: established.session.banner().map(str::to_string),
            });
            Ok(established)
        }
        Err(failure) => {
            debug!(key = %key, reason = %failure.reason(), "ssh connect failed");
            observer.notify(SessionEvent::Unconnected {
                reason: failure.reason(),
            });
            Err(failure)
        }
    }
}

async fn try_establish(
    key: &CacheKey,
    expected_fingerprint: Option<&str>,
    credentials: &Credentials,
    reusable: bool,
    window: WindowSize,
    observer: &SessionObserver,
    challenges: mpsc::UnboundedReceiver<Vec<String>>,
) -> Result<Established, SshFailure> {
    let ready_timeout = resolve_ready_timeout(None);

    let addr = resolve_addr(&key.hostname, key.port).await?;

    let stream = tokio::time::timeout(ready_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SshFailure::timeout())?
        .map_err(|e| SshFailure::new(SshErrorKind::Socket, e.to_string()))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let shared = SessionShared::new(observer.clone());
    let handler = BridgeHandler::new(shared.clone(), expected_fingerprint.map(str::to_string));

    let connect = client::connect_stream(build_client_config(), stream, handler);
    let mut handle = match tokio::time::timeout(ready_timeout, connect).await {
        Err(_) => return Err(SshFailure::timeout()),
        Ok(Err(e)) => {
            return Err(match shared.take_mismatch() {
                Some((expected, received)) => SshFailure::fingerprint_mismatch(expected, received),
                None => classify_ssh_error(e),
            });
        }
        Ok(Ok(handle)) => handle,
    };

    let challenged = Arc::new(AtomicBool::new(false));
    let mut chain = AuthChain::new();
    if let Some(material) = &credentials.private_key {
        match parse_private_key(material, credentials.passphrase.as_deref()) {
            Ok(parsed) => chain.push(KeyAuth::new(parsed)),
            // The pool pre-flights key parsing; reaching this means there
            // was no fallback credential, so let the empty chain reject.
            Err(e) => debug!(error = %e, "skipping unparseable private key"),
        }
    }
    if let Some(password) = &credentials.password {
        chain.push(PasswordAuth::new(password));
    }
    if credentials.try_keyboard {
        chain.push(KeyboardInteractiveAuth::new(
            observer.clone(),
            challenges,
            challenged.clone(),
        ));
    }

    chain.authenticate(&mut handle, &key.username).await?;

    let fingerprint = shared
        .observed_fingerprint()
        .ok_or_else(|| SshFailure::new(SshErrorKind::Other, "host key was never observed"))?;
    let banner = shared.banner();

    shared.mark_ready();
    let session = SshSession::new(
        key.clone(),
        fingerprint,
        banner,
        reusable,
        window,
        handle,
        shared,
    );

    Ok(Established {
        session,
        challenged: challenged.load(Ordering::SeqCst),
    })
}

async fn resolve_addr(hostname: &str, port: u16) -> Result<std::net::SocketAddr, SshFailure> {
    let mut addrs = tokio::net::lookup_host((hostname, port))
        .await
        .map_err(|e| SshFailure::new(SshErrorKind::Dns, e.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| SshFailure::new(SshErrorKind::Dns, format!("no addresses for {}", hostname)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_addr_reports_dns_failures() {
        let failure = resolve_addr("host.invalid.", 22).await.expect_err("dns");
        assert_eq!(failure.kind, SshErrorKind::Dns);
        assert!(failure.reason().starts_with("DNS lookup failed"));
    }

    #[tokio::test]
    async fn test_resolve_addr_accepts_literal_addresses() {
        let addr = resolve_addr("127.0.0.1", 2222).await.expect("literal");
        assert_eq!(addr.port(), 2222);
    }

    #[test]
    fn test_client_config_keepalive() {
        let config = build_client_config();
        assert_eq!(config.keepalive_interval, Some(KEEPALIVE_INTERVAL));
        assert_eq!(config.keepalive_max, KEEPALIVE_MAX);
        assert_eq!(config.inactivity_timeout, None);
    }
}
