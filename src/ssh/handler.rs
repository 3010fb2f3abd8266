//! russh client handler and the state it shares with the owning session.
//!
//! The handler verifies (or records) the host key fingerprint, captures the
//! authentication banner and reports post-ready disconnects through the
//! session's current observer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use russh::client;
use russh::keys::{HashAlg, PublicKey};

use crate::error::REASON_CONNECTION_LOST;

use super::observer::{SessionEvent, SessionObserver};

/// Base64 of the SHA-256 digest of the host key.
///
/// This is the one canonical fingerprint form used on both sides of the
/// protocol; caller-supplied expectations must be in the same form.
/// Rendered without padding, the OpenSSH convention.
pub fn host_key_fingerprint(key: &PublicKey) -> String {
    let rendered = key.fingerprint(HashAlg::Sha256).to_string();
    match rendered.strip_prefix("SHA256:") {
        Some(stripped) => stripped.to_string(),
        None => rendered,
    }
}

/// Fingerprints compare ignoring base64 padding, so callers that render
/// the digest with trailing `=` still match.
fn fingerprints_match(a: &str, b: &str) -> bool {
    a.trim_end_matches('=') == b.trim_end_matches('=')
}

/// State shared between the russh handler, the channel pump tasks and the
/// owning [`SshSession`](super::session::SshSession).
pub(crate) struct SessionShared {
    observer: Mutex<SessionObserver>,
    banner: Mutex<Option<String>>,
    observed_fingerprint: Mutex<Option<String>>,
    /// (expected, received), set when the host presented an unexpected key.
    mismatch: Mutex<Option<(String, String)>>,
    /// Set once the session reached Ready; gates disconnect reporting.
    ready: AtomicBool,
}

impl SessionShared {
    pub(crate) fn new(observer: SessionObserver) -> Arc<Self> {
        Arc::new(Self {
            observer: Mutex::new(observer),
            banner: Mutex::new(None),
            observed_fingerprint: Mutex::new(None),
            mismatch: Mutex::new(None),
            ready: AtomicBool::new(false),
        })
    }

    pub(crate) fn notify(&self, event: SessionEvent) {
        self.observer.lock().notify(event);
    }

    pub(crate) fn swap_observer(&self, observer: SessionObserver) {
        *self.observer.lock() = observer;
    }

    pub(crate) fn banner(&self) -> Option<String> {
        self.banner.lock().clone()
    }

    pub(crate) fn observed_fingerprint(&self) -> Option<String> {
        self.observed_fingerprint.lock().clone()
    }

    pub(crate) fn take_mismatch(&self) -> Option<(String, String)> {
        self.mismatch.lock().take()
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// russh client handler backing every brokered session.
pub(crate) struct BridgeHandler {
    shared: Arc<SessionShared>,
    /// Caller-supplied fingerprint to verify against, if any.
    expected_fingerprint: Option<String>,
}

impl BridgeHandler {
    pub(crate) fn new(shared: Arc<SessionShared>, expected_fingerprint: Option<String>) -> Self {
        Self {
            shared,
            expected_fingerprint,
        }
    }
}

impl client::Handler for BridgeHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let observed = host_key_fingerprint(server_public_key);
        *self.shared.observed_fingerprint.lock() = Some(observed.clone());

        match &self.expected_fingerprint {
            Some(expected) if !fingerprints_match(expected, &observed) => {
                *self.shared.mismatch.lock() = Some((expected.clone(), observed));
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let mut text = banner.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        *self.shared.banner.lock() = Some(text);
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: client::DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        if self.shared.is_ready() {
            self.shared.notify(SessionEvent::Disconnected {
                reason: REASON_CONNECTION_LOST.to_string(),
            });
        }
        match reason {
            client::DisconnectReason::ReceivedDisconnect(_) => Ok(()),
            client::DisconnectReason::Error(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_comparison_ignores_padding() {
        assert!(fingerprints_match("abc123", "abc123="));
        assert!(fingerprints_match("abc123==", "abc123"));
        assert!(!fingerprints_match("abc123", "abc124"));
    }

    #[test]
    fn test_shared_starts_not_ready_and_empty() {
        let (observer, _rx) = SessionObserver::channel();
        let shared = SessionShared::new(observer);
        assert!(!shared.is_ready());
        assert!(shared.banner().is_none());
        assert!(shared.observed_fingerprint().is_none());
        assert!(shared.take_mismatch().is_none());
    }

    #[test]
    fn test_swap_observer_redirects_events() {
        let (first, mut first_rx) = SessionObserver::channel();
        let (second, mut second_rx) = SessionObserver::channel();
        let shared = SessionShared::new(first);

        shared.swap_observer(second);
        shared.notify(SessionEvent::Unconnected {
            reason: "x".to_string(),
        });

        assert!(first_rx.try_recv().is_err());
        assert!(matches!(
            second_rx.try_recv(),
            Ok(SessionEvent::Unconnected { .. })
        ));
    }
}
