//! Observer capability through which the SSH adapter reports events.
//!
//! Every consumer of a session (a client handler, or the pool's retention
//! watcher) installs a [`SessionObserver`]; the adapter calls `notify` in a
//! fixed order per operation. Events carry wire-shaped payloads so the
//! daemon side can forward them as frames without reshaping.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::request::{ChallengePayload, ResultPayload};

/// An event produced by an SSH session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A keyboard-interactive challenge needs answers.
    Challenge(ChallengePayload),
    /// The connection is established and authenticated.
    Connected {
        fingerprint: String,
        banner: Option<String>,
    },
    /// The connection attempt failed before becoming ready.
    Unconnected { reason: String },
    /// The established connection dropped.
    Disconnected { reason: String },
    /// Command output bytes.
    Stdout(Bytes),
    /// Command error-stream bytes.
    Stderr(Bytes),
    /// Command completion (or channel failure via the `error` field).
    Result(ResultPayload),
}

/// Sending half of a session event stream.
///
/// Cheap to clone; dropping the receiving end makes `notify` a no-op, which
/// is exactly what a consumer that lost interest wants.
#[derive(Debug, Clone)]
pub struct SessionObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionObserver {
    /// Create an observer together with the receiver its events land on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Delivery failures (receiver gone) are ignored.
    pub fn notify(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (observer, mut rx) = SessionObserver::channel();
        observer.notify(SessionEvent::Stdout(Bytes::from_static(b"a")));
        observer.notify(SessionEvent::Stderr(Bytes::from_static(b"b")));
        observer.notify(SessionEvent::Result(ResultPayload::default()));

        assert!(matches!(rx.recv().await, Some(SessionEvent::Stdout(_))));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Stderr(_))));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Result(_))));
    }

    #[tokio::test]
    async fn test_notify_after_receiver_dropped_is_silent() {
        let (observer, rx) = SessionObserver::channel();
        drop(rx);
        observer.notify(SessionEvent::Unconnected {
            reason: "nobody listening".to_string(),
        });
    }
}
