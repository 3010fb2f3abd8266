//! Per-client protocol handler.
//!
//! One handler runs per accepted connection, driving a state machine over
//! the frame stream and the owned session's events:
//!
//! ```text
//! Initial --REUSE/CONNECT--> Connecting --Connected--> Ready
//!    ^                            |                     |  ^
//!    +--------Unconnected---------+         command     |  | Result
//!    ^                                                  v  |
//!    +-------------SHARE------------- Ready        Executing
//! ```
//!
//! Frames that are illegal in the current state produce an `EXCEPTION`
//! frame and a terminal Errored state; `STDIN` outside Executing and a late
//! `CHALLENGE_RESPONSE` in Ready are the two deliberate exceptions and are
//! dropped silently. `RESIZE` is accepted in every live state.

use std::mem;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::{Frame, FrameCodec, FrameType};
use crate::pool::{ConnectionPool, ReuseMode};
use crate::request::{
    self, ReasonPayload, SharedPayload, WindowSize,
};
use crate::ssh::observer::{SessionEvent, SessionObserver};
use crate::ssh::session::SshSession;

/// Loop control for the handler's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

enum HandlerState {
    Initial,
    Connecting,
    Ready(SshSession),
    Executing(SshSession),
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateKind {
    Initial,
    Connecting,
    Ready,
    Executing,
    Errored,
}

impl HandlerState {
    fn kind(&self) -> StateKind {
        match self {
            HandlerState::Initial => StateKind::Initial,
            HandlerState::Connecting => StateKind::Connecting,
            HandlerState::Ready(_) => StateKind::Ready,
            HandlerState::Executing(_) => StateKind::Executing,
            HandlerState::Errored => StateKind::Errored,
        }
    }

    fn name(&self) -> &'static str {
        match self.kind() {
            StateKind::Initial => "initial",
            StateKind::Connecting => "connecting",
            StateKind::Ready => "ready",
            StateKind::Executing => "executing",
            StateKind::Errored => "errored",
        }
    }
}

/// Serve one accepted client connection until it closes.
pub async fn serve_client<S>(
    stream: S,
    pool: Arc<ConnectionPool<SshSession>>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (observer, events) = SessionObserver::channel();
    let handler = ClientHandler {
        framed: Framed::new(stream, FrameCodec),
        pool,
        shutdown,
        window: WindowSize::default(),
        observer,
        events,
        challenge_tx: None,
        connect_task: None,
        pending_session: None,
        state: HandlerState::Initial,
        draining: false,
    };
    handler.run().await;
}

struct ClientHandler<S> {
    framed: Framed<S, FrameCodec>,
    pool: Arc<ConnectionPool<SshSession>>,
    shutdown: CancellationToken,
    window: WindowSize,
    observer: SessionObserver,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Feeds CHALLENGE_RESPONSE payloads into the in-flight connect.
    challenge_tx: Option<mpsc::UnboundedSender<Vec<String>>>,
    /// In-flight connect, producing the session behind a Connected event.
    connect_task: Option<JoinHandle<Option<SshSession>>>,
    /// Session taken synchronously from the pool, awaiting its Connected
    /// event before attaching.
    pending_session: Option<SshSession>,
    state: HandlerState,
    draining: bool,
}

impl<S> ClientHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled(), if !self.draining => {
                    self.draining = true;
                    if !matches!(self.state, HandlerState::Executing(_)) {
                        break;
                    }
                }
                event = self.events.recv() => {
                    // We hold a sender clone, so the channel cannot close.
                    let Some(event) = event else { break };
                    if self.handle_event(event).await == Step::Stop {
                        break;
                    }
                }
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => {
                        if self.handle_frame(frame).await == Step::Stop {
                            break;
                        }
                        if self.draining && !matches!(self.state, HandlerState::Executing(_)) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        self.report_exception(format!("framing error: {}", e)).await;
                        break;
                    }
                    None => break,
                },
            }
        }
        self.teardown().await;
    }

    async fn handle_frame(&mut self, frame: Frame) -> Step {
        // STDIN and RESIZE have state-independent handling.
        match frame.frame_type {
            FrameType::Stdin => return self.on_stdin(frame),
            FrameType::Resize => return self.on_resize(&frame.payload).await,
            _ => {}
        }

        match (self.state.kind(), frame.frame_type) {
            (StateKind::Initial, FrameType::Reuse) => self.on_reuse(&frame.payload).await,
            (StateKind::Initial, FrameType::Connect) => self.on_connect(&frame.payload).await,
            (StateKind::Connecting, FrameType::ChallengeResponse) => {
                self.on_challenge_response(&frame.payload).await
            }
            // A late response after authentication already succeeded.
            (StateKind::Ready, FrameType::ChallengeResponse) => Step::Continue,
            (StateKind::Ready, FrameType::SimpleCommand) => {
                self.on_command(&frame.payload, false).await
            }
            (StateKind::Ready, FrameType::PtyCommand) => {
                self.on_command(&frame.payload, true).await
            }
            (StateKind::Ready, FrameType::Share) => self.on_share().await,
            (_, frame_type) => {
                let reason = format!(
                    "unexpected {:?} frame in {} state",
                    frame_type,
                    self.state.name()
                );
                self.report_exception(reason).await
            }
        }
    }

    fn on_stdin(&mut self, frame: Frame) -> Step {
        // The caller cannot know exactly when a command ends, so stdin for
        // a command that is already gone is dropped without complaint.
        if let HandlerState::Executing(session) = &mut self.state {
            if frame.payload.is_empty() {
                session.end_stdin();
            } else {
                session.write_stdin(frame.payload);
            }
        }
        Step::Continue
    }

    async fn on_resize(&mut self, payload: &[u8]) -> Step {
        let resize = match request::parse_resize(payload) {
            Ok(resize) => resize,
            Err(e) => return self.report_exception(e).await,
        };
        self.window.apply(resize);
        match &mut self.state {
            HandlerState::Ready(session) | HandlerState::Executing(session) => {
                session.resize(resize);
            }
            _ => {}
        }
        Step::Continue
    }

    async fn on_reuse(&mut self, payload: &[u8]) -> Step {
        let request = match request::parse_reuse(payload) {
            Ok(request) => request,
            Err(e) => return self.report_exception(e).await,
        };
        debug!(key = %request.key, "client requests reuse");

        self.state = HandlerState::Connecting;
        if let Some(mut session) = self.pool.reuse(&request, &self.observer) {
            session.set_window(self.window);
            self.pending_session = Some(session);
        }
        Step::Continue
    }

    async fn on_connect(&mut self, payload: &[u8]) -> Step {
        let request = match request::parse_connect(payload) {
            Ok(request) => request,
            Err(e) => return self.report_exception(e).await,
        };
        debug!(key = %request.key, reusable = request.reusable, "client requests connect");

        let (challenge_tx, challenge_rx) = mpsc::unbounded_channel();
        self.challenge_tx = Some(challenge_tx);

        let pool = self.pool.clone();
        let observer = self.observer.clone();
        let window = self.window;
        self.connect_task = Some(tokio::spawn(async move {
            pool.connect(&request, window, &observer, challenge_rx).await
        }));
        self.state = HandlerState::Connecting;
        Step::Continue
    }

    async fn on_challenge_response(&mut self, payload: &[u8]) -> Step {
        let responses = match request::parse_challenge_response(payload) {
            Ok(responses) => responses,
            Err(e) => return self.report_exception(e).await,
        };
        if let Some(tx) = &self.challenge_tx {
            let _ = tx.send(responses);
        }
        Step::Continue
    }

    async fn on_command(&mut self, payload: &[u8], pty: bool) -> Step {
        let command = match request::parse_command(payload) {
            Ok(command) => command,
            Err(e) => return self.report_exception(e).await,
        };

        let HandlerState::Ready(mut session) =
            mem::replace(&mut self.state, HandlerState::Errored)
        else {
            return self
                .report_exception("internal error: command outside ready state".to_string())
                .await;
        };
        session.exec(&command, pty).await;
        self.state = HandlerState::Executing(session);
        Step::Continue
    }

    async fn on_share(&mut self) -> Step {
        let HandlerState::Ready(session) = mem::replace(&mut self.state, HandlerState::Initial)
        else {
            return self
                .report_exception("internal error: share outside ready state".to_string())
                .await;
        };
        match self.pool.relinquish(session, ReuseMode::Share).await {
            Some(share_key) => {
                self.send_json(FrameType::Shared, &SharedPayload { share_key })
                    .await
            }
            None => {
                self.report_exception("internal error: share produced no key".to_string())
                    .await
            }
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) -> Step {
        match event {
            SessionEvent::Challenge(challenge)
                if matches!(self.state, HandlerState::Connecting) =>
            {
                self.send_json(FrameType::Challenge, &challenge).await
            }
            SessionEvent::Connected { .. } if matches!(self.state, HandlerState::Connecting) => {
                self.on_session_connected().await
            }
            SessionEvent::Unconnected { reason }
                if matches!(self.state, HandlerState::Connecting) =>
            {
                self.connect_task = None;
                self.challenge_tx = None;
                self.state = HandlerState::Initial;
                self.send_json(FrameType::Unconnected, &ReasonPayload { reason })
                    .await
            }
            SessionEvent::Disconnected { reason }
                if matches!(
                    self.state,
                    HandlerState::Ready(_) | HandlerState::Executing(_)
                ) =>
            {
                match mem::replace(&mut self.state, HandlerState::Errored) {
                    HandlerState::Ready(session) | HandlerState::Executing(session) => {
                        // Already dead on the wire; close in the background.
                        tokio::spawn(session.close());
                    }
                    _ => {}
                }
                let _ = self
                    .send_json(FrameType::Disconnected, &ReasonPayload { reason })
                    .await;
                Step::Stop
            }
            SessionEvent::Stdout(data) if matches!(self.state, HandlerState::Executing(_)) => {
                self.send_frame(Frame::new(FrameType::Stdout, data)).await
            }
            SessionEvent::Stderr(data) if matches!(self.state, HandlerState::Executing(_)) => {
                self.send_frame(Frame::new(FrameType::Stderr, data)).await
            }
            SessionEvent::Result(result)
                if matches!(self.state, HandlerState::Executing(_)) =>
            {
                let HandlerState::Executing(mut session) =
                    mem::replace(&mut self.state, HandlerState::Errored)
                else {
                    unreachable!("guarded by the match arm");
                };
                if result.error.is_some() {
                    // A failed channel taints the whole session.
                    session.set_reusable(false);
                }
                session.finish_command();
                self.state = HandlerState::Ready(session);

                let step = self.send_json(FrameType::Result, &result).await;
                if self.draining { Step::Stop } else { step }
            }
            other => {
                let reason = format!(
                    "internal error: unexpected {} event in {} state",
                    event_name(&other),
                    self.state.name()
                );
                self.report_exception(reason).await
            }
        }
    }

    async fn on_session_connected(&mut self) -> Step {
        let session = if let Some(session) = self.pending_session.take() {
            Some(session)
        } else if let Some(task) = self.connect_task.take() {
            task.await.ok().flatten()
        } else {
            None
        };

        let Some(mut session) = session else {
            return self
                .report_exception("internal error: connected without a session".to_string())
                .await;
        };
        session.set_window(self.window);
        self.challenge_tx = None;
        let payload = session.connected_payload();
        self.state = HandlerState::Ready(session);
        self.send_json(FrameType::Connected, &payload).await
    }

    /// Report a protocol violation and become terminally Errored.
    async fn report_exception(&mut self, reason: String) -> Step {
        warn!(reason = %reason, "client protocol violation");
        let _ = self
            .send_json(FrameType::Exception, &ReasonPayload { reason })
            .await;
        self.state = HandlerState::Errored;
        Step::Stop
    }

    async fn send_json<T: Serialize>(&mut self, frame_type: FrameType, payload: &T) -> Step {
        match Frame::json(frame_type, payload) {
            Ok(frame) => self.send_frame(frame).await,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound frame");
                Step::Stop
            }
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> Step {
        match self.framed.send(frame).await {
            Ok(()) => Step::Continue,
            Err(_) => Step::Stop,
        }
    }

    async fn teardown(mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
            if let Ok(Some(session)) = task.await {
                session.close().await;
            }
        }
        if let Some(session) = self.pending_session.take() {
            session.close().await;
        }
        match mem::replace(&mut self.state, HandlerState::Errored) {
            HandlerState::Ready(session) => {
                self.pool.relinquish(session, ReuseMode::Keep).await;
            }
            HandlerState::Executing(session) => {
                self.pool.relinquish(session, ReuseMode::Drop).await;
            }
            _ => {}
        }
        let _ = self.framed.close().await;
    }
}

fn event_name(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::Challenge(_) => "challenge",
        SessionEvent::Connected { .. } => "connected",
        SessionEvent::Unconnected { .. } => "unconnected",
        SessionEvent::Disconnected { .. } => "disconnected",
        SessionEvent::Stdout(_) => "stdout",
        SessionEvent::Stderr(_) => "stderr",
        SessionEvent::Result(_) => "result",
    }
}
