//! Caller-side client state machine.
//!
//! A [`BridgeClient`] speaks the frame protocol to the daemon over any
//! local stream. All protocol state lives in a driver task that owns the
//! framed stream; the public methods are thin command senders with oneshot
//! resolvers, so there is at most one pending operation and every state
//! transition is serialized with frame arrival.
//!
//! # Terminal errors
//!
//! A terminal failure (daemon gone, SSH dropped, protocol violation, ...)
//! resolves the in-flight operation when one exists. Otherwise it is
//! stashed and raised by the next method call exactly once; calls after
//! that get a generic "client is closed" error carrying the original as
//! its cause. This removes the race between "error arrives" and "caller
//! issues next call".

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::config::BridgeDirs;
use crate::error::{ClientError, ErrorKind};
use crate::frame::{Frame, FrameCodec, FrameType};
use crate::request::{
    ChallengePayload, ChallengeResponseParams, ConnectParams, ConnectedPayload, ReasonPayload,
    ResizeParams, ResultPayload, ReuseParams, SharedPayload, WindowSize,
};

/// Outcome of a `connect` or `reuse` call.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub success: bool,
    pub fingerprint: Option<String>,
    pub banner: Option<String>,
    /// Present when `success` is false.
    pub reason: Option<String>,
}

/// Completion of a command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<u32>,
    pub signal: Option<String>,
}

/// Caller-supplied responder for keyboard-interactive challenges.
///
/// A handler that fails poisons the connect attempt with a
/// `CHALLENGE_ERROR`; answers arriving after the attempt was superseded
/// are discarded.
#[async_trait]
pub trait ChallengeHandler: Send + Sync + 'static {
    async fn handle(&self, challenge: ChallengePayload) -> Result<Vec<String>, String>;
}

/// Stream handles for one command execution.
#[derive(Debug)]
pub struct ExecStreams {
    pub stdin: ExecStdin,
    pub stdout: mpsc::UnboundedReceiver<Bytes>,
    pub stderr: mpsc::UnboundedReceiver<Bytes>,
    /// Resolves with the exit status, or the terminal error that destroyed
    /// the execution.
    pub result: oneshot::Receiver<Result<ExitStatus, ClientError>>,
}

/// Writable stdin handle of a running command.
#[derive(Clone, Debug)]
pub struct ExecStdin {
    ops: mpsc::UnboundedSender<Op>,
}

impl ExecStdin {
    /// Write bytes to the remote command's stdin. Empty writes are no-ops
    /// (an empty STDIN frame means EOF on the wire).
    pub fn write(&self, data: impl Into<Bytes>) {
        let data = data.into();
        if !data.is_empty() {
            let _ = self.ops.send(Op::StdinData(data));
        }
    }

    /// Signal EOF on the remote command's stdin.
    pub fn finish(&self) {
        let _ = self.ops.send(Op::StdinEof);
    }
}

/// Client handle over a connected daemon stream.
pub struct BridgeClient {
    ops: mpsc::UnboundedSender<Op>,
    closed: Arc<AtomicBool>,
}

impl BridgeClient {
    /// Wrap an already-connected stream to the daemon.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let driver = Driver {
            framed: Framed::new(stream, FrameCodec),
            ops: ops_rx,
            ops_tx: ops_tx.clone(),
            state: ClientState::Initial,
            window: WindowSize::default(),
            attempt: 0,
            challenge_handler: None,
            pending: None,
            exec: None,
            terminal: None,
            closed: closed.clone(),
        };
        tokio::spawn(driver.run());
        Self {
            ops: ops_tx,
            closed,
        }
    }

    /// Connect to a running daemon's endpoint.
    pub async fn connect_daemon(dirs: &BridgeDirs) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(dirs.socket_file())
            .await
            .map_err(|e| {
                ClientError::new(ErrorKind::NoDaemon, format!("daemon is not reachable: {}", e))
            })?;
        Ok(Self::new(stream))
    }

    /// Establish a new SSH session. Only valid in the initial state.
    pub async fn connect(
        &self,
        params: ConnectParams,
        challenge_handler: Option<Arc<dyn ChallengeHandler>>,
    ) -> Result<ConnectOutcome, ClientError> {
        self.call(|resolve| Op::Connect {
            params,
            challenge_handler,
            resolve,
        })
        .await
    }

    /// Take over a pooled SSH session. Only valid in the initial state.
    pub async fn reuse(&self, params: ReuseParams) -> Result<ConnectOutcome, ClientError> {
        self.call(|resolve| Op::Reuse { params, resolve }).await
    }

    /// Run a command on the session. Only valid in the ready state.
    pub async fn exec(&self, command: &str, pty: bool) -> Result<ExecStreams, ClientError> {
        self.call(|resolve| Op::Exec {
            command: command.to_string(),
            pty,
            resolve,
        })
        .await
    }

    /// Park the session for transient pickup and return its share key.
    /// Only valid in the ready state; the client returns to initial.
    pub async fn share(&self) -> Result<String, ClientError> {
        self.call(|resolve| Op::Share { resolve }).await
    }

    /// Update the terminal window size. Valid in any live state.
    pub async fn resize(&self, rows: i64, cols: i64) -> Result<(), ClientError> {
        self.call(|resolve| Op::Resize {
            rows,
            cols,
            resolve,
        })
        .await
    }

    /// Close the client. Cancels the pending operation, if any, with a
    /// `CLOSED` error and resolves once the stream is shut down. Never
    /// fails.
    pub async fn close(&self) {
        let (resolve, done) = oneshot::channel();
        if self.ops.send(Op::Close { resolve }).is_ok() {
            let _ = done.await;
        }
    }

    /// Whether the client is terminally errored or closed.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ClientError>>) -> Op,
    ) -> Result<T, ClientError> {
        let (resolve, response) = oneshot::channel();
        self.ops
            .send(build(resolve))
            .map_err(|_| ClientError::closed())?;
        response.await.map_err(|_| ClientError::closed())?
    }
}

enum Op {
    Connect {
        params: ConnectParams,
        challenge_handler: Option<Arc<dyn ChallengeHandler>>,
        resolve: oneshot::Sender<Result<ConnectOutcome, ClientError>>,
    },
    Reuse {
        params: ReuseParams,
        resolve: oneshot::Sender<Result<ConnectOutcome, ClientError>>,
    },
    Exec {
        command: String,
        pty: bool,
        resolve: oneshot::Sender<Result<ExecStreams, ClientError>>,
    },
    Share {
        resolve: oneshot::Sender<Result<String, ClientError>>,
    },
    Resize {
        rows: i64,
        cols: i64,
        resolve: oneshot::Sender<Result<(), ClientError>>,
    },
    Close {
        resolve: oneshot::Sender<()>,
    },
    StdinData(Bytes),
    StdinEof,
    ChallengeAnswered {
        attempt: u64,
        answers: Result<Vec<String>, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Initial,
    Connecting,
    Ready,
    Executing,
    Errored,
}

enum Pending {
    Connect(oneshot::Sender<Result<ConnectOutcome, ClientError>>),
    Share(oneshot::Sender<Result<String, ClientError>>),
}

struct ExecWires {
    stdout: mpsc::UnboundedSender<Bytes>,
    stderr: mpsc::UnboundedSender<Bytes>,
    result: Option<oneshot::Sender<Result<ExitStatus, ClientError>>>,
}

struct Terminal {
    error: ClientError,
    delivered: bool,
}

struct Driver<S> {
    framed: Framed<S, FrameCodec>,
    ops: mpsc::UnboundedReceiver<Op>,
    ops_tx: mpsc::UnboundedSender<Op>,
    state: ClientState,
    window: WindowSize,
    /// Connect attempt counter; responses from stale challenge handler
    /// invocations are discarded by comparing against it.
    attempt: u64,
    challenge_handler: Option<Arc<dyn ChallengeHandler>>,
    pending: Option<Pending>,
    exec: Option<ExecWires>,
    terminal: Option<Terminal>,
    closed: Arc<AtomicBool>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                op = self.ops.recv() => match op {
                    Some(op) => {
                        if self.handle_op(op).await {
                            break;
                        }
                    }
                    // The client handle was dropped; shut the stream down.
                    None => {
                        let _ = self.framed.close().await;
                        break;
                    }
                },
                frame = self.framed.next(), if self.state != ClientState::Errored => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame).await,
                    Some(Err(e)) => self.fatal(ClientError::new(
                        ErrorKind::ProtocolError,
                        format!("framing error: {}", e),
                    )),
                    None => self.fatal(ClientError::no_daemon()),
                },
            }
        }
    }

    /// Handle one caller operation. Returns true when the driver must stop.
    async fn handle_op(&mut self, op: Op) -> bool {
        if self.state == ClientState::Errored {
            return self.refuse_op(op).await;
        }

        match op {
            Op::Connect {
                params,
                challenge_handler,
                resolve,
            } => {
                if self.state != ClientState::Initial {
                    let _ = resolve.send(Err(misuse("connect", self.state)));
                    return false;
                }
                self.attempt += 1;
                self.challenge_handler = challenge_handler;
                match self.send_json(FrameType::Connect, &params).await {
                    Ok(()) => {
                        self.pending = Some(Pending::Connect(resolve));
                        self.state = ClientState::Connecting;
                    }
                    Err(error) => {
                        let _ = resolve.send(Err(error.clone()));
                        self.fatal_delivered(error);
                    }
                }
                false
            }
            Op::Reuse { params, resolve } => {
                if self.state != ClientState::Initial {
                    let _ = resolve.send(Err(misuse("reuse", self.state)));
                    return false;
                }
                self.attempt += 1;
                self.challenge_handler = None;
                match self.send_json(FrameType::Reuse, &params).await {
                    Ok(()) => {
                        self.pending = Some(Pending::Connect(resolve));
                        self.state = ClientState::Connecting;
                    }
                    Err(error) => {
                        let _ = resolve.send(Err(error.clone()));
                        self.fatal_delivered(error);
                    }
                }
                false
            }
            Op::Exec {
                command,
                pty,
                resolve,
            } => {
                if self.state != ClientState::Ready {
                    let _ = resolve.send(Err(misuse("exec", self.state)));
                    return false;
                }
                let frame_type = if pty {
                    FrameType::PtyCommand
                } else {
                    FrameType::SimpleCommand
                };
                match self
                    .send_frame(Frame::new(frame_type, command.into_bytes()))
                    .await
                {
                    Ok(()) => {
                        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
                        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
                        let (result_tx, result_rx) = oneshot::channel();
                        self.exec = Some(ExecWires {
                            stdout: stdout_tx,
                            stderr: stderr_tx,
                            result: Some(result_tx),
                        });
                        self.state = ClientState::Executing;
                        let _ = resolve.send(Ok(ExecStreams {
                            stdin: ExecStdin {
                                ops: self.ops_tx.clone(),
                            },
                            stdout: stdout_rx,
                            stderr: stderr_rx,
                            result: result_rx,
                        }));
                    }
                    Err(error) => {
                        let _ = resolve.send(Err(error.clone()));
                        self.fatal_delivered(error);
                    }
                }
                false
            }
            Op::Share { resolve } => {
                if self.state != ClientState::Ready {
                    let _ = resolve.send(Err(misuse("share", self.state)));
                    return false;
                }
                match self.send_frame(Frame::empty(FrameType::Share)).await {
                    Ok(()) => self.pending = Some(Pending::Share(resolve)),
                    Err(error) => {
                        let _ = resolve.send(Err(error.clone()));
                        self.fatal_delivered(error);
                    }
                }
                false
            }
            Op::Resize {
                rows,
                cols,
                resolve,
            } => {
                let resize = ResizeParams { rows, cols };
                self.window.apply(resize);
                match self.send_json(FrameType::Resize, &resize).await {
                    Ok(()) => {
                        let _ = resolve.send(Ok(()));
                    }
                    Err(error) => {
                        let _ = resolve.send(Err(error.clone()));
                        self.fatal_delivered(error);
                    }
                }
                false
            }
            Op::StdinData(data) => {
                if self.state == ClientState::Executing
                    && self.send_frame(Frame::new(FrameType::Stdin, data)).await.is_err()
                {
                    self.fatal(ClientError::no_daemon());
                }
                false
            }
            Op::StdinEof => {
                if self.state == ClientState::Executing
                    && self.send_frame(Frame::empty(FrameType::Stdin)).await.is_err()
                {
                    self.fatal(ClientError::no_daemon());
                }
                false
            }
            Op::ChallengeAnswered { attempt, answers } => {
                self.on_challenge_answered(attempt, answers).await;
                false
            }
            Op::Close { resolve } => {
                self.do_close().await;
                let _ = resolve.send(());
                true
            }
        }
    }

    /// Resolve an operation issued after the client became terminal.
    async fn refuse_op(&mut self, op: Op) -> bool {
        match op {
            Op::Connect { resolve, .. } | Op::Reuse { resolve, .. } => {
                let _ = resolve.send(Err(self.next_error()));
            }
            Op::Exec { resolve, .. } => {
                let _ = resolve.send(Err(self.next_error()));
            }
            Op::Share { resolve } => {
                let _ = resolve.send(Err(self.next_error()));
            }
            Op::Resize { resolve, .. } => {
                let _ = resolve.send(Err(self.next_error()));
            }
            Op::Close { resolve } => {
                let _ = resolve.send(());
                return true;
            }
            Op::StdinData(_) | Op::StdinEof | Op::ChallengeAnswered { .. } => {}
        }
        false
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame.frame_type {
            FrameType::Challenge if self.state == ClientState::Connecting => {
                self.on_challenge(&frame.payload);
            }
            FrameType::Connected if self.state == ClientState::Connecting => {
                match serde_json::from_slice::<ConnectedPayload>(&frame.payload) {
                    Ok(payload) => {
                        self.state = ClientState::Ready;
                        self.resolve_connect(Ok(ConnectOutcome {
                            success: true,
                            fingerprint: Some(payload.fingerprint),
                            banner: payload.banner,
                            reason: None,
                        }));
                    }
                    Err(e) => self.fatal(bad_payload("CONNECTED", e)),
                }
            }
            FrameType::Unconnected if self.state == ClientState::Connecting => {
                match serde_json::from_slice::<ReasonPayload>(&frame.payload) {
                    Ok(payload) => {
                        self.state = ClientState::Initial;
                        self.resolve_connect(Ok(ConnectOutcome {
                            success: false,
                            fingerprint: None,
                            banner: None,
                            reason: Some(payload.reason),
                        }));
                    }
                    Err(e) => self.fatal(bad_payload("UNCONNECTED", e)),
                }
            }
            FrameType::Disconnected => {
                let reason = serde_json::from_slice::<ReasonPayload>(&frame.payload)
                    .map(|p| p.reason)
                    .unwrap_or_else(|_| "ssh session dropped".to_string());
                self.fatal(ClientError::new(ErrorKind::NoSsh, reason));
            }
            FrameType::Stdout if self.state == ClientState::Executing => {
                if let Some(exec) = &self.exec {
                    let _ = exec.stdout.send(frame.payload);
                }
            }
            FrameType::Stderr if self.state == ClientState::Executing => {
                if let Some(exec) = &self.exec {
                    let _ = exec.stderr.send(frame.payload);
                }
            }
            FrameType::Result if self.state == ClientState::Executing => {
                match serde_json::from_slice::<ResultPayload>(&frame.payload) {
                    Ok(payload) => {
                        if let Some(error) = payload.error {
                            self.fatal(ClientError::new(ErrorKind::SshError, error));
                        } else {
                            self.state = ClientState::Ready;
                            if let Some(mut exec) = self.exec.take()
                                && let Some(result) = exec.result.take()
                            {
                                let _ = result.send(Ok(ExitStatus {
                                    code: payload.code,
                                    signal: payload.signal,
                                }));
                            }
                        }
                    }
                    Err(e) => self.fatal(bad_payload("RESULT", e)),
                }
            }
            FrameType::Exception => {
                let reason = serde_json::from_slice::<ReasonPayload>(&frame.payload)
                    .map(|p| p.reason)
                    .unwrap_or_else(|_| "daemon reported an exception".to_string());
                self.fatal(ClientError::new(ErrorKind::DaemonError, reason));
            }
            FrameType::Shared if matches!(self.pending, Some(Pending::Share(_))) => {
                match serde_json::from_slice::<SharedPayload>(&frame.payload) {
                    Ok(payload) => {
                        self.state = ClientState::Initial;
                        if let Some(Pending::Share(resolve)) = self.pending.take() {
                            let _ = resolve.send(Ok(payload.share_key));
                        }
                    }
                    Err(e) => self.fatal(bad_payload("SHARED", e)),
                }
            }
            other => {
                self.fatal(ClientError::new(
                    ErrorKind::ProtocolError,
                    format!("unexpected {:?} frame in {:?} state", other, self.state),
                ));
            }
        }
    }

    fn on_challenge(&mut self, payload: &[u8]) {
        let challenge = match serde_json::from_slice::<ChallengePayload>(payload) {
            Ok(challenge) => challenge,
            Err(e) => return self.fatal(bad_payload("CHALLENGE", e)),
        };

        let Some(handler) = self.challenge_handler.clone() else {
            return self.fatal(ClientError::new(
                ErrorKind::ChallengeError,
                "server issued a challenge but no challenge handler was provided",
            ));
        };

        // Run the handler off the driver loop; it may wait on a human.
        let ops = self.ops_tx.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let answers = handler.handle(challenge).await;
            let _ = ops.send(Op::ChallengeAnswered { attempt, answers });
        });
    }

    async fn on_challenge_answered(&mut self, attempt: u64, answers: Result<Vec<String>, String>) {
        // A stale response from a previous connect attempt.
        if attempt != self.attempt || self.state != ClientState::Connecting {
            debug!(attempt, "discarding late challenge response");
            return;
        }
        match answers {
            Ok(responses) => {
                if let Err(error) = self
                    .send_json(
                        FrameType::ChallengeResponse,
                        &ChallengeResponseParams { responses },
                    )
                    .await
                {
                    self.fatal(error);
                }
            }
            Err(message) => {
                self.fatal(ClientError::new(
                    ErrorKind::ChallengeError,
                    format!("challenge handler failed: {}", message),
                ));
            }
        }
    }

    fn resolve_connect(&mut self, outcome: Result<ConnectOutcome, ClientError>) {
        match self.pending.take() {
            Some(Pending::Connect(resolve)) => {
                let _ = resolve.send(outcome);
            }
            other => {
                // Not ours to eat; let the terminal path deliver the error.
                self.pending = other;
                self.fatal(ClientError::new(
                    ErrorKind::ProtocolError,
                    "connection outcome arrived without a pending connect",
                ));
            }
        }
    }

    async fn do_close(&mut self) {
        debug!("closing client");
        let error = ClientError::closed();
        if let Some(pending) = self.pending.take() {
            match pending {
                Pending::Connect(resolve) => {
                    let _ = resolve.send(Err(error.clone()));
                }
                Pending::Share(resolve) => {
                    let _ = resolve.send(Err(error.clone()));
                }
            }
        }
        self.destroy_exec(&error);
        self.state = ClientState::Errored;
        self.closed.store(true, Ordering::SeqCst);
        self.terminal = Some(Terminal {
            error,
            delivered: true,
        });
        let _ = self.framed.close().await;
    }

    /// Enter the terminal state, delivering `error` to the in-flight
    /// operation if any, otherwise stashing it for the next call.
    fn fatal(&mut self, error: ClientError) {
        warn!(error = %error, "client entered terminal state");
        self.state = ClientState::Errored;
        self.closed.store(true, Ordering::SeqCst);

        let mut delivered = false;
        if let Some(pending) = self.pending.take() {
            delivered = true;
            match pending {
                Pending::Connect(resolve) => {
                    let _ = resolve.send(Err(error.clone()));
                }
                Pending::Share(resolve) => {
                    let _ = resolve.send(Err(error.clone()));
                }
            }
        }
        if self.exec.is_some() {
            self.destroy_exec(&error);
            delivered = true;
        }
        self.terminal = Some(Terminal { error, delivered });
    }

    /// Like [`fatal`], but the error was already handed to the caller.
    fn fatal_delivered(&mut self, error: ClientError) {
        self.fatal(error);
        if let Some(terminal) = &mut self.terminal {
            terminal.delivered = true;
        }
    }

    /// Destroy exec stream handles with `error`; dropping the senders ends
    /// the stdout/stderr streams.
    fn destroy_exec(&mut self, error: &ClientError) {
        if let Some(mut exec) = self.exec.take()
            && let Some(result) = exec.result.take()
        {
            let _ = result.send(Err(error.clone()));
        }
    }

    fn next_error(&mut self) -> ClientError {
        match &mut self.terminal {
            Some(terminal) if !terminal.delivered => {
                terminal.delivered = true;
                terminal.error.clone()
            }
            Some(terminal) => ClientError::already_closed(terminal.error.clone()),
            None => ClientError::closed(),
        }
    }

    async fn send_json<T: serde::Serialize>(
        &mut self,
        frame_type: FrameType,
        payload: &T,
    ) -> Result<(), ClientError> {
        let frame = Frame::json(frame_type, payload).map_err(|e| {
            ClientError::new(ErrorKind::ProtocolError, format!("encoding failed: {}", e))
        })?;
        self.send_frame(frame).await
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), ClientError> {
        self.framed
            .send(frame)
            .await
            .map_err(|_| ClientError::no_daemon())
    }
}

fn misuse(operation: &str, state: ClientState) -> ClientError {
    ClientError::new(
        ErrorKind::ProtocolError,
        format!("{} is not valid in the {:?} state", operation, state),
    )
}

fn bad_payload(frame: &str, error: serde_json::Error) -> ClientError {
    ClientError::new(
        ErrorKind::ProtocolError,
        format!("malformed {} payload: {}", frame, error),
    )
}
