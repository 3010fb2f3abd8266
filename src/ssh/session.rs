//! Owning handle for one authenticated SSH session.
//!
//! A session is owned by exactly one client handler, or parked idle in the
//! connection pool; never both. It holds at most one active command channel
//! at a time. All channel I/O runs in a pump task; the owner talks to it
//! through a small command queue and hears back through the session's
//! current observer.

use bytes::Bytes;
use russh::{Channel, ChannelMsg, Disconnect, Sig, client};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::request::{CacheKey, ConnectedPayload, ResizeParams, ResultPayload, WindowSize};

use super::handler::{BridgeHandler, SessionShared};
use super::observer::{SessionEvent, SessionObserver};

/// Commands routed to the active channel's pump task.
enum ChannelCmd {
    Stdin(Bytes),
    StdinEof,
    Resize(u16, u16),
}

struct ActiveCommand {
    cmds: mpsc::UnboundedSender<ChannelCmd>,
    pty: bool,
}

/// One authenticated SSH connection.
pub struct SshSession {
    key: CacheKey,
    fingerprint: String,
    banner: Option<String>,
    reusable: bool,
    share_key: Option<String>,
    window: WindowSize,
    handle: client::Handle<BridgeHandler>,
    shared: Arc<SessionShared>,
    active: Option<ActiveCommand>,
    /// Stdin received before a channel existed, flushed on the next exec.
    pending_stdin: Vec<Bytes>,
    pending_eof: bool,
}

impl SshSession {
    pub(crate) fn new(
        key: CacheKey,
        fingerprint: String,
        banner: Option<String>,
        reusable: bool,
        window: WindowSize,
        handle: client::Handle<BridgeHandler>,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            key,
            fingerprint,
            banner,
            reusable,
            share_key: None,
            window,
            handle,
            shared,
            active: None,
            pending_stdin: Vec::new(),
            pending_eof: false,
        }
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    pub fn reusable(&self) -> bool {
        self.reusable
    }

    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    pub fn share_key(&self) -> Option<&str> {
        self.share_key.as_deref()
    }

    pub fn set_share_key(&mut self, key: String) {
        self.share_key = Some(key);
    }

    /// Replace the stored window wholesale, e.g. when a handler attaches a
    /// pooled session and carries its client's dimensions over.
    pub fn set_window(&mut self, window: WindowSize) {
        self.window = window;
    }

    /// The payload of a CONNECTED frame for this session.
    pub fn connected_payload(&self) -> ConnectedPayload {
        ConnectedPayload {
            fingerprint: self.fingerprint.clone(),
            banner: self.banner.clone(),
        }
    }

    /// Redirect session events to a different observer.
    pub fn swap_observer(&self, observer: SessionObserver) {
        self.shared.swap_observer(observer);
    }

    /// Open a channel and run `command` on it.
    ///
    /// All outcomes are reported through the observer: `Stdout`/`Stderr`
    /// while the command runs, then exactly one `Result`. A failure to open
    /// or start the channel reports `Result` with an `error` and taints the
    /// session non-reusable.
    pub async fn exec(&mut self, command: &str, pty: bool) {
        let channel = match self.handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                self.fail_channel(format!("failed to open channel: {}", e));
                return;
            }
        };

        if pty {
            let result = channel
                .request_pty(
                    false,
                    "xterm-256color",
                    self.window.cols as u32,
                    self.window.rows as u32,
                    0,
                    0,
                    &[],
                )
                .await;
            if let Err(e) = result {
                self.fail_channel(format!("failed to request pty: {}", e));
                return;
            }
        }

        if let Err(e) = channel.exec(true, command).await {
            self.fail_channel(format!("failed to start command: {}", e));
            return;
        }

        let (cmds, cmds_rx) = mpsc::unbounded_channel();
        for chunk in self.pending_stdin.drain(..) {
            let _ = cmds.send(ChannelCmd::Stdin(chunk));
        }
        if self.pending_eof {
            self.pending_eof = false;
            let _ = cmds.send(ChannelCmd::StdinEof);
        }

        self.active = Some(ActiveCommand { cmds, pty });
        tokio::spawn(pump_channel(channel, cmds_rx, self.shared.clone()));
    }

    fn fail_channel(&mut self, error: String) {
        warn!(key = %self.key, error = %error, "command channel failed");
        self.reusable = false;
        self.shared.notify(SessionEvent::Result(ResultPayload {
            error: Some(error),
            ..Default::default()
        }));
    }

    /// Write bytes to the current command's stdin, or queue them for the
    /// next command when no channel is open yet.
    pub fn write_stdin(&mut self, data: Bytes) {
        match &self.active {
            Some(active) => {
                let _ = active.cmds.send(ChannelCmd::Stdin(data));
            }
            None => self.pending_stdin.push(data),
        }
    }

    /// Half-close the current command's stdin.
    pub fn end_stdin(&mut self) {
        match &self.active {
            Some(active) => {
                let _ = active.cmds.send(ChannelCmd::StdinEof);
            }
            None => self.pending_eof = true,
        }
    }

    /// Update the window size, resizing the current PTY channel if any.
    pub fn resize(&mut self, resize: ResizeParams) {
        self.window.apply(resize);
        if let Some(active) = &self.active
            && active.pty
        {
            let _ = active
                .cmds
                .send(ChannelCmd::Resize(self.window.rows, self.window.cols));
        }
    }

    /// Forget the active command after its `Result` was observed.
    pub fn finish_command(&mut self) {
        self.active = None;
    }

    /// Close the underlying SSH connection.
    pub async fn close(self) {
        debug!(key = %self.key, "closing ssh session");
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Exit signal name as it appears in RESULT payloads, e.g. `SIGTERM`.
fn wire_signal_name(signal: &Sig) -> String {
    let name = match signal {
        Sig::ABRT => "ABRT",
        Sig::ALRM => "ALRM",
        Sig::FPE => "FPE",
        Sig::HUP => "HUP",
        Sig::ILL => "ILL",
        Sig::INT => "INT",
        Sig::KILL => "KILL",
        Sig::PIPE => "PIPE",
        Sig::QUIT => "QUIT",
        Sig::SEGV => "SEGV",
        Sig::TERM => "TERM",
        Sig::USR1 => "USR1",
        Sig::Custom(custom) => custom.as_str(),
    };
    format!("SIG{}", name)
}

/// Drive one command channel to completion.
///
/// Emits `Stdout`/`Stderr` events as data arrives and exactly one `Result`
/// when the channel finishes, carrying the exit code or signal, or an
/// `error` when channel I/O broke.
async fn pump_channel(
    mut channel: Channel<client::Msg>,
    mut cmds: mpsc::UnboundedReceiver<ChannelCmd>,
    shared: Arc<SessionShared>,
) {
    let mut result = ResultPayload::default();
    let mut cmds_open = true;

    loop {
        tokio::select! {
            cmd = cmds.recv(), if cmds_open => match cmd {
                Some(ChannelCmd::Stdin(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        result.error = Some(format!("failed to write stdin: {}", e));
                        break;
                    }
                }
                Some(ChannelCmd::StdinEof) => {
                    let _ = channel.eof().await;
                }
                Some(ChannelCmd::Resize(rows, cols)) => {
                    let _ = channel.window_change(cols as u32, rows as u32, 0, 0).await;
                }
                // Owner went away; keep draining the channel itself.
                None => cmds_open = false,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    shared.notify(SessionEvent::Stdout(Bytes::copy_from_slice(&data)));
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    // ext == 1 is stderr in the SSH protocol
                    if ext == 1 {
                        shared.notify(SessionEvent::Stderr(Bytes::copy_from_slice(&data)));
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    result.code = Some(exit_status);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    result.signal = Some(wire_signal_name(&signal_name));
                }
                Some(ChannelMsg::Eof) => {
                    if result.code.is_some() || result.signal.is_some() {
                        break;
                    }
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    }

    let _ = channel.close().await;
    shared.notify(SessionEvent::Result(result));
}
