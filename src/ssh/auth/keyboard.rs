//! Keyboard-interactive SSH authentication.
//!
//! Challenges from the server are forwarded to the session observer; the
//! answers come back through a channel fed by the peer's
//! `CHALLENGE_RESPONSE` frames. Responses resolve challenges oldest-first,
//! which the FIFO channel gives us for free.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::SshFailure;
use crate::request::{ChallengePayload, ChallengePrompt};
use crate::ssh::classify_ssh_error;
use crate::ssh::handler::BridgeHandler;
use crate::ssh::observer::{SessionEvent, SessionObserver};

use super::traits::{AuthOutcome, AuthStrategy};

/// Keyboard-interactive authentication strategy.
pub(crate) struct KeyboardInteractiveAuth {
    observer: SessionObserver,
    responses: mpsc::UnboundedReceiver<Vec<String>>,
    /// Raised as soon as the server issues a challenge; connects that saw a
    /// challenge must not have their credentials cached.
    challenged: Arc<AtomicBool>,
}

impl KeyboardInteractiveAuth {
    pub(crate) fn new(
        observer: SessionObserver,
        responses: mpsc::UnboundedReceiver<Vec<String>>,
        challenged: Arc<AtomicBool>,
    ) -> Self {
        Self {
            observer,
            responses,
            challenged,
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyboardInteractiveAuth {
    async fn authenticate(
        &mut self,
        handle: &mut client::Handle<BridgeHandler>,
        username: &str,
    ) -> Result<AuthOutcome, SshFailure> {
        let mut round = handle
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map_err(classify_ssh_error)?;

        loop {
            match round {
                KeyboardInteractiveAuthResponse::Success => return Ok(AuthOutcome::Accepted),
                KeyboardInteractiveAuthResponse::Failure { .. } => {
                    return Ok(AuthOutcome::Rejected);
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    debug!(count = prompts.len(), "keyboard-interactive challenge");
                    self.challenged.store(true, Ordering::SeqCst);
                    self.observer
                        .notify(SessionEvent::Challenge(ChallengePayload {
                            title: name,
                            instructions,
                            language: String::new(),
                            prompts: prompts
                                .into_iter()
                                .map(|p| ChallengePrompt {
                                    prompt: p.prompt,
                                    echo: p.echo,
                                })
                                .collect(),
                        }));

                    // The peer vanishing mid-challenge reads as a rejection.
                    let Some(answers) = self.responses.recv().await else {
                        return Ok(AuthOutcome::Rejected);
                    };

                    round = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(classify_ssh_error)?;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }
}
