//! Authentication strategy trait definition.
//!
//! Defines the interface for authentication strategies, enabling the
//! Strategy pattern for the SSH authentication methods the bridge offers.

use async_trait::async_trait;
use russh::client;

use crate::error::SshFailure;
use crate::ssh::handler::BridgeHandler;

/// Result of one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthOutcome {
    /// The server accepted the credentials.
    Accepted,
    /// The server rejected the credentials; the chain may continue.
    Rejected,
}

/// Trait for SSH authentication strategies.
///
/// Strategies take `&mut self` because the keyboard-interactive strategy
/// consumes its challenge-response stream while running.
#[async_trait]
pub(crate) trait AuthStrategy: Send {
    /// Attempt to authenticate with the SSH server.
    ///
    /// # Returns
    ///
    /// * `Ok(AuthOutcome::Accepted)` - Authentication succeeded
    /// * `Ok(AuthOutcome::Rejected)` - Credentials rejected
    /// * `Err(failure)` - Transport-level error during the attempt
    async fn authenticate(
        &mut self,
        handle: &mut client::Handle<BridgeHandler>,
        username: &str,
    ) -> Result<AuthOutcome, SshFailure>;

    /// Name of this strategy, for logging.
    fn name(&self) -> &'static str;
}
