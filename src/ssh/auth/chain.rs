//! Authentication chain for trying multiple strategies.

use russh::client;
use tracing::debug;

use crate::error::SshFailure;
use crate::ssh::handler::BridgeHandler;

use super::traits::{AuthOutcome, AuthStrategy};

/// Authentication chain that tries multiple strategies in order.
///
/// Strategies are tried in the order they were added. The first accepted
/// authentication stops the chain. If every strategy is rejected the chain
/// fails with an authentication failure; a transport-level error from any
/// strategy aborts the chain immediately.
pub(crate) struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    /// Create a new empty authentication chain.
    pub(crate) fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Append a strategy to the chain.
    pub(crate) fn push(&mut self, strategy: impl AuthStrategy + 'static) {
        self.strategies.push(Box::new(strategy));
    }

    /// Run the chain against an un-authenticated handle.
    pub(crate) async fn authenticate(
        &mut self,
        handle: &mut client::Handle<BridgeHandler>,
        username: &str,
    ) -> Result<(), SshFailure> {
        if self.strategies.is_empty() {
            return Err(SshFailure::authentication());
        }

        for strategy in &mut self.strategies {
            debug!(strategy = strategy.name(), "trying authentication strategy");
            match strategy.authenticate(handle, username).await? {
                AuthOutcome::Accepted => {
                    debug!(strategy = strategy.name(), "authentication accepted");
                    return Ok(());
                }
                AuthOutcome::Rejected => {
                    debug!(strategy = strategy.name(), "authentication rejected");
                }
            }
        }

        Err(SshFailure::authentication())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NamedStrategy(&'static str);

    #[async_trait]
    impl AuthStrategy for NamedStrategy {
        async fn authenticate(
            &mut self,
            _handle: &mut client::Handle<BridgeHandler>,
            _username: &str,
        ) -> Result<AuthOutcome, SshFailure> {
            Ok(AuthOutcome::Rejected)
        }

        fn name(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn test_chain_starts_empty() {
        assert!(AuthChain::new().strategies.is_empty());
    }

    #[test]
    fn test_push_preserves_order() {
        let mut chain = AuthChain::new();
        chain.push(NamedStrategy("publickey"));
        chain.push(NamedStrategy("password"));
        chain.push(NamedStrategy("keyboard-interactive"));

        let names: Vec<_> = chain.strategies.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["publickey", "password", "keyboard-interactive"]);
    }
}
