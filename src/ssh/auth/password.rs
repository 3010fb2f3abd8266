//! Password-based SSH authentication.

use async_trait::async_trait;
use russh::client;

use crate::error::SshFailure;
use crate::ssh::handler::BridgeHandler;
use crate::ssh::classify_ssh_error;

use super::traits::{AuthOutcome, AuthStrategy};

/// Password authentication strategy.
pub(crate) struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub(crate) fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &mut self,
        handle: &mut client::Handle<BridgeHandler>,
        username: &str,
    ) -> Result<AuthOutcome, SshFailure> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(classify_ssh_error)?;

        Ok(if result.success() {
            AuthOutcome::Accepted
        } else {
            AuthOutcome::Rejected
        })
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
