//! Authentication strategies for brokered SSH sessions.
//!
//! Submodules:
//!
//! - `traits`: the strategy interface
//! - `chain`: ordered chain runner
//! - `key`: public key authentication from in-memory material
//! - `password`: password authentication
//! - `keyboard`: keyboard-interactive authentication with challenge
//!   forwarding

mod chain;
mod key;
mod keyboard;
mod password;
mod traits;

pub(crate) use chain::AuthChain;
pub(crate) use key::{KeyAuth, parse_private_key};
pub(crate) use keyboard::KeyboardInteractiveAuth;
pub(crate) use password::PasswordAuth;
