//! Local daemon that brokers and caches authenticated SSH sessions.
//!
//! Short-lived client processes connect to the daemon over a Unix domain
//! socket, ask it to establish or reuse an SSH session and tunnel command
//! I/O through it. Between client lifetimes the daemon retains
//! authenticated sessions (12 hours for reusable sessions, 5 seconds for
//! shared ones) and the credentials that last worked for each endpoint, so
//! subsequent clients reconnect without re-prompting anyone.
//!
//! The crate is organized into the following modules:
//!
//! - `config`: configuration directory layout and tunables
//! - `error`: the failure taxonomy shared by both sides of the wire
//! - `frame`: the length-prefixed frame codec
//! - `request`: wire payload types and request validation
//! - `ssh`: the russh adapter (sessions, auth strategies, observers)
//! - `pool`: idle session retention and credential caching
//! - `daemon`: listener, single-instance lock, per-client handlers
//! - `client`: the caller-side state machine
//! - `bootstrap`: spawning the daemon from a client process

#![deny(warnings)]
#![deny(clippy::unwrap_used)]

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod frame;
pub mod pool;
pub mod request;
pub mod ssh;

pub use client::{BridgeClient, ChallengeHandler, ConnectOutcome, ExecStreams, ExitStatus};
pub use config::BridgeDirs;
pub use error::{ClientError, ErrorKind};
pub use request::{ConnectParams, ReuseParams};
