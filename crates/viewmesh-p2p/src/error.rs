//! Error types for the communication layer.
//!
//! Construction-time failures (`Config`, `Key`, `Network`, `Connection`)
//! are returned synchronously to the caller; there is no retry at this
//! layer. Steady-state discovery failures (`Advertise`,
//! `Discovery`) are swallowed into logs so the node and its established
//! sessions stay usable while discovery is degraded.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed listen address or otherwise invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Identity key unavailable or undecodable.
    #[error("identity key unavailable: {0}")]
    Key(String),

    /// Overlay endpoint construction or bind failure.
    #[error("overlay host construction failed: {0}")]
    Network(String),

    /// Initial dial to the bootstrap peer failed. Fatal to `join`;
    /// the caller owns any retry policy.
    #[error("dial to bootstrap peer failed: {0}")]
    Connection(String),

    /// Rendezvous announce failed. Non-fatal in steady state.
    #[error("rendezvous advertise failed: {0}")]
    Advertise(String),

    /// Rendezvous search failed. Always non-fatal, logged.
    #[error("rendezvous search failed: {0}")]
    Discovery(String),

    /// Send on a session whose `close()` has already run.
    #[error("session is closed")]
    SessionClosed,

    /// Stream write or envelope encode failure inside `send`.
    #[error("transport failure: {0}")]
    Transport(String),
}
