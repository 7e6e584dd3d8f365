//! Viewmesh P2P communication layer.
//!
//! Independent view executions on different nodes exchange messages over
//! logical channels called sessions. This crate provides the transport
//! underneath: node bootstrap and identity, rendezvous-based peer
//! discovery, inbound stream demultiplexing, and the dual-mode session
//! abstraction (network-stream backed vs. same-node loopback).
//!
//! Request/response semantics, retries, and payload validation all live
//! in the layers above; `send` is fire-and-forget once the transport
//! accepts the bytes.

pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod session;
pub mod wire;

pub use iroh;

pub use error::Error;
pub use node::{NodeConfig, P2pNode};
pub use session::{LoopbackSession, Session, SessionInfo};
pub use wire::{Message, Status};

/// ALPN protocol identifier claiming inbound streams for view sessions.
/// Unrelated protocols on the same transport are not handled here.
pub const VIEW_ALPN: &[u8] = b"/viewmesh/session/1";

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
