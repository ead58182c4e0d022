//! distlock — the core of a replicated, cache-coherent distributed lock
//! service.
//!
//! Four subsystems compose the core, leaves first:
//!
//! - [`codec`] and [`connection`]: framing and non-blocking byte
//!   transport for the wire protocol.
//! - [`rpc`]: at-most-once request/response semantics layered on top of
//!   [`connection`].
//! - [`lock`]: the caching lock protocol (client and server halves).
//! - [`paxos`], [`config`], [`rsm`]: single-decree Paxos, the view
//!   manager built on it, and the primary/backup replicated state
//!   machine built on the view manager.

pub mod codec;
pub mod config;
pub mod connection;
pub mod lock;
pub mod node_config;
pub mod paxos;
pub mod rpc;
pub mod rsm;
