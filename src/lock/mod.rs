//! The caching lock protocol: a client that holds
//! locks across calls and a server that grants/revokes/retries them,
//! replicated through [`crate::rsm`] in production deployments.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{CachingClient, Client, LockTransport};
pub use protocol::{LockId, Status, Xid};
pub use server::LockServer;
