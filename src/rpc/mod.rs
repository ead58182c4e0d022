//! At-most-once RPC substrate.
//!
//! Arguments and return payloads are opaque byte vectors: each higher
//! layer (lock protocol, Paxos, RSM) owns its own encode/decode
//! functions built from [`crate::codec::primitive`], and registers a
//! closure consuming decoded bytes rather than handing this layer a
//! generic marshaling scheme — a virtual handler table registered by
//! method pointer.

pub mod client;
pub mod reply_window;
pub mod server;

pub use client::RpcClient;
pub use server::RpcServer;

/// Reserved procedure number for the RPC layer's own bind handshake.
pub const PROC_BIND: u32 = 0x0001;

/// A nonzero client incarnation id; zero means "no at-most-once
/// guarantees required" (single-shot clients).
pub type ClientNonce = u32;

/// A server incarnation id, chosen at server startup.
pub type ServerNonce = u32;

/// Default final deadline for one logical [`RpcClient::call`] — the
/// per-attempt timeout doubles from 1ms up to this value.
pub const DEFAULT_FINAL_DEADLINE: std::time::Duration = std::time::Duration::from_secs(120);

/// Initial per-attempt timeout for [`RpcClient::call`].
pub const INITIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1);

/// Negative RPC sentinels and semantic failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No reply arrived before the final deadline.
    Timeout,
    /// The caller's own arguments failed to marshal (never produced by
    /// this layer directly; reserved for callers that want to report it
    /// uniformly).
    UnmarshalArgs,
    /// The reply payload did not decode into the shape the caller
    /// expected.
    UnmarshalReply,
    /// The request's `(clt_nonce, xid)` fell below the server's reply
    /// window floor — the server has already forgotten whether it ran.
    AtMostOnce,
    /// The server's nonce did not match what the client bound to; the
    /// server has restarted under the client's feet.
    OldSrv,
    /// The initial bind handshake failed.
    Bind,
    /// The call was cancelled via [`RpcClient::cancel`].
    Cancel,
}

impl Error {
    /// The wire-level negative sentinel value for this error.
    pub fn sentinel(self) -> i32 {
        match self {
            Error::Timeout => -1,
            Error::UnmarshalArgs => -2,
            Error::UnmarshalReply => -3,
            Error::AtMostOnce => -4,
            Error::OldSrv => -5,
            Error::Bind => -6,
            Error::Cancel => -7,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Error::Timeout => "rpc call timed out",
            Error::UnmarshalArgs => "failed to unmarshal rpc arguments",
            Error::UnmarshalReply => "failed to unmarshal rpc reply",
            Error::AtMostOnce => "at-most-once guarantee could not be honored",
            Error::OldSrv => "server nonce mismatch: server has restarted",
            Error::Bind => "rpc bind handshake failed",
            Error::Cancel => "rpc call was cancelled",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
