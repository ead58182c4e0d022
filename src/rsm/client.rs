//! `rsm_client`: the client stub for talking to a replicated state
//! machine, grounded on the original `rsm_client`.
//!
//! Tracks a guess at the current primary and refreshes it from
//! [`super::protocol::PROC_CLIENT_MEMBERS`] whenever the guess turns out
//! to be stale.

use std::time::Duration;

use tokio::sync::Mutex;

use crate::connection::LossyConfig;
use crate::rpc::RpcClient;

use super::protocol::{decode_members, encode_client_invoke_arg, Status, PROC_CLIENT_INVOKE, PROC_CLIENT_MEMBERS};

const BUSY_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const NO_MEMBERS_RETRY_INTERVAL: Duration = Duration::from_secs(1);

struct State {
    primary: String,
    known_mems: Vec<String>,
}

/// A client of a replicated state machine group, addressed by any one
/// member's address at construction time.
pub struct RsmClient {
    state: Mutex<State>,
    lossy: LossyConfig,
}

impl RsmClient {
    /// Connects to the group reachable through `dst`, which need not be
    /// the current primary — the first [`Self::invoke`] call discovers
    /// it via `PROC_CLIENT_MEMBERS`.
    pub async fn connect(dst: impl Into<String>, lossy: LossyConfig) -> Self {
        let client = Self { state: Mutex::new(State { primary: dst.into(), known_mems: Vec::new() }), lossy };
        client.init_members().await;
        client
    }

    /// Invokes `procno` with `req` against the group's primary, hiding
    /// view changes and transient unavailability from the caller.
    pub async fn invoke(&self, procno: u32, req: Vec<u8>) -> (i32, Vec<u8>) {
        loop {
            let primary = self.state.lock().await.primary.clone();
            let rpc = RpcClient::new(&primary, rand::random(), self.lossy);
            let arg = encode_client_invoke_arg(procno, &req);
            match rpc.call_raw(PROC_CLIENT_INVOKE, arg).await {
                Ok((ret, body)) if ret == Status::Ok.code() => return (ret, body),
                Ok((ret, _)) if ret == Status::Busy.code() => {
                    tokio::time::sleep(BUSY_RETRY_INTERVAL).await;
                }
                Ok((ret, _)) if ret == Status::NotPrimary.code() => {
                    if !self.init_members().await {
                        self.primary_failure().await;
                    }
                }
                _ => {
                    self.primary_failure().await;
                }
            }
        }
    }

    /// Asks the current primary guess for the live membership, pushing
    /// it onto `known_mems` as fallback candidates and adopting the
    /// view's trailing entry (the acting primary) as the new guess.
    /// Returns whether the request succeeded.
    async fn init_members(&self) -> bool {
        let primary = self.state.lock().await.primary.clone();
        let rpc = RpcClient::new(&primary, rand::random(), self.lossy);
        let Ok((ret, body)) = rpc.call_raw(PROC_CLIENT_MEMBERS, Vec::new()).await else { return false };
        if ret != Status::Ok.code() {
            return false;
        }
        let Ok(mut view) = decode_members(&body) else { return false };
        let Some(new_primary) = view.pop() else { return false };
        let mut state = self.state.lock().await;
        state.known_mems = view;
        state.primary = new_primary;
        true
    }

    /// Falls back to another known member as the primary guess, or
    /// waits and retries the same address if none are left.
    async fn primary_failure(&self) {
        let mut state = self.state.lock().await;
        if let Some(next) = state.known_mems.pop() {
            state.primary = next;
        } else {
            drop(state);
            tokio::time::sleep(NO_MEMBERS_RETRY_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_unreachable_primary_keeps_the_seed_address() {
        let client = RsmClient::connect("127.0.0.1:1", LossyConfig::none()).await;
        assert_eq!(client.state.lock().await.primary, "127.0.0.1:1");
    }
}
