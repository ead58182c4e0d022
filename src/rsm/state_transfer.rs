//! The upcall a replicated service implements so the RSM layer can move
//! its state to a node catching up, grounded on the original
//! `rsm_state_transfer` interface.

/// Implemented by the service running on top of the replicated state
/// machine. `marshal_state`/`unmarshal_state` must round-trip every bit
/// of state [`super::Rsm::invoke`] handlers can observe — anything left
/// out silently diverges on a joining or recovering replica.
pub trait StateTransfer: Send + Sync {
    fn marshal_state(&self) -> Vec<u8>;
    fn unmarshal_state(&self, state: &[u8]);
}
