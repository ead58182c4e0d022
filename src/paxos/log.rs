//! Durable acceptor state, grounded on the
//! original `log` class: a promise (`n_h`), an accepted value (`n_a`,
//! `v_a`), and the append-only history of decided instances.
//!
//! Persistence to a real file is left to the binary embedding this
//! crate — [`PaxosLog::snapshot`] and [`PaxosLog::restore`] produce and
//! consume the same bytes a file-backed implementation would write, so
//! swapping in `tokio::fs` at the edges is a non-invasive addition.

use std::collections::BTreeMap;

use super::protocol::Proposal;

/// One acceptor's persistent state: the promise and accepted value for
/// whichever instance is currently being decided, plus every instance
/// decided so far.
#[derive(Debug, Clone)]
pub struct PaxosLog {
    pub n_h: Proposal,
    pub n_a: Proposal,
    pub v_a: Vec<u8>,
    pub instance_h: u32,
    pub values: BTreeMap<u32, Vec<u8>>,
}

impl PaxosLog {
    pub fn new(me: &str) -> Self {
        Self {
            n_h: Proposal::zero(me),
            n_a: Proposal::zero(me),
            v_a: Vec::new(),
            instance_h: 0,
            values: BTreeMap::new(),
        }
    }

    /// Records a promise not to accept anything below `n` — called when
    /// an acceptor grants a prepare request.
    pub fn log_promise(&mut self, n: Proposal) {
        self.n_h = n;
    }

    /// Records an accepted proposal — called when an acceptor grants an
    /// accept request.
    pub fn log_accept(&mut self, n: Proposal, v: Vec<u8>) {
        self.n_a = n;
        self.v_a = v;
    }

    /// Records a decided instance and resets the promise/accept state
    /// for the next one.
    pub fn log_instance(&mut self, instance: u32, v: Vec<u8>, me: &str) {
        self.values.insert(instance, v);
        self.instance_h = instance;
        self.n_h = Proposal::zero(me);
        self.n_a = Proposal::zero(me);
        self.v_a.clear();
    }

    pub fn value(&self, instance: u32) -> Option<&Vec<u8>> {
        self.values.get(&instance)
    }

    /// Serializes the whole log to bytes, for storage or transfer to a
    /// node catching up.
    pub fn snapshot(&self) -> Vec<u8> {
        use crate::codec::primitive::{write_bytes, write_u32, write_u64, write_string};
        let mut buf = Vec::new();
        let _ = write_u64(&mut buf, self.n_h.n.n);
        let _ = write_string(&mut buf, &self.n_h.from);
        let _ = write_u64(&mut buf, self.n_a.n.n);
        let _ = write_string(&mut buf, &self.n_a.from);
        let _ = write_bytes(&mut buf, &self.v_a);
        let _ = write_u32(&mut buf, self.instance_h);
        let _ = write_u32(&mut buf, self.values.len() as u32);
        for (instance, v) in &self.values {
            let _ = write_u32(&mut buf, *instance);
            let _ = write_bytes(&mut buf, v);
        }
        buf
    }

    pub fn restore(bytes: &[u8]) -> crate::codec::Result<Self> {
        use crate::codec::primitive::{read_bytes, read_u32, read_u64, read_string};
        let mut c = std::io::Cursor::new(bytes);
        let n_h = Proposal { n: super::protocol::PropT { n: read_u64(&mut c)? }, from: read_string(&mut c)? };
        let n_a = Proposal { n: super::protocol::PropT { n: read_u64(&mut c)? }, from: read_string(&mut c)? };
        let v_a = read_bytes(&mut c)?;
        let instance_h = read_u32(&mut c)?;
        let count = read_u32(&mut c)?;
        let mut values = BTreeMap::new();
        for _ in 0..count {
            let instance = read_u32(&mut c)?;
            let v = read_bytes(&mut c)?;
            values.insert(instance, v);
        }
        Ok(Self { n_h, n_a, v_a, instance_h, values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips() {
        let mut log = PaxosLog::new("10.0.0.1:8000");
        log.log_promise(Proposal { n: super::super::protocol::PropT { n: 3 }, from: "10.0.0.1:8000".into() });
        log.log_instance(1, b"a b".to_vec(), "10.0.0.1:8000");
        log.log_instance(2, b"a b c".to_vec(), "10.0.0.1:8000");
        let bytes = log.snapshot();
        let restored = PaxosLog::restore(&bytes).unwrap();
        assert_eq!(restored.instance_h, 2);
        assert_eq!(restored.value(1).unwrap(), b"a b");
        assert_eq!(restored.value(2).unwrap(), b"a b c");
    }
}
