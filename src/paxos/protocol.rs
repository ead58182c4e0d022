//! Wire messages and procedure numbers for single-decree Paxos.
//! Procedure numbers match the historical Paxos RPC program so traces
//! read the same way across implementations.

use std::io::{Cursor, Read, Write};

use crate::codec::primitive::{read_bytes, read_string, read_u32, read_u64, write_bytes, write_string, write_u32, write_u64};
use crate::codec::{self, Result};

pub const PROC_PREPARE: u32 = 0x11001;
pub const PROC_ACCEPT: u32 = 0x11002;
pub const PROC_DECIDE: u32 = 0x11003;
pub const PROC_HEARTBEAT: u32 = 0x11004;

/// A proposal number: a round counter paired with the proposer's
/// address, which breaks ties and gives every acceptor a total order
/// over proposals without coordination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropT {
    pub n: u64,
}

/// Proposal numbers are compared together with the proposer identity
/// that originated them; ties broken lexicographically by address keep
/// the order total even when two proposers pick the same round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub n: PropT,
    pub from: String,
}

impl Proposal {
    pub fn zero(me: &str) -> Self {
        Self { n: PropT { n: 0 }, from: me.to_string() }
    }

    pub fn decode(src: &mut impl Read) -> Result<Self> {
        let n = read_u64(src)?;
        let from = read_string(src)?;
        Ok(Self { n: PropT { n }, from })
    }

    pub fn encode(&self, dst: &mut impl Write) -> Result<()> {
        write_u64(dst, self.n.n)?;
        write_string(dst, &self.from)?;
        Ok(())
    }
}

impl PartialOrd for Proposal {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Proposal {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.n.n, &self.from).cmp(&(other.n.n, &other.from))
    }
}

pub struct PrepareArg {
    pub instance: u32,
    pub n: Proposal,
}

impl PrepareArg {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let instance = read_u32(&mut c)?;
        let n = Proposal::decode(&mut c)?;
        Ok(Self { instance, n })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::new();
        let _ = write_u32(&mut v, self.instance);
        let _ = self.n.encode(&mut v);
        v
    }
}

pub struct PrepareRes {
    pub oldinstance: bool,
    pub accept: bool,
    pub n_a: Proposal,
    pub v_a: Vec<u8>,
}

impl PrepareRes {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let oldinstance = codec::primitive::read_bool(&mut c)?;
        let accept = codec::primitive::read_bool(&mut c)?;
        let n_a = Proposal::decode(&mut c)?;
        let v_a = read_bytes(&mut c)?;
        Ok(Self { oldinstance, accept, n_a, v_a })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::new();
        let _ = codec::primitive::write_bool(&mut v, self.oldinstance);
        let _ = codec::primitive::write_bool(&mut v, self.accept);
        let _ = self.n_a.encode(&mut v);
        let _ = write_bytes(&mut v, &self.v_a);
        v
    }
}

pub struct AcceptArg {
    pub instance: u32,
    pub n: Proposal,
    pub v: Vec<u8>,
}

impl AcceptArg {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let instance = read_u32(&mut c)?;
        let n = Proposal::decode(&mut c)?;
        let v = read_bytes(&mut c)?;
        Ok(Self { instance, n, v })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::new();
        let _ = write_u32(&mut v, self.instance);
        let _ = self.n.encode(&mut v);
        let _ = write_bytes(&mut v, &self.v);
        v
    }
}

pub struct DecideArg {
    pub instance: u32,
    pub v: Vec<u8>,
}

impl DecideArg {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let instance = read_u32(&mut c)?;
        let v = read_bytes(&mut c)?;
        Ok(Self { instance, v })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::new();
        let _ = write_u32(&mut v, self.instance);
        let _ = write_bytes(&mut v, &self.v);
        v
    }
}

pub fn encode_heartbeat_arg(me: &str, vid: u32) -> Vec<u8> {
    let mut v = Vec::new();
    let _ = write_string(&mut v, me);
    let _ = write_u32(&mut v, vid);
    v
}

pub fn decode_heartbeat_arg(buf: &[u8]) -> Result<(String, u32)> {
    let mut c = Cursor::new(buf);
    let me = read_string(&mut c)?;
    let vid = read_u32(&mut c)?;
    Ok((me, vid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_ordering_breaks_ties_by_address() {
        let a = Proposal { n: PropT { n: 5 }, from: "10.0.0.1:1".into() };
        let b = Proposal { n: PropT { n: 5 }, from: "10.0.0.2:1".into() };
        assert!(a < b);
        let c = Proposal { n: PropT { n: 6 }, from: "10.0.0.1:1".into() };
        assert!(a < c);
    }

    #[test]
    fn accept_arg_round_trips() {
        let a = AcceptArg { instance: 3, n: Proposal { n: PropT { n: 7 }, from: "x".into() }, v: b"hello".to_vec() };
        let bytes = a.encode();
        let b = AcceptArg::decode(&bytes).unwrap();
        assert_eq!(b.instance, 3);
        assert_eq!(b.v, b"hello");
    }
}
