//! Wire messages for the primary/backup replicated state machine
//! Procedure numbers match the historical RSM RPC
//! programs.

use std::io::Cursor;

use crate::codec::primitive::{read_bytes, read_string, read_u32, write_bytes, write_string, write_u32};
use crate::codec::Result;

pub const PROC_CLIENT_INVOKE: u32 = 0x9001;
pub const PROC_CLIENT_MEMBERS: u32 = 0x9002;
pub const PROC_INVOKE: u32 = 0x10001;
pub const PROC_TRANSFERREQ: u32 = 0x10002;
pub const PROC_TRANSFERDONEREQ: u32 = 0x10003;
pub const PROC_JOINREQ: u32 = 0x10004;

/// Status carried in the RPC reply header's `ret` field for RSM
/// procedures. `Busy` tells a caller to retry later without abandoning
/// the primary; `NotPrimary` (client-facing only) tells the client to
/// refresh its membership list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Err,
    Busy,
    NotPrimary,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Err => 1,
            Status::Busy => 2,
            Status::NotPrimary => 3,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Status::Ok,
            2 => Status::Busy,
            3 => Status::NotPrimary,
            _ => Status::Err,
        }
    }
}

/// A request's position in the primary's total order: the view it was
/// assigned in, and its sequence number within that view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Viewstamp {
    pub vid: u32,
    pub seqno: u32,
}

impl PartialOrd for Viewstamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Viewstamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.vid, self.seqno).cmp(&(other.vid, other.seqno))
    }
}

impl Viewstamp {
    pub fn decode(src: &mut impl std::io::Read) -> Result<Self> {
        Ok(Self { vid: read_u32(src)?, seqno: read_u32(src)? })
    }

    pub fn encode(&self, dst: &mut impl std::io::Write) -> Result<()> {
        write_u32(dst, self.vid)?;
        write_u32(dst, self.seqno)
    }
}

pub fn encode_invoke_arg(vs: Viewstamp, procno: u32, req: &[u8]) -> Vec<u8> {
    let mut v = Vec::new();
    let _ = vs.encode(&mut v);
    let _ = write_u32(&mut v, procno);
    let _ = write_bytes(&mut v, req);
    v
}

pub fn decode_invoke_arg(buf: &[u8]) -> Result<(Viewstamp, u32, Vec<u8>)> {
    let mut c = Cursor::new(buf);
    let vs = Viewstamp::decode(&mut c)?;
    let procno = read_u32(&mut c)?;
    let req = read_bytes(&mut c)?;
    Ok((vs, procno, req))
}

pub fn encode_client_invoke_arg(procno: u32, req: &[u8]) -> Vec<u8> {
    let mut v = Vec::new();
    let _ = write_u32(&mut v, procno);
    let _ = write_bytes(&mut v, req);
    v
}

pub fn decode_client_invoke_arg(buf: &[u8]) -> Result<(u32, Vec<u8>)> {
    let mut c = Cursor::new(buf);
    let procno = read_u32(&mut c)?;
    let req = read_bytes(&mut c)?;
    Ok((procno, req))
}

pub struct TransferRes {
    pub state: Vec<u8>,
    pub last: Viewstamp,
}

impl TransferRes {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let state = read_bytes(&mut c)?;
        let last = Viewstamp::decode(&mut c)?;
        Ok(Self { state, last })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::new();
        let _ = write_bytes(&mut v, &self.state);
        let _ = self.last.encode(&mut v);
        v
    }
}

pub fn encode_transferreq_arg(src: &str, last: Viewstamp, vid: u32) -> Vec<u8> {
    let mut v = Vec::new();
    let _ = write_string(&mut v, src);
    let _ = last.encode(&mut v);
    let _ = write_u32(&mut v, vid);
    v
}

pub fn decode_transferreq_arg(buf: &[u8]) -> Result<(String, Viewstamp, u32)> {
    let mut c = Cursor::new(buf);
    let src = read_string(&mut c)?;
    let last = Viewstamp::decode(&mut c)?;
    let vid = read_u32(&mut c)?;
    Ok((src, last, vid))
}

pub fn encode_transferdonereq_arg(m: &str, vid: u32) -> Vec<u8> {
    let mut v = Vec::new();
    let _ = write_string(&mut v, m);
    let _ = write_u32(&mut v, vid);
    v
}

pub fn decode_transferdonereq_arg(buf: &[u8]) -> Result<(String, u32)> {
    let mut c = Cursor::new(buf);
    let m = read_string(&mut c)?;
    let vid = read_u32(&mut c)?;
    Ok((m, vid))
}

pub fn encode_joinreq_arg(src: &str, last: Viewstamp) -> Vec<u8> {
    let mut v = Vec::new();
    let _ = write_string(&mut v, src);
    let _ = last.encode(&mut v);
    v
}

pub fn decode_joinreq_arg(buf: &[u8]) -> Result<(String, Viewstamp)> {
    let mut c = Cursor::new(buf);
    let src = read_string(&mut c)?;
    let last = Viewstamp::decode(&mut c)?;
    Ok((src, last))
}

pub fn encode_members(members: &[String]) -> Vec<u8> {
    let mut v = Vec::new();
    let _ = write_u32(&mut v, members.len() as u32);
    for m in members {
        let _ = write_string(&mut v, m);
    }
    v
}

pub fn decode_members(buf: &[u8]) -> Result<Vec<String>> {
    let mut c = Cursor::new(buf);
    let n = read_u32(&mut c)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        out.push(read_string(&mut c)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewstamp_orders_by_vid_then_seqno() {
        assert!(Viewstamp { vid: 1, seqno: 9 } < Viewstamp { vid: 2, seqno: 0 });
        assert!(Viewstamp { vid: 1, seqno: 1 } < Viewstamp { vid: 1, seqno: 2 });
    }

    #[test]
    fn members_round_trip() {
        let members = vec!["a".to_string(), "b".to_string()];
        let encoded = encode_members(&members);
        assert_eq!(decode_members(&encoded).unwrap(), members);
    }
}
