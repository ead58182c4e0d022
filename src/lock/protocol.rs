//! Wire messages for the caching lock protocol.

use std::io::Cursor;

use crate::codec::primitive::{read_string, read_u64, write_string, write_u64};
use crate::codec::Result;

pub const PROC_ACQUIRE: u32 = 0x7001;
pub const PROC_RELEASE: u32 = 0x7002;
pub const PROC_STAT: u32 = 0x7003;
pub const PROC_REVOKE: u32 = 0x8001;
pub const PROC_RETRY: u32 = 0x8002;

pub type LockId = u64;
pub type Xid = u64;

/// Status carried in the RPC reply header's `ret` field for lock
/// procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Retry,
    RpcErr,
    NoEnt,
    IoErr,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Retry => 1,
            Status::RpcErr => 2,
            Status::NoEnt => 3,
            Status::IoErr => 4,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Status::Ok,
            1 => Status::Retry,
            3 => Status::NoEnt,
            4 => Status::IoErr,
            _ => Status::RpcErr,
        }
    }
}

/// `acquire(lid, id, xid)` / `release(lid, id, xid)` argument, shared by
/// both procedures.
pub struct LockOpArg {
    pub lid: LockId,
    pub id: String,
    pub xid: Xid,
}

impl LockOpArg {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::new();
        let _ = write_u64(&mut v, self.lid);
        let _ = write_string(&mut v, &self.id);
        let _ = write_u64(&mut v, self.xid);
        v
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let lid = read_u64(&mut c)?;
        let id = read_string(&mut c)?;
        let xid = read_u64(&mut c)?;
        Ok(Self { lid, id, xid })
    }
}

pub fn encode_stat_arg(lid: LockId) -> Vec<u8> {
    let mut v = Vec::new();
    let _ = write_u64(&mut v, lid);
    v
}

pub fn decode_stat_arg(buf: &[u8]) -> Result<LockId> {
    let mut c = Cursor::new(buf);
    read_u64(&mut c)
}

pub fn encode_stat_reply(count: u64) -> Vec<u8> {
    let mut v = Vec::new();
    let _ = write_u64(&mut v, count);
    v
}

pub fn decode_stat_reply(buf: &[u8]) -> Result<u64> {
    let mut c = Cursor::new(buf);
    read_u64(&mut c)
}

/// `revoke(lid, xid)` / `retry(lid, xid)` argument, sent from server to
/// client address.
pub struct CallbackArg {
    pub lid: LockId,
    pub xid: Xid,
}

impl CallbackArg {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::new();
        let _ = write_u64(&mut v, self.lid);
        let _ = write_u64(&mut v, self.xid);
        v
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let lid = read_u64(&mut c)?;
        let xid = read_u64(&mut c)?;
        Ok(Self { lid, xid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_op_arg_round_trips() {
        let arg = LockOpArg { lid: 42, id: "10.0.0.1:9".to_string(), xid: 7 };
        let decoded = LockOpArg::decode(&arg.encode()).unwrap();
        assert_eq!(decoded.lid, 42);
        assert_eq!(decoded.id, "10.0.0.1:9");
        assert_eq!(decoded.xid, 7);
    }

    #[test]
    fn callback_arg_round_trips() {
        let arg = CallbackArg { lid: 3, xid: 9 };
        let decoded = CallbackArg::decode(&arg.encode()).unwrap();
        assert_eq!(decoded.lid, 3);
        assert_eq!(decoded.xid, 9);
    }

    #[test]
    fn status_code_round_trips() {
        for s in [Status::Ok, Status::Retry, Status::NoEnt, Status::IoErr] {
            assert_eq!(Status::from_code(s.code()), s);
        }
    }
}
