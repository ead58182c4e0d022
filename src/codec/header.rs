//! Request and reply header layout.

use std::io::{Read, Write};

use super::primitive::{read_i32, read_u32, write_i32, write_u32};
use super::Result;

/// Fixed-layout prefix carried by every request payload:
/// `xid(4) | proc(4) | clt_nonce(4) | srv_nonce(4) | xid_rep(4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Per-destination transaction id. Stable across retransmissions of
    /// the same logical call.
    pub xid: u32,
    /// Procedure number identifying which handler should run.
    pub proc: u32,
    /// Nonzero client incarnation id; zero means no at-most-once
    /// guarantees are requested.
    pub clt_nonce: u32,
    /// The server incarnation the client believes it is bound to.
    pub srv_nonce: u32,
    /// Highest xid for which the client has already seen a reply —
    /// lets the server trim its reply window.
    pub xid_rep: u32,
}

impl RequestHeader {
    /// Size of the encoded header, in bytes.
    pub const ENCODED_LEN: usize = 20;

    /// Decodes a header from the front of `src`.
    pub fn decode(src: &mut impl Read) -> Result<Self> {
        Ok(Self {
            xid: read_u32(src)?,
            proc: read_u32(src)?,
            clt_nonce: read_u32(src)?,
            srv_nonce: read_u32(src)?,
            xid_rep: read_u32(src)?,
        })
    }

    /// Encodes the header to `dst`.
    pub fn encode(&self, dst: &mut impl Write) -> Result<()> {
        write_u32(dst, self.xid)?;
        write_u32(dst, self.proc)?;
        write_u32(dst, self.clt_nonce)?;
        write_u32(dst, self.srv_nonce)?;
        write_u32(dst, self.xid_rep)?;
        Ok(())
    }
}

/// Fixed-layout prefix carried by every reply payload: `xid(4) |
/// ret(4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    /// Echoes the request's xid so the client can match the reply to an
    /// in-flight call.
    pub xid: u32,
    /// The server's integer status, or a negative RPC sentinel.
    pub ret: i32,
}

impl ReplyHeader {
    /// Size of the encoded header, in bytes.
    pub const ENCODED_LEN: usize = 8;

    /// Decodes a header from the front of `src`.
    pub fn decode(src: &mut impl Read) -> Result<Self> {
        Ok(Self { xid: read_u32(src)?, ret: read_i32(src)? })
    }

    /// Encodes the header to `dst`.
    pub fn encode(&self, dst: &mut impl Write) -> Result<()> {
        write_u32(dst, self.xid)?;
        write_i32(dst, self.ret)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_header_round_trips() {
        let h = RequestHeader { xid: 1, proc: 0x7001, clt_nonce: 42, srv_nonce: 99, xid_rep: 0 };
        let mut buf = Vec::new();
        h.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), RequestHeader::ENCODED_LEN);
        let mut cursor = Cursor::new(buf);
        assert_eq!(RequestHeader::decode(&mut cursor).unwrap(), h);
    }

    #[test]
    fn reply_header_round_trips_negative_status() {
        let h = ReplyHeader { xid: 7, ret: -4 };
        let mut buf = Vec::new();
        h.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), ReplyHeader::ENCODED_LEN);
        let mut cursor = Cursor::new(buf);
        assert_eq!(ReplyHeader::decode(&mut cursor).unwrap(), h);
    }
}
