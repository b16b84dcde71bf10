//! Endian-correct encode/decode for the NBD hello, request, and reply
//! frames. All multi-byte integers are big-endian on the wire.

use anyhow::{bail, Result};

pub const HELLO_PASSWD: &[u8; 8] = b"NBDMAGIC";
pub const HELLO_MAGIC: u64 = 0x00420281861253;
pub const HELLO_LEN: usize = 152;

pub const REQUEST_MAGIC: u32 = 0x25609513;
pub const REQUEST_LEN: usize = 28;

pub const REPLY_MAGIC: u32 = 0x67446698;
pub const REPLY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Read,
    Write,
    Disconnect,
}

impl TryFrom<u32> for RequestType {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Read,
            1 => Self::Write,
            2 => Self::Disconnect,
            other => bail!("unknown NBD request type {other}"),
        })
    }
}

impl From<RequestType> for u32 {
    fn from(value: RequestType) -> Self {
        match value {
            RequestType::Read => 0,
            RequestType::Write => 1,
            RequestType::Disconnect => 2,
        }
    }
}

/// The server-to-client hello sent once, immediately after accept.
#[derive(Debug, Clone, Copy)]
pub struct Hello {
    pub size: u64,
}

impl Hello {
    pub fn encode(&self) -> [u8; HELLO_LEN] {
        let mut buf = [0u8; HELLO_LEN];
        buf[0..8].copy_from_slice(HELLO_PASSWD);
        buf[8..16].copy_from_slice(&HELLO_MAGIC.to_be_bytes());
        buf[16..24].copy_from_slice(&self.size.to_be_bytes());
        // bytes 24..152 are reserved and stay zero.
        buf
    }

    pub fn decode(buf: &[u8; HELLO_LEN]) -> Result<Self> {
        if &buf[0..8] != HELLO_PASSWD {
            bail!("bad NBD hello passwd");
        }
        let magic = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        if magic != HELLO_MAGIC {
            bail!("bad NBD hello magic");
        }
        let size = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        Ok(Self { size })
    }
}

/// A client-to-server request (28 bytes on the wire).
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub ty: RequestType,
    pub handle: [u8; 8],
    pub offset: u64,
    pub len: u32,
}

impl Request {
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&u32::from(self.ty).to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle);
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// Decodes a request frame. A bad magic is reported as an error: callers
    /// must treat this as protocol-fatal and close the connection without a
    /// reply.
    pub fn decode(buf: &[u8; REQUEST_LEN]) -> Result<Self> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != REQUEST_MAGIC {
            bail!("bad NBD request magic");
        }

        let ty_raw = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let ty = RequestType::try_from(ty_raw)?;
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&buf[8..16]);
        let offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let len = u32::from_be_bytes(buf[24..28].try_into().unwrap());

        Ok(Self {
            ty,
            handle,
            offset,
            len,
        })
    }
}

/// A server-to-client reply header (16 bytes), optionally followed by
/// `len` bytes of read data.
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub error: u32,
    pub handle: [u8; 8],
}

impl Reply {
    pub fn ok(handle: [u8; 8]) -> Self {
        Self { error: 0, handle }
    }

    pub fn error(error: u32, handle: [u8; 8]) -> Self {
        Self { error, handle }
    }

    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let mut buf = [0u8; REPLY_LEN];
        buf[0..4].copy_from_slice(&REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle);
        buf
    }

    pub fn decode(buf: &[u8; REPLY_LEN]) -> Result<Self> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != REPLY_MAGIC {
            bail!("bad NBD reply magic");
        }
        let error = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&buf[8..16]);
        Ok(Self { error, handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips_and_matches_the_wire_layout() {
        let hello = Hello { size: 1_048_576 };
        let buf = hello.encode();

        assert_eq!(&buf[0..8], b"NBDMAGIC");
        assert_eq!(
            u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            HELLO_MAGIC
        );
        assert_eq!(
            u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            1_048_576
        );
        assert!(buf[24..152].iter().all(|&b| b == 0));

        let decoded = Hello::decode(&buf).unwrap();
        assert_eq!(decoded.size, 1_048_576);
    }

    #[test]
    fn hello_rejects_bad_passwd() {
        let mut buf = Hello { size: 1 }.encode();
        buf[0] = b'X';
        assert!(Hello::decode(&buf).is_err());
    }

    #[test]
    fn request_round_trips() {
        let req = Request {
            ty: RequestType::Write,
            handle: [1, 2, 3, 4, 5, 6, 7, 8],
            offset: 4096,
            len: 512,
        };
        let buf = req.encode();
        let decoded = Request::decode(&buf).unwrap();
        assert_eq!(decoded.ty, RequestType::Write);
        assert_eq!(decoded.handle, req.handle);
        assert_eq!(decoded.offset, 4096);
        assert_eq!(decoded.len, 512);
    }

    #[test]
    fn request_rejects_bad_magic() {
        let mut buf = Request {
            ty: RequestType::Read,
            handle: [0; 8],
            offset: 0,
            len: 0,
        }
        .encode();
        buf[0] ^= 0xFF;
        assert!(Request::decode(&buf).is_err());
    }

    #[test]
    fn reply_round_trips() {
        let reply = Reply::ok([9; 8]);
        let buf = reply.encode();
        let decoded = Reply::decode(&buf).unwrap();
        assert_eq!(decoded.error, 0);
        assert_eq!(decoded.handle, [9; 8]);
    }
}
