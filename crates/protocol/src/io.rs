//! Async helpers to read/write NBD frames over any `AsyncRead`/`AsyncWrite`
//! stream, plus a small client used by the mirror engine's upstream leg and
//! by the `read`/`write` CLI helpers.

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::frame::{Hello, Reply, Request, RequestType, HELLO_LEN, REPLY_LEN, REQUEST_LEN};

pub async fn write_hello<W: AsyncWriteExt + Unpin>(w: &mut W, hello: &Hello) -> Result<()> {
    w.write_all(&hello.encode()).await?;
    Ok(())
}

pub async fn read_hello<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Hello> {
    let mut buf = [0u8; HELLO_LEN];
    r.read_exact(&mut buf).await.context("short read on hello")?;
    Hello::decode(&buf)
}

/// The outcome of trying to read one request frame.
pub enum RequestRead {
    Request(Request),
    /// Clean close: zero bytes were read before EOF.
    Eof,
}

/// Reads one 28-byte request frame. A bad magic or a short read (some but
/// not all of the 28 bytes available before EOF) is protocol-fatal and
/// returned as `Err`; callers must close the connection without a reply.
pub async fn read_request<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<RequestRead> {
    let mut buf = [0u8; REQUEST_LEN];
    let mut read = 0usize;

    while read < REQUEST_LEN {
        let n = r.read(&mut buf[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(RequestRead::Eof);
            }
            anyhow::bail!("short read on request frame ({read}/{REQUEST_LEN} bytes)");
        }
        read += n;
    }

    Ok(RequestRead::Request(Request::decode(&buf)?))
}

pub async fn write_reply<W: AsyncWriteExt + Unpin>(w: &mut W, reply: &Reply) -> Result<()> {
    w.write_all(&reply.encode()).await?;
    Ok(())
}

pub async fn read_reply<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Reply> {
    let mut buf = [0u8; REPLY_LEN];
    r.read_exact(&mut buf).await.context("short read on reply")?;
    Reply::decode(&buf)
}

/// A minimal NBD client: connects, reads the hello, and issues WRITE
/// requests. Used by the mirror engine to replicate ranges to the peer
/// server, and by the `write` CLI helper.
pub struct Client {
    stream: TcpStream,
    pub size: u64,
    next_handle: u64,
}

impl Client {
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        stream.set_nodelay(true).ok();
        let hello = read_hello(&mut stream).await.context("reading upstream hello")?;

        Ok(Self {
            stream,
            size: hello.size,
            next_handle: 0,
        })
    }

    pub async fn connect_from(
        addr: std::net::SocketAddr,
        bind: std::net::SocketAddr,
    ) -> Result<Self> {
        let socket = if bind.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true).ok();
        socket.bind(bind)?;
        let mut stream = socket.connect(addr).await.with_context(|| format!("connecting to {addr}"))?;
        stream.set_nodelay(true).ok();
        let hello = read_hello(&mut stream).await.context("reading upstream hello")?;

        Ok(Self {
            stream,
            size: hello.size,
            next_handle: 0,
        })
    }

    fn handle(&mut self) -> [u8; 8] {
        let h = self.next_handle.to_be_bytes();
        self.next_handle = self.next_handle.wrapping_add(1);
        h
    }

    /// Writes `data` at `offset` and waits for the success reply.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let handle = self.handle();
        let req = Request {
            ty: RequestType::Write,
            handle,
            offset,
            len: data.len() as u32,
        };
        self.stream.write_all(&req.encode()).await?;
        self.stream.write_all(data).await?;

        let reply = read_reply(&mut self.stream).await?;
        if reply.error != 0 {
            anyhow::bail!("upstream write rejected: error={}", reply.error);
        }
        Ok(())
    }

    /// Reads `len` bytes starting at `offset` and waits for the reply.
    pub async fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let handle = self.handle();
        let req = Request {
            ty: RequestType::Read,
            handle,
            offset,
            len,
        };
        self.stream.write_all(&req.encode()).await?;

        let reply = read_reply(&mut self.stream).await?;
        if reply.error != 0 {
            anyhow::bail!("upstream read rejected: error={}", reply.error);
        }

        let mut data = vec![0u8; len as usize];
        self.stream.read_exact(&mut data).await?;
        Ok(data)
    }

    pub async fn disconnect(mut self) -> Result<()> {
        let req = Request {
            ty: RequestType::Disconnect,
            handle: [0; 8],
            offset: 0,
            len: 0,
        };
        self.stream.write_all(&req.encode()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn request_round_trip_over_a_stream() {
        let (mut a, mut b) = duplex(64);

        let req = Request {
            ty: RequestType::Read,
            handle: [1; 8],
            offset: 10,
            len: 20,
        };
        a.write_all(&req.encode()).await.unwrap();

        match read_request(&mut b).await.unwrap() {
            RequestRead::Request(decoded) => {
                assert_eq!(decoded.offset, 10);
                assert_eq!(decoded.len, 20);
            }
            RequestRead::Eof => panic!("expected a request"),
        }
    }

    #[tokio::test]
    async fn clean_eof_with_no_bytes_is_reported_distinctly() {
        let (a, mut b) = duplex(64);
        drop(a);
        match read_request(&mut b).await.unwrap() {
            RequestRead::Eof => {}
            RequestRead::Request(_) => panic!("expected EOF"),
        }
    }

    #[tokio::test]
    async fn short_read_is_an_error() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        assert!(read_request(&mut b).await.is_err());
    }
}
