//! The per-connection client session: `HELLO`, then a loop
//! reading requests and serving `READ`/`WRITE`/`DISCONNECT` until the
//! client closes, a fatal protocol error occurs, or the server signals a
//! stop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::frame::{Reply, RequestType};
use protocol::io::{read_request, write_hello, write_reply, RequestRead};
use protocol::Hello;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::server::ServerInner;
use crate::sparse;

/// Serves one accepted NBD client against the shared backing file. Returns
/// `Ok(())` on a clean close (client disconnect, EOF, or server stop) and
/// `Err` on a protocol-fatal condition.
pub async fn run(
    server: Arc<ServerInner>,
    mut socket: TcpStream,
    peer: SocketAddr,
    stop: CancellationToken,
) -> Result<()> {
    write_hello(&mut socket, &Hello { size: server.size })
        .await
        .context("writing hello")?;

    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                log::debug!("session {peer}: stop signalled");
                return Ok(());
            }
            read = read_request(&mut socket) => read,
        };

        let request = match read? {
            RequestRead::Eof => return Ok(()),
            RequestRead::Request(r) => r,
        };

        match request.ty {
            RequestType::Disconnect => {
                log::debug!("session {peer}: client disconnect");
                return Ok(());
            }

            RequestType::Read => {
                if out_of_range(server.size, request.offset, request.len) {
                    write_reply(&mut socket, &Reply::error(1, request.handle)).await?;
                    continue;
                }

                write_reply(&mut socket, &Reply::ok(request.handle)).await?;
                let data = unsafe { server.backing.slice(request.offset, request.len as u64) };
                socket.write_all(data).await.context("streaming read data")?;
            }

            RequestType::Write => {
                if out_of_range(server.size, request.offset, request.len) {
                    write_reply(&mut socket, &Reply::error(1, request.handle)).await?;
                    continue;
                }

                let has_allocation_map = server.allocation_map.read().is_some();
                if has_allocation_map {
                    sparse::sparse_write(
                        &server.backing,
                        &server.allocation_map,
                        request.offset,
                        request.len as u64,
                        &mut socket,
                    )
                    .await
                    .context("sparse write")?;
                } else {
                    let dst = unsafe { server.backing.slice_mut(request.offset, request.len as u64) };
                    socket.read_exact(dst).await.context("write payload")?;
                }

                let active_mirror = server.mirror.lock().await.clone();
                if let Some(mirror) = active_mirror {
                    let _guard = server.io_lock.lock().await;
                    mirror.mark_dirty(request.offset, request.len as u64);
                }

                write_reply(&mut socket, &Reply::ok(request.handle)).await?;
            }
        }
    }
}

fn out_of_range(size: u64, offset: u64, len: u32) -> bool {
    match offset.checked_add(len as u64) {
        Some(end) => end > size,
        None => true,
    }
}
