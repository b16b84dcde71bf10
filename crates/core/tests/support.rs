use std::net::SocketAddr;
use std::sync::Arc;

use nbd_core::server::{self, ServerInner};
use tempfile::NamedTempFile;
use tokio::net::TcpListener;

/// A running server bound to a loopback port, backed by a scratch file.
/// Dropping the `NamedTempFile` deletes the backing file; keep it alive for
/// as long as the server runs.
pub struct Harness {
    pub server: Arc<ServerInner>,
    pub addr: SocketAddr,
    pub file: NamedTempFile,
}

pub async fn spawn_server(size: u64) -> Harness {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(size).unwrap();

    let (backing, fd) = server::open_backing(file.path()).unwrap();
    let server = ServerInner::new(backing, 16, false);
    server.init_allocation_map(&fd);

    let listener: TcpListener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(server::accept_loop(server.clone(), listener));

    Harness { server, addr, file }
}
