//! The server: listening socket, client table, ACL-protected dispatch,
//! allocation-map lifetime, and the surface the control server (implemented
//! by the binary crate) drives.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use anyhow::{Context, Result};
use bitset::AllocationMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use protocol::Acl;
use protocol::io::Client;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backing::SharedMap;
use crate::mirror::{self, ActionAtFinish, Mirror};
use crate::session;
use crate::status::Status;

#[cfg(target_os = "linux")]
use crate::extents::LinuxExtentSource;

/// Shared server state, reached through `Arc<ServerInner>` by every session
/// task and the mirror task: an owning, reference-counted handle, with
/// non-owning back-references from the tasks it spawns rather than a cycle.
pub struct ServerInner {
    pub backing: SharedMap,
    pub size: u64,
    pub allocation_map: RwLock<Option<AllocationMap>>,
    pub acl: RwLock<Acl>,
    pub mirror: AsyncMutex<Option<Arc<Mirror>>>,
    /// Guards the dirty map: held for a single chunk by non-final mirror
    /// passes, held for the whole pass by the final one, and acquired
    /// briefly by session writes before they mark a range dirty.
    pub io_lock: AsyncMutex<()>,
    pub cancel: CancellationToken,
    pub has_control: bool,

    // Best-effort status fields, captured under no lock.
    pub is_mirroring: AtomicBool,
    pub migration_pass: AtomicUsize,

    clients: SyncMutex<AHashMap<u64, (JoinHandle<()>, CancellationToken)>>,
    client_capacity: usize,
    next_client_id: AtomicU64,
}

impl ServerInner {
    pub fn new(backing: SharedMap, client_capacity: usize, has_control: bool) -> Arc<Self> {
        let size = backing.size();
        Arc::new(Self {
            backing,
            size,
            allocation_map: RwLock::new(None),
            acl: RwLock::new(Acl::default()),
            mirror: AsyncMutex::new(None),
            io_lock: AsyncMutex::new(()),
            cancel: CancellationToken::new(),
            has_control,
            is_mirroring: AtomicBool::new(false),
            migration_pass: AtomicUsize::new(0),
            clients: SyncMutex::new(AHashMap::new()),
            client_capacity,
            next_client_id: AtomicU64::new(0),
        })
    }

    /// Builds the allocation map from the backing file's extent map. On
    /// non-Linux targets (or if the syscall fails), the map is disabled and
    /// every write is treated as needing allocation — correct, just unable
    /// to skip the all-zero fast path.
    pub fn init_allocation_map(&self, file: &std::fs::File) {
        #[cfg(target_os = "linux")]
        let map = AllocationMap::build(self.size, &LinuxExtentSource::new(file));
        #[cfg(not(target_os = "linux"))]
        let map = {
            let _ = file;
            None
        };

        if map.is_none() {
            log::warn!("allocation map disabled: extent information unavailable");
        }

        *self.allocation_map.write() = map;
    }

    pub fn replace_acl(&self, acl: Acl) {
        *self.acl.write() = acl;
    }

    pub fn status(&self) -> Status {
        Status {
            pid: std::process::id(),
            size: self.size,
            is_mirroring: self.is_mirroring.load(Ordering::Relaxed),
            has_control: self.has_control,
            migration_pass: self.migration_pass.load(Ordering::Relaxed),
        }
    }

    /// Installs and launches a mirror to `upstream`, unless one is already
    /// active — only one mirror runs at a time.
    pub async fn start_mirror(self: &Arc<Self>, upstream: Client, action: ActionAtFinish) -> Result<()> {
        let mut slot = self.mirror.lock().await;
        if slot.is_some() {
            anyhow::bail!("a mirror is already running");
        }

        let handle = Arc::new(Mirror::new(self.size));
        *slot = Some(handle.clone());
        drop(slot);

        let server = self.clone();
        tokio::spawn(async move {
            mirror::run(server, handle, upstream, action).await;
        });

        Ok(())
    }

    /// Signals every live session to stop at its next request boundary and
    /// joins them all — one loop, signalling and joining each slot in turn.
    pub async fn close_all_sessions(&self) {
        let entries: Vec<(JoinHandle<()>, CancellationToken)> =
            std::mem::take(&mut *self.clients.lock()).into_values().collect();

        for (_, token) in &entries {
            token.cancel();
        }
        for (handle, _) in entries {
            let _ = handle.await;
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn accept(self: Arc<Self>, mut socket: TcpStream, peer: SocketAddr) {
        if !self.acl.read().includes(&peer.ip()) {
            log::info!("rejecting {peer}: access control error");
            let _ = socket.write_all(b"Access control error").await;
            return;
        }

        {
            let mut clients = self.clients.lock();
            clients.retain(|_, (handle, _)| !handle.is_finished());
            if clients.len() >= self.client_capacity {
                drop(clients);
                log::warn!("rejecting {peer}: client table full");
                let _ = socket.write_all(b"Too many clients").await;
                return;
            }
        }

        let token = CancellationToken::new();
        let child_token = token.clone();
        let server = self.clone();
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);

        log::info!("accepted client {peer}");
        let handle = tokio::spawn(async move {
            if let Err(e) = session::run(server, socket, peer, child_token).await {
                log::warn!("session {peer} ended: {e:?}");
            } else {
                log::info!("session {peer} closed");
            }
        });

        self.clients.lock().insert(id, (handle, token));
    }
}

/// Binds the NBD listen socket with address reuse. `TCP_NODELAY` is set
/// per-connection in `session::run`.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true).ok();
    socket.bind(addr).with_context(|| format!("binding {addr}"))?;
    socket
        .listen(1024)
        .with_context(|| format!("listening on {addr}"))
}

pub fn open_backing(path: &Path) -> Result<(SharedMap, std::fs::File)> {
    SharedMap::open(path)
}

/// The accept loop: on the server's close signal, stop every live session
/// and return; otherwise accept and dispatch.
pub async fn accept_loop(server: Arc<ServerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            biased;
            _ = server.cancel.cancelled() => {
                log::info!("nbd listener closing");
                server.close_all_sessions().await;
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        socket.set_nodelay(true).ok();
                        server.clone().accept(socket, peer).await;
                    }
                    Err(e) => log::warn!("accept failed: {e:?}"),
                }
            }
        }
    }
}
