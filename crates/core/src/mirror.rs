//! The live-mirror engine: a multi-pass dirty-map replicator
//! that converges write traffic toward quiescence, then freezes I/O for a
//! final consistent pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitset::{Bitset, PAGE_SIZE};
use parking_lot::Mutex;
use protocol::io::Client;

use crate::server::ServerInner;

pub const LONGEST_WRITE: u64 = 8 * 1024 * 1024;
pub const LAST_PASS_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const MAX_PASSES: usize = 7;

/// What the mirror does to the server once it finishes successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionAtFinish {
    Exit,
    Nothing,
}

/// Shared state of a running mirror: the dirty map client writes mark and
/// the mirror clears, and a cooperative abandon flag for early shutdown.
pub struct Mirror {
    dirty: Mutex<Bitset>,
    abandon: AtomicBool,
}

impl Mirror {
    pub fn new(size: u64) -> Self {
        let mut dirty = Bitset::alloc(size, PAGE_SIZE);
        dirty.set_all();
        Self {
            dirty: Mutex::new(dirty),
            abandon: AtomicBool::new(false),
        }
    }

    /// Marks `[off, off+len)` dirty. Callers must hold the server's I/O
    /// lock while calling this: session writes acquire that lock before
    /// touching the dirty map, so marking and clearing never race.
    pub fn mark_dirty(&self, off: u64, len: u64) {
        self.dirty.lock().set_range(off, len);
    }

    pub fn abandon(&self) {
        self.abandon.store(true, Ordering::Relaxed);
    }
}

/// Runs the mirror to completion (or abandonment), replicating `server`'s
/// backing file to `upstream`. Installs itself into `server.migration_pass`
/// / `server.is_mirroring` for best-effort status reads, and clears
/// `server.mirror` on exit so a subsequent `mirror` control command can
/// start a new one.
pub async fn run(server: Arc<ServerInner>, mirror: Arc<Mirror>, mut upstream: Client, action: ActionAtFinish) {
    let size = server.size;
    server.is_mirroring.store(true, Ordering::Relaxed);

    let mut pass = 0usize;
    let mut abandoned = false;

    loop {
        if pass >= MAX_PASSES {
            break;
        }

        let is_final = pass == MAX_PASSES - 1;
        server.migration_pass.store(pass, Ordering::Relaxed);
        log::debug!("mirror pass {pass} (final={is_final})");

        // The final pass holds l_io for its entire duration, freezing
        // client writes so the destination ends up byte-identical.
        let final_guard = if is_final {
            Some(server.io_lock.lock().await)
        } else {
            None
        };

        let mut current = 0u64;
        let mut written = 0u64;

        while current < size {
            let (run, dirty) = {
                let d = mirror.dirty.lock();
                let run = d.run_count(current, LONGEST_WRITE).min(size - current);
                (run, d.is_set_at(current))
            };

            if dirty {
                // Earlier passes take l_io only for the one chunk being
                // shipped, so client sessions stay live in between.
                let chunk_guard = if !is_final {
                    Some(server.io_lock.lock().await)
                } else {
                    None
                };

                let data = unsafe { server.backing.slice(current, run) };
                match upstream.write(current, data).await {
                    Ok(()) => {
                        mirror.dirty.lock().clear_range(current, run);
                        written += run;
                    }
                    Err(e) => {
                        log::warn!("mirror: upstream write failed: {e:?}");
                        abandoned = true;
                    }
                }

                drop(chunk_guard);
            }

            current += run;

            if abandoned || mirror.abandon.load(Ordering::Relaxed) {
                abandoned = true;
                break;
            }
        }

        drop(final_guard);

        if abandoned {
            break;
        }

        if !is_final && written < LAST_PASS_THRESHOLD {
            // Promote: the next iteration runs the final, frozen pass
            // directly rather than walking the remaining intermediate
            // passes, which would just re-measure the same convergence.
            pass = MAX_PASSES - 1;
        } else {
            pass += 1;
        }
    }

    if !abandoned {
        match action {
            ActionAtFinish::Exit => {
                log::info!("mirror complete, closing server");
                server.cancel.cancel();
            }
            ActionAtFinish::Nothing => {
                log::info!("mirror complete");
            }
        }
    } else {
        log::info!("mirror abandoned");
    }

    let _ = upstream.disconnect().await;
    server.is_mirroring.store(false, Ordering::Relaxed);
    *server.mirror.lock().await = None;
}
