//! The NBD server core: the shared backing-file mapping, the per-connection
//! session state machine, the sparse-preserving write path, the live-mirror
//! engine, and the status snapshot. The control-socket line protocol and
//! process entry point live in the binary crate; this crate exposes the
//! operations they drive.

pub mod backing;
pub mod mirror;
pub mod server;
pub mod session;
pub mod sparse;
pub mod status;

#[cfg(target_os = "linux")]
mod extents;

pub use backing::SharedMap;
pub use mirror::{ActionAtFinish, Mirror};
pub use server::ServerInner;
pub use status::Status;
