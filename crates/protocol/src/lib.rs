//! Wire-level pieces of the NBD protocol: the initial hello, the request and
//! reply frames, and a small async client used both by the `read`/`write`
//! helper commands and by the mirror engine's upstream leg.
//!
//! Also hosts the ACL matcher, since admission control is a property of the
//! same connection lifecycle this crate frames.

pub mod acl;
pub mod frame;
pub mod io;

pub use acl::{Acl, AclEntry, Family};
pub use frame::{Hello, Reply, Request, RequestType};
