//! Process-level wiring for `nbd-mirrord`: CLI surface, control-socket line
//! protocol, and the `serve` entry point that ties the library crates
//! together. Split out of `main.rs` so integration tests can drive a real
//! server without going through the binary.

pub mod cli;
pub mod config;
pub mod control;

use std::path::Path;

use anyhow::{Context, Result};
use nbd_core::server::{self, ServerInner};
use tokio::net::UnixListener;

use crate::cli::ServeArgs;
use crate::config::Config;

/// Default size of the fixed-capacity client table.
pub const CLIENT_TABLE_CAPACITY: usize = 16;

const DEFAULT_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 10809;

/// Opens the backing file, builds the allocation map, binds the NBD and
/// (optionally) control sockets, and runs until cancelled. The library-side
/// entry point the binary's `main` and integration tests both call into.
pub async fn serve(args: ServeArgs) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;

    let addr = args.addr.or(config.addr).unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let port = args.port.or(config.port).unwrap_or(DEFAULT_PORT);
    let file = args
        .file
        .or(config.file)
        .context("a backing file is required (--file or config)")?;
    let sock = args.sock.or(config.sock);
    let acl_specs = if !args.acl.is_empty() { args.acl } else { config.acl };

    let (backing, file_handle) = server::open_backing(Path::new(&file))
        .with_context(|| format!("opening backing file {file}"))?;

    let has_control = sock.is_some();
    let server = ServerInner::new(backing, CLIENT_TABLE_CAPACITY, has_control);
    server.init_allocation_map(&file_handle);

    if !acl_specs.is_empty() {
        match protocol::Acl::parse_all(&acl_specs, true) {
            Ok(acl) => server.replace_acl(acl),
            Err(i) => anyhow::bail!("bad ACL entry: {}", acl_specs[i]),
        }
    }

    let listen_addr = format!("{addr}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {addr}:{port}"))?;
    let listener = server::bind(listen_addr).await?;
    log::info!("listening on {listen_addr}, backing file {file}");

    let mut control_listener = None;
    if let Some(sock_path) = &sock {
        let _ = std::fs::remove_file(sock_path);
        let unix = UnixListener::bind(sock_path)
            .with_context(|| format!("binding control socket {sock_path}"))?;
        log::info!("control socket listening on {sock_path}");
        control_listener = Some(unix);
    }

    let control_task = control_listener.map(|unix: UnixListener| {
        let server = server.clone();
        tokio::spawn(control::run(server, unix))
    });

    server::accept_loop(server.clone(), listener).await;

    if let Some(task) = control_task {
        task.abort();
    }

    Ok(())
}
