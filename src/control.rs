//! The control-socket line protocol: a local stream socket accepting
//! newline-terminated command blocks — a command line followed by zero or
//! more argument lines, terminated by a blank line — and replying with
//! `code: message\n`.
//!
//! Three commands are served: `acl`, `mirror`, and `status`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use nbd_core::server::ServerInner;
use nbd_core::ActionAtFinish;
use protocol::io::Client;
use protocol::Acl;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Dials a running server's control socket, sends `command` followed by one
/// `args` line each and a terminating blank line, and returns the reply
/// verbatim. Used by the `acl`, `mirror`, and `status` CLI subcommands,
/// which are thin control-protocol clients rather than a separate wire
/// format.
pub async fn send_command(sock_path: &str, command: &str, args: &[String]) -> Result<String> {
    let mut stream = UnixStream::connect(sock_path)
        .await
        .with_context(|| format!("connecting to control socket {sock_path}"))?;

    stream.write_all(command.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    for arg in args {
        stream.write_all(arg.as_bytes()).await?;
        stream.write_all(b"\n").await?;
    }
    stream.write_all(b"\n").await?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    Ok(reply)
}

/// Accepts control connections until the server is cancelled. Each
/// connection is handled to completion before the next is accepted — the
/// control protocol is low-volume and synchronous by nature (one command,
/// one reply, close), so a connection-per-task model buys nothing here.
pub async fn run(server: Arc<ServerInner>, listener: UnixListener) {
    loop {
        tokio::select! {
            biased;
            _ = server.cancel.cancelled() => {
                log::info!("control listener closing");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(server, stream).await {
                                log::warn!("control connection error: {e:?}");
                            }
                        });
                    }
                    Err(e) => log::warn!("control accept failed: {e:?}"),
                }
            }
        }
    }
}

async fn handle_connection(server: Arc<ServerInner>, stream: UnixStream) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            // EOF before a blank line: nothing to dispatch.
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
        if trimmed.is_empty() {
            break;
        }
        lines.push(trimmed);
    }

    if lines.is_empty() {
        return Ok(());
    }

    let command = lines[0].as_str();
    let args = &lines[1..];

    let reply = match command {
        "acl" => handle_acl(&server, args),
        "mirror" => handle_mirror(&server, args).await,
        "status" => handle_status(&server),
        other => format!("1: unknown command: {other}\n"),
    };

    write_half.write_all(reply.as_bytes()).await?;
    Ok(())
}

/// `acl <entry>*`: each argument line is one CIDR entry. On the first parse
/// failure the ACL is left unchanged and the offending line is echoed back.
/// On success the new ACL replaces the old one under the server's lock and
/// `default_deny = true`: explicitly installing an ACL means only the
/// listed ranges are admitted from then on (see DESIGN.md).
fn handle_acl(server: &Arc<ServerInner>, args: &[String]) -> String {
    match Acl::parse_all(args, true) {
        Ok(acl) => {
            server.replace_acl(acl);
            "0: updated\n".to_string()
        }
        Err(i) => format!("1: bad spec: {}\n", args[i]),
    }
}

/// `mirror <ip> <port> [<bind_ip> [<bps_limit> [exit|nothing]]]`, one value
/// per argument line: `args[0]` = ip, `args[1]` = port, `args[2]` =
/// optional bind address, `args[3]` = optional rate limit (accepted, never
/// enforced), `args[4]` = optional `exit`/`nothing`. Defaults to `exit`
/// when omitted, matching `control.c`'s `action_at_finish = ACTION_EXIT`
/// initialization (see DESIGN.md).
async fn handle_mirror(server: &Arc<ServerInner>, args: &[String]) -> String {
    if args.len() < 2 {
        return "1: mirror requires at least <ip> and <port>\n".to_string();
    }

    let ip = args[0].as_str();
    let port = match args[1].parse::<u16>() {
        Ok(p) => p,
        Err(_) => return format!("1: bad port: {}\n", args[1]),
    };
    let upstream_addr: SocketAddr = match format!("{ip}:{port}").parse() {
        Ok(a) => a,
        Err(_) => return format!("1: bad address: {ip}:{port}\n"),
    };

    let action = match args.get(4).map(String::as_str) {
        Some("exit") | None => ActionAtFinish::Exit,
        Some("nothing") => ActionAtFinish::Nothing,
        Some(other) => return format!("1: bad action: {other}\n"),
    };

    // One connection attempt, no retry loop — a failure here fails the
    // control command immediately.
    let connect_result = match args.get(2) {
        Some(bind_ip) => {
            let bind_addr: SocketAddr = match format!("{bind_ip}:0").parse() {
                Ok(a) => a,
                Err(_) => return format!("1: bad bind address: {bind_ip}\n"),
            };
            Client::connect_from(upstream_addr, bind_addr).await
        }
        None => Client::connect(upstream_addr).await,
    };

    let upstream = match connect_result {
        Ok(c) => c,
        Err(e) => return format!("1: connect failed: {e}\n"),
    };

    match server.start_mirror(upstream, action).await {
        Ok(()) => "0: mirror started\n".to_string(),
        Err(e) => format!("1: {e}\n"),
    }
}

/// `status`: renders the current status snapshot as the reply body.
fn handle_status(server: &Arc<ServerInner>) -> String {
    server.status().render()
}
