#[global_allocator]
#[cfg(not(feature = "system_allocator"))]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::io::{Read, Write};

use anyhow::{Context, Result};
use clap::Parser;
use nbd_mirrord::cli::{AclArgs, Cli, Command, MirrorArgs, ReadArgs, StatusArgs, WriteArgs};
use nbd_mirrord::control;
use protocol::io::Client;

#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    match Cli::parse().command {
        Command::Serve(args) => nbd_mirrord::serve(args).await,
        Command::Read(args) => read(args).await,
        Command::Write(args) => write(args).await,
        Command::Acl(args) => acl(args).await,
        Command::Mirror(args) => mirror(args).await,
        Command::Status(args) => status(args).await,
    }
}

/// `read`: a thin NBD client used for scripted reads against a running
/// server, built on the same `protocol::io::Client` the mirror engine's
/// upstream leg uses.
async fn read(args: ReadArgs) -> Result<()> {
    let addr = format!("{}:{}", args.addr, args.port).parse()?;
    let mut client = Client::connect(addr).await.context("connecting to server")?;
    let data = client.read(args.from, args.size).await?;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

/// `write`: reads the entirety of stdin and issues one NBD write at `from`.
async fn write(args: WriteArgs) -> Result<()> {
    let addr = format!("{}:{}", args.addr, args.port).parse()?;
    let mut client = Client::connect(addr).await.context("connecting to server")?;

    let mut data = Vec::new();
    std::io::stdin().read_to_end(&mut data)?;
    client.write(args.from, &data).await?;
    Ok(())
}

async fn acl(args: AclArgs) -> Result<()> {
    let reply = control::send_command(&args.sock, "acl", &args.entries).await?;
    print!("{reply}");
    Ok(())
}

async fn mirror(args: MirrorArgs) -> Result<()> {
    let mut lines = vec![args.ip, args.port.to_string()];
    if let Some(bind_ip) = args.bind_ip {
        lines.push(bind_ip);
        if let Some(bps_limit) = args.bps_limit {
            lines.push(bps_limit.to_string());
            if let Some(action) = args.action {
                lines.push(action);
            }
        }
    }

    let reply = control::send_command(&args.sock, "mirror", &lines).await?;
    print!("{reply}");
    Ok(())
}

async fn status(args: StatusArgs) -> Result<()> {
    let reply = control::send_command(&args.sock, "status", &[]).await?;
    print!("{reply}");
    Ok(())
}
