//! The CLI surface: `serve`, `read`, `write`, `acl`, `mirror`, `status`
//! subcommands over a shared set of `--addr/-l`, `--port/-p`, `--file/-f`,
//! `--sock/-s`, `--from/-F`, `--size/-S` flags.

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "nbd-mirrord",
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the NBD server against a backing file.
    Serve(ServeArgs),
    /// Read a range from a running server and write it to stdout.
    Read(ReadArgs),
    /// Write stdin to a range on a running server.
    Write(WriteArgs),
    /// Replace the ACL of a running server via its control socket.
    Acl(AclArgs),
    /// Start a live mirror to a peer server via the control socket.
    Mirror(MirrorArgs),
    /// Print the status of a running server via its control socket.
    Status(StatusArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on for NBD clients. Defaults to 0.0.0.0 unless
    /// overridden by a config file.
    #[arg(long = "addr", short = 'l')]
    pub addr: Option<String>,

    /// Port to listen on for NBD clients. Defaults to 10809 unless
    /// overridden by a config file.
    #[arg(long = "port", short = 'p')]
    pub port: Option<u16>,

    /// Path to the backing file exposed as the block device.
    #[arg(long = "file", short = 'f')]
    pub file: Option<String>,

    /// Path to the control-socket (UNIX domain). Omit to disable the
    /// control server.
    #[arg(long = "sock", short = 's')]
    pub sock: Option<String>,

    /// Optional JSON5 config file supplying defaults for any flag not
    /// given on the command line.
    #[arg(long = "config")]
    pub config: Option<String>,

    /// Initial ACL entries (CIDR specs), e.g. `10.0.0.0/8`. Empty means
    /// default-allow, matching a freshly started server before any `acl`
    /// control command has run.
    pub acl: Vec<String>,
}

#[derive(Args)]
pub struct ReadArgs {
    /// Address of the running server.
    #[arg(long = "addr", short = 'l', default_value = "127.0.0.1")]
    pub addr: String,

    /// Port of the running server.
    #[arg(long = "port", short = 'p', default_value_t = 10809)]
    pub port: u16,

    /// Byte offset to read from.
    #[arg(long = "from", short = 'F', default_value_t = 0)]
    pub from: u64,

    /// Number of bytes to read.
    #[arg(long = "size", short = 'S')]
    pub size: u32,
}

#[derive(Args)]
pub struct WriteArgs {
    /// Address of the running server.
    #[arg(long = "addr", short = 'l', default_value = "127.0.0.1")]
    pub addr: String,

    /// Port of the running server.
    #[arg(long = "port", short = 'p', default_value_t = 10809)]
    pub port: u16,

    /// Byte offset to write at.
    #[arg(long = "from", short = 'F', default_value_t = 0)]
    pub from: u64,
}

#[derive(Args)]
pub struct AclArgs {
    /// Path to the running server's control socket.
    #[arg(long = "sock", short = 's')]
    pub sock: String,

    /// New ACL entries (CIDR specs) to install, replacing the current ACL.
    pub entries: Vec<String>,
}

#[derive(Args)]
pub struct MirrorArgs {
    /// Path to the running server's control socket.
    #[arg(long = "sock", short = 's')]
    pub sock: String,

    /// Peer server address to mirror to.
    pub ip: String,

    /// Peer server port to mirror to.
    pub port: u16,

    /// Local address to bind the mirror's upstream connection to.
    pub bind_ip: Option<String>,

    /// Rate limit in bytes/sec (accepted for compatibility, never enforced).
    pub bps_limit: Option<u64>,

    /// What to do when the mirror finishes: `exit` (default) or `nothing`.
    pub action: Option<String>,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Path to the running server's control socket.
    #[arg(long = "sock", short = 's')]
    pub sock: String,
}
