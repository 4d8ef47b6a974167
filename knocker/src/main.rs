#![forbid(unsafe_code)]

mod identity;
mod transmit;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use knock_proto::MasterKey;
use tracing_subscriber::EnvFilter;

use crate::identity::SysfsIdentity;

#[derive(Parser, Debug)]
#[command(name = "kk", version, about = "Single packet authorization client")]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new master key in config-file form
    Init,
    /// Send one knock to a server
    Send {
        /// Server hostname or IPv4 address
        #[arg(short, long)]
        server: String,
        /// Base64 master key shared with the server
        #[arg(short, long)]
        key: String,
        /// Destination TCP port of the knock packet
        #[arg(long, default_value_t = 80)]
        port: u16,
        /// Interface to take the identity from and send through
        #[arg(long)]
        iface: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Init => {
            let key = MasterKey::generate()?;
            println!("key = \"{}\"", key.to_base64());
        }
        Command::Send {
            server,
            key,
            port,
            iface,
        } => {
            let master = MasterKey::from_base64(key.trim()).context("invalid key")?;
            let identity = SysfsIdentity::new(iface.clone());
            let token = knock_proto::encode(&identity, &master).context("build knock")?;
            transmit::send(&token, &server, port, iface.as_deref())
                .with_context(|| format!("send knock to {server}"))?;
            println!("Knock sent to {server}");
        }
    }
    Ok(())
}
