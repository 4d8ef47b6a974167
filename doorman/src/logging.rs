use std::fs::OpenOptions;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. With a log file, events are appended as
/// JSON lines; otherwise they go to stderr in the compact text format.
pub fn init(verbose: u8, quiet: bool, log_file: Option<&Path>) -> Result<()> {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Address as it should appear in logs: verbatim, or a short SHA-256 digest.
pub fn client_label(address: IpAddr, obfuscate: bool) -> String {
    if !obfuscate {
        return address.to_string();
    }
    let digest = Sha256::digest(address.to_string().as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
