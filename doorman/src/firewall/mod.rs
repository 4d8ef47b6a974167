//! Time-bounded allow rules on the host firewall.
//!
//! [`FirewallController`] owns rule lifetimes; a [`FirewallBackend`] only
//! knows how to install and remove one rule on one kind of firewall.

mod controller;
mod iptables;
#[cfg(any(windows, test))]
mod netsh;

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::process::Command;
use std::time::SystemTime;

use tracing::debug;

pub use controller::FirewallController;
pub use iptables::Iptables;
#[cfg(windows)]
pub use netsh::Netsh;

/// Comment / rule-name prefix marking rules this daemon owns.
pub const RULE_TAG: &str = "knockd-allow";

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("port 0 cannot be opened")]
    InvalidPort,
    #[error("no ports given")]
    NoPorts,
    #[error("ttl of {0} minutes is out of range")]
    Ttl(u32),
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} failed (exit code {code:?}): {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("expiry worker: {0}")]
    Worker(std::io::Error),
    #[error("no firewall backend for this platform")]
    Unsupported,
}

/// One granted allow rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub address: IpAddr,
    pub ports: BTreeSet<u16>,
    pub granted_at: SystemTime,
    pub ttl_minutes: u32,
}

/// Install/remove primitives for one firewall flavor.
///
/// `revoke` must succeed when the rule is already gone.
pub trait FirewallBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Fail-fast check run once at startup.
    fn probe(&self) -> Result<(), FirewallError> {
        Ok(())
    }

    fn allow(&self, rule: &FirewallRule) -> Result<(), FirewallError>;

    fn revoke(&self, address: IpAddr, ports: &BTreeSet<u16>) -> Result<(), FirewallError>;
}

/// Backend for the host platform.
#[cfg(target_os = "linux")]
pub fn platform_backend() -> Result<Iptables, FirewallError> {
    Ok(Iptables::default())
}

#[cfg(windows)]
pub fn platform_backend() -> Result<Netsh, FirewallError> {
    Ok(Netsh::default())
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn platform_backend() -> Result<Iptables, FirewallError> {
    Err(FirewallError::Unsupported)
}

/// Comma-separated port list, rejecting empty sets and port 0.
pub(crate) fn port_list(ports: &BTreeSet<u16>) -> Result<String, FirewallError> {
    if ports.is_empty() {
        return Err(FirewallError::NoPorts);
    }
    if ports.contains(&0) {
        return Err(FirewallError::InvalidPort);
    }
    Ok(ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

/// Runs a firewall command, mapping non-zero exits to [`FirewallError::Command`].
pub(crate) fn run(cmd: &mut Command) -> Result<std::process::Output, FirewallError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(command = ?cmd, "executing");
    let output = cmd.output().map_err(|source| FirewallError::Spawn {
        program: program.clone(),
        source,
    })?;
    if !output.status.success() {
        return Err(FirewallError::Command {
            program,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}
