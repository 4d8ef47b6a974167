//! Agent identity from the MAC address of a network interface.

use std::fs;
use std::path::{Path, PathBuf};

use knock_proto::{IdentityError, IdentitySource};
use sha2::{Digest, Sha256};

const SYSFS_NET: &str = "/sys/class/net";

/// Reads interface MACs from sysfs. Without a pinned interface the first
/// non-loopback interface that is up and has a hardware address wins.
#[derive(Debug, Clone)]
pub struct SysfsIdentity {
    root: PathBuf,
    iface: Option<String>,
}

impl SysfsIdentity {
    pub fn new(iface: Option<String>) -> Self {
        Self::with_root(SYSFS_NET, iface)
    }

    pub fn with_root(root: impl Into<PathBuf>, iface: Option<String>) -> Self {
        Self {
            root: root.into(),
            iface,
        }
    }

    fn mac_of(&self, iface: &str) -> Option<[u8; 6]> {
        let raw = fs::read_to_string(self.root.join(iface).join("address")).ok()?;
        parse_mac(raw.trim()).filter(|mac| mac.iter().any(|&b| b != 0))
    }

    fn first_up(&self) -> Result<[u8; 6], IdentityError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| IdentityError(format!("list {}: {e}", self.root.display())))?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "lo")
            .collect();
        names.sort();

        names
            .iter()
            .filter(|name| is_up(&self.root.join(name)))
            .find_map(|name| self.mac_of(name))
            .ok_or_else(|| IdentityError("no active interface with a MAC address".into()))
    }
}

impl IdentitySource for SysfsIdentity {
    fn agent_id(&self) -> Result<u64, IdentityError> {
        let mac = match &self.iface {
            Some(name) => self
                .mac_of(name)
                .ok_or_else(|| IdentityError(format!("no MAC address for {name}")))?,
            None => self.first_up()?,
        };
        Ok(agent_id_from_mac(&mac))
    }
}

fn is_up(dir: &Path) -> bool {
    fs::read_to_string(dir.join("operstate"))
        .map(|state| state.trim() == "up")
        .unwrap_or(false)
}

/// `aa:bb:cc:dd:ee:ff` into six bytes.
pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// First eight bytes of SHA-256(MAC), big-endian.
pub fn agent_id_from_mac(mac: &[u8; 6]) -> u64 {
    let digest = Sha256::digest(mac);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}
