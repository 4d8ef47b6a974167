use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use knock_proto::{KeyError, MasterKey, FRESHNESS_WINDOW_SECS};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("allow_ports must name at least one port")]
    NoPorts,
    #[error("port 0 is not a valid allow port")]
    ZeroPort,
    #[error("base_ttl_min must be at least 1")]
    ZeroTtl,
    #[error("max_ttl_min ({max}) is below base_ttl_min ({base})")]
    TtlOrder { base: u32, max: u32 },
    #[error("nonce_retention_secs must be at least {min}")]
    Retention { min: u64 },
    #[error("rate_pps and rate_burst must be positive")]
    Rate,
    #[error("master key: {0}")]
    Key(#[from] KeyError),
}

/// Daemon settings, read from `knockd.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Capture interface; empty selects the default-route interface.
    pub iface: String,
    pub allow_ports: Vec<u16>,
    pub base_ttl_min: u32,
    pub max_ttl_min: u32,
    pub db_file: PathBuf,
    /// Base64 master key; empty means "generate one and tell the operator".
    pub key: String,
    pub nonce_retention_secs: u64,
    pub rate_pps: u32,
    pub rate_burst: u32,
    pub obfuscate_ip: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iface: String::new(),
            allow_ports: Vec::new(),
            base_ttl_min: 5,
            max_ttl_min: 60,
            db_file: PathBuf::from("knockd.db"),
            key: String::new(),
            nonce_retention_secs: 120,
            rate_pps: 10,
            rate_burst: 20,
            obfuscate_ip: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allow_ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        if self.allow_ports.contains(&0) {
            return Err(ConfigError::ZeroPort);
        }
        if self.base_ttl_min == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        if self.max_ttl_min < self.base_ttl_min {
            return Err(ConfigError::TtlOrder {
                base: self.base_ttl_min,
                max: self.max_ttl_min,
            });
        }
        // A nonce must outlive every timestamp that could still pass the
        // freshness check.
        let min_retention = 2 * FRESHNESS_WINDOW_SECS.unsigned_abs();
        if self.nonce_retention_secs < min_retention {
            return Err(ConfigError::Retention { min: min_retention });
        }
        if self.rate_pps == 0 || self.rate_burst == 0 {
            return Err(ConfigError::Rate);
        }
        if !self.key.trim().is_empty() {
            MasterKey::from_base64(&self.key)?;
        }
        Ok(())
    }

    /// Configured key, or `None` when the operator left it empty.
    pub fn master_key(&self) -> Result<Option<MasterKey>, ConfigError> {
        if self.key.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(MasterKey::from_base64(&self.key)?))
    }

    pub fn ports(&self) -> BTreeSet<u16> {
        self.allow_ports.iter().copied().collect()
    }

    pub fn nonce_retention(&self) -> Duration {
        Duration::from_secs(self.nonce_retention_secs)
    }
}
