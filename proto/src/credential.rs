use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Protocol constants
pub const PROTOCOL_VERSION: u8 = 0x02;
pub const NONCE_LEN: usize = 16;
pub const CREDENTIAL_LEN: usize = 1 + 4 + 8 + NONCE_LEN;
pub const TAG_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const TOKEN_LEN: usize = CREDENTIAL_LEN + TAG_LEN + IV_LEN;
/// Accepted clock difference between knocker and daemon, either direction.
pub const FRESHNESS_WINDOW_SECS: i64 = 30;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}

/// Plaintext credential: `version | timestamp | agent_id | nonce`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    pub version: u8,
    pub timestamp: u32,
    pub agent_id: u64,
    pub nonce: [u8; NONCE_LEN],
}

impl Credential {
    pub fn to_bytes(&self) -> [u8; CREDENTIAL_LEN] {
        let mut out = [0u8; CREDENTIAL_LEN];
        out[0] = self.version;
        out[1..5].copy_from_slice(&self.timestamp.to_be_bytes());
        out[5..13].copy_from_slice(&self.agent_id.to_be_bytes());
        out[13..].copy_from_slice(&self.nonce);
        out
    }

    pub fn from_bytes(raw: &[u8; CREDENTIAL_LEN]) -> Self {
        let mut timestamp = [0u8; 4];
        timestamp.copy_from_slice(&raw[1..5]);
        let mut agent_id = [0u8; 8];
        agent_id.copy_from_slice(&raw[5..13]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&raw[13..]);
        Self {
            version: raw[0],
            timestamp: u32::from_be_bytes(timestamp),
            agent_id: u64::from_be_bytes(agent_id),
            nonce,
        }
    }
}

/// `ciphertext(29) | tag(16) | iv(16)` as sent on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WireToken([u8; TOKEN_LEN]);

impl WireToken {
    pub(crate) fn assemble(
        ciphertext: &[u8; CREDENTIAL_LEN],
        tag: &[u8; TAG_LEN],
        iv: &[u8; IV_LEN],
    ) -> Self {
        let mut out = [0u8; TOKEN_LEN];
        out[..CREDENTIAL_LEN].copy_from_slice(ciphertext);
        out[CREDENTIAL_LEN..CREDENTIAL_LEN + TAG_LEN].copy_from_slice(tag);
        out[CREDENTIAL_LEN + TAG_LEN..].copy_from_slice(iv);
        Self(out)
    }

    pub fn from_bytes(raw: [u8; TOKEN_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for WireToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WireToken({} bytes)", TOKEN_LEN)
    }
}

impl AsRef<[u8]> for WireToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_wire_table() {
        assert_eq!(CREDENTIAL_LEN, 29);
        assert_eq!(TOKEN_LEN, 61);

        let cred = Credential {
            version: PROTOCOL_VERSION,
            timestamp: 0x0102_0304,
            agent_id: 0x1122_3344_5566_7788,
            nonce: [0xEE; NONCE_LEN],
        };
        let raw = cred.to_bytes();
        assert_eq!(raw[0], 0x02);
        assert_eq!(&raw[1..5], &[1, 2, 3, 4]);
        assert_eq!(&raw[5..13], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(&raw[13..], &[0xEE; 16]);
        assert_eq!(Credential::from_bytes(&raw), cred);
    }
}
