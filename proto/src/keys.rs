use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::credential::{IV_LEN, TAG_LEN};

type HmacSha256 = Hmac<Sha256>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const MASTER_KEY_LEN: usize = 32;

const ENCRYPT_LABEL: &[u8] = b"knockknock-encrypt";
const MAC_LABEL: &[u8] = b"knockknock-hmac";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("master key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("master key must be {MASTER_KEY_LEN} bytes, got {0}")]
    Length(usize),
    #[error("entropy source failed: {0}")]
    Entropy(getrandom::Error),
    #[error("invalid key length for primitive")]
    Primitive,
}

/// Shared 32-byte secret provisioned to both the client and the daemon.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; MASTER_KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let mut raw = STANDARD.decode(encoded.trim())?;
        if raw.len() != MASTER_KEY_LEN {
            let len = raw.len();
            raw.zeroize();
            return Err(KeyError::Length(len));
        }
        // Fill the key in place so no stray copy outlives the call.
        let mut key = Self([0u8; MASTER_KEY_LEN]);
        key.0.copy_from_slice(&raw);
        raw.zeroize();
        Ok(key)
    }

    pub fn generate() -> Result<Self, KeyError> {
        let mut key = Self([0u8; MASTER_KEY_LEN]);
        getrandom::getrandom(&mut key.0).map_err(KeyError::Entropy)?;
        Ok(key)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Splits the master secret into independent encryption and MAC keys.
    pub fn derive(&self) -> Result<DerivedKeys, KeyError> {
        let mut keys = DerivedKeys {
            enc: [0u8; 32],
            mac: [0u8; 32],
        };
        label_key(&self.0, ENCRYPT_LABEL, &mut keys.enc)?;
        label_key(&self.0, MAC_LABEL, &mut keys.mac)?;
        Ok(keys)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

fn label_key(master: &[u8], label: &[u8], out: &mut [u8; 32]) -> Result<(), KeyError> {
    let mut mac = HmacSha256::new_from_slice(master).map_err(|_| KeyError::Primitive)?;
    mac.update(label);
    let mut digest = mac.finalize().into_bytes();
    out.copy_from_slice(&digest);
    digest.as_mut_slice().zeroize();
    Ok(())
}

/// `keyE` and `keyH`, both HMAC-SHA256 outputs of the master key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

impl DerivedKeys {
    pub fn from_parts(enc: [u8; 32], mac: [u8; 32]) -> Self {
        Self { enc, mac }
    }

    /// First 16 bytes of HMAC-SHA256(keyH, ciphertext).
    pub(crate) fn tag(&self, ciphertext: &[u8]) -> Result<[u8; TAG_LEN], KeyError> {
        let mut mac = HmacSha256::new_from_slice(&self.mac).map_err(|_| KeyError::Primitive)?;
        mac.update(ciphertext);
        let full = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&full[..TAG_LEN]);
        Ok(tag)
    }

    /// AES-256-CTR with the IV as a 128-bit big-endian counter. Encrypts and
    /// decrypts alike.
    pub(crate) fn apply_keystream(&self, iv: &[u8; IV_LEN], buf: &mut [u8]) -> Result<(), KeyError> {
        let mut cipher =
            Aes256Ctr::new_from_slices(&self.enc, iv).map_err(|_| KeyError::Primitive)?;
        cipher.apply_keystream(buf);
        Ok(())
    }
}

impl fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKeys(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let key = MasterKey::generate().unwrap();
        let parsed = MasterKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(parsed.0, key.0);
    }

    #[test]
    fn decodes_known_key_bytes() {
        let encoded = STANDARD.encode([0x5Au8; MASTER_KEY_LEN]);
        let key = MasterKey::from_base64(&format!("  {encoded}\n")).unwrap();
        assert_eq!(key.0, [0x5Au8; MASTER_KEY_LEN]);
    }

    #[test]
    fn rejects_wrong_length() {
        let short = STANDARD.encode([7u8; 16]);
        assert!(matches!(MasterKey::from_base64(&short), Err(KeyError::Length(16))));
        assert!(matches!(MasterKey::from_base64("not base64!"), Err(KeyError::Encoding(_))));
    }

    #[test]
    fn subkeys_are_independent_and_stable() {
        let master = MasterKey::from_bytes([0u8; 32]);
        let a = master.derive().unwrap();
        let b = master.derive().unwrap();
        assert_eq!(a.enc, b.enc);
        assert_eq!(a.mac, b.mac);
        assert_ne!(a.enc, a.mac);

        let mut expected = HmacSha256::new_from_slice(&[0u8; 32]).unwrap();
        expected.update(b"knockknock-hmac");
        assert_eq!(a.mac[..], expected.finalize().into_bytes()[..]);
    }

    #[test]
    fn debug_hides_material() {
        let master = MasterKey::from_bytes([0xAB; 32]);
        assert_eq!(format!("{master:?}"), "MasterKey(..)");
        assert_eq!(format!("{:?}", master.derive().unwrap()), "DerivedKeys(..)");
    }
}
