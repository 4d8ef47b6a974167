use subtle::ConstantTimeEq;
use tracing::debug;

use crate::credential::{
    now_unix, Credential, CREDENTIAL_LEN, FRESHNESS_WINDOW_SECS, IV_LEN, PROTOCOL_VERSION,
    TAG_LEN, TOKEN_LEN,
};
use crate::keys::DerivedKeys;
use crate::nonce::NonceGuard;

/// Fields recovered from an accepted token. The source address is not part
/// of the credential; callers take it from the carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verified {
    pub agent_id: u64,
    pub timestamp: u32,
}

#[derive(Debug, thiserror::Error)]
enum Rejection {
    #[error("short packet ({0} bytes)")]
    Length(usize),
    #[error("bad tag")]
    Tag,
    #[error("cipher setup")]
    Cipher,
    #[error("invalid protocol version {0:#04x}")]
    Version(u8),
    #[error("timestamp skew too large (ts={ts}, now={now})")]
    Skew { ts: u32, now: i64 },
    #[error("replay detected")]
    Replay,
}

/// Daemon-side token check. Rejections carry no reason outward; the reason
/// is only logged at debug level.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    keys: DerivedKeys,
    window_secs: i64,
}

impl TokenVerifier {
    pub fn new(keys: DerivedKeys) -> Self {
        Self {
            keys,
            window_secs: FRESHNESS_WINDOW_SECS,
        }
    }

    pub fn verify(&self, packet: &[u8], nonces: &NonceGuard) -> Option<Verified> {
        self.verify_at(packet, nonces, now_unix())
    }

    pub fn verify_at(&self, packet: &[u8], nonces: &NonceGuard, now: i64) -> Option<Verified> {
        match self.check(packet, nonces, now) {
            Ok(verified) => Some(verified),
            Err(reason) => {
                debug!(%reason, "credential rejected");
                None
            }
        }
    }

    // Cheapest checks first; the nonce is recorded only once everything else
    // has passed so junk cannot fill the replay cache.
    fn check(&self, packet: &[u8], nonces: &NonceGuard, now: i64) -> Result<Verified, Rejection> {
        if packet.len() < TOKEN_LEN {
            return Err(Rejection::Length(packet.len()));
        }
        let iv_start = packet.len() - IV_LEN;
        let tag_start = iv_start - TAG_LEN;
        let ciphertext = &packet[..tag_start];
        let tag = &packet[tag_start..iv_start];
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&packet[iv_start..]);
        if ciphertext.len() < CREDENTIAL_LEN {
            return Err(Rejection::Length(packet.len()));
        }

        let expected = self.keys.tag(ciphertext).map_err(|_| Rejection::Cipher)?;
        if !bool::from(expected[..].ct_eq(tag)) {
            return Err(Rejection::Tag);
        }

        let mut plain = [0u8; CREDENTIAL_LEN];
        plain.copy_from_slice(&ciphertext[..CREDENTIAL_LEN]);
        self.keys
            .apply_keystream(&iv, &mut plain)
            .map_err(|_| Rejection::Cipher)?;
        let credential = Credential::from_bytes(&plain);

        if credential.version != PROTOCOL_VERSION {
            return Err(Rejection::Version(credential.version));
        }

        if !self.is_fresh(credential.timestamp, now) {
            return Err(Rejection::Skew {
                ts: credential.timestamp,
                now,
            });
        }

        if !nonces.is_valid(&credential.nonce) {
            return Err(Rejection::Replay);
        }

        Ok(Verified {
            agent_id: credential.agent_id,
            timestamp: credential.timestamp,
        })
    }

    fn is_fresh(&self, timestamp: u32, now: i64) -> bool {
        if now < 0 {
            return false;
        }
        match now.checked_sub(i64::from(timestamp)) {
            Some(delta) => delta.unsigned_abs() <= self.window_secs.unsigned_abs(),
            None => false,
        }
    }
}

/// Verifies one packet with the given keys against the replay guard.
pub fn verify(packet: &[u8], keys: &DerivedKeys, nonces: &NonceGuard) -> Option<Verified> {
    TokenVerifier::new(keys.clone()).verify(packet, nonces)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::codec::TokenCodec;
    use crate::credential::NONCE_LEN;
    use crate::keys::MasterKey;

    const NOW: i64 = 1_700_000_000;

    fn pair(seed: u8) -> (TokenCodec, TokenVerifier) {
        let keys = MasterKey::from_bytes([seed; 32]).derive().unwrap();
        (TokenCodec::from_keys(keys.clone()), TokenVerifier::new(keys))
    }

    fn guard() -> NonceGuard {
        NonceGuard::new(Duration::from_secs(120))
    }

    #[test]
    fn accepts_fresh_token() {
        let (codec, verifier) = pair(0);
        let token = codec.encode_at(42, NOW as u32).unwrap();
        let verified = verifier.verify_at(token.as_bytes(), &guard(), NOW).unwrap();
        assert_eq!(verified, Verified { agent_id: 42, timestamp: NOW as u32 });
    }

    #[test]
    fn replay_is_rejected() {
        let (codec, verifier) = pair(0);
        let nonces = guard();
        let token = codec.encode_at(42, NOW as u32).unwrap();
        assert!(verifier.verify_at(token.as_bytes(), &nonces, NOW).is_some());
        assert!(verifier.verify_at(token.as_bytes(), &nonces, NOW).is_none());
    }

    #[test]
    fn freshness_window_boundaries() {
        let (codec, verifier) = pair(3);
        let nonces = guard();
        for (offset, accepted) in [(-31i64, false), (31, false), (-29, true), (29, true), (-30, true)] {
            let token = codec.encode_at(1, (NOW + offset) as u32).unwrap();
            assert_eq!(
                verifier.verify_at(token.as_bytes(), &nonces, NOW).is_some(),
                accepted,
                "offset {offset}"
            );
        }
    }

    #[test]
    fn stale_token_does_not_consume_nonce() {
        let (codec, verifier) = pair(3);
        let nonces = guard();
        let token = codec.encode_at(1, (NOW - 31) as u32).unwrap();
        assert!(verifier.verify_at(token.as_bytes(), &nonces, NOW).is_none());
        assert!(nonces.is_empty());
    }

    #[test]
    fn any_flipped_bit_in_ciphertext_or_tag_is_rejected() {
        let (codec, verifier) = pair(5);
        let token = codec.encode_at(99, NOW as u32).unwrap();
        for byte in 0..CREDENTIAL_LEN + TAG_LEN {
            for bit in 0..8 {
                let mut tampered = *token.as_bytes();
                tampered[byte] ^= 1 << bit;
                assert!(
                    verifier.verify_at(&tampered, &guard(), NOW).is_none(),
                    "byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn wrong_key_is_rejected() {
        let (codec, _) = pair(1);
        let (_, verifier) = pair(2);
        let token = codec.encode_at(7, NOW as u32).unwrap();
        assert!(verifier.verify_at(token.as_bytes(), &guard(), NOW).is_none());
    }

    #[test]
    fn short_input_is_rejected() {
        let (codec, verifier) = pair(0);
        let token = codec.encode_at(7, NOW as u32).unwrap();
        assert!(verifier.verify_at(&token.as_bytes()[..TOKEN_LEN - 1], &guard(), NOW).is_none());
        assert!(verifier.verify_at(&[], &guard(), NOW).is_none());
    }

    #[test]
    fn foreign_version_is_rejected() {
        let (codec, verifier) = pair(0);
        let credential = Credential {
            version: 0x01,
            timestamp: NOW as u32,
            agent_id: 7,
            nonce: [4u8; NONCE_LEN],
        };
        let token = codec.seal(&credential, [6u8; IV_LEN]).unwrap();
        assert!(verifier.verify_at(token.as_bytes(), &guard(), NOW).is_none());
    }

    #[test]
    fn negative_clock_is_rejected() {
        let (codec, verifier) = pair(0);
        let token = codec.encode_at(7, 0).unwrap();
        assert!(verifier.verify_at(token.as_bytes(), &guard(), -1).is_none());
    }

    proptest! {
        #[test]
        fn round_trip_recovers_agent_id(seed in any::<[u8; 32]>(), agent_id in any::<u64>()) {
            let keys = MasterKey::from_bytes(seed).derive().unwrap();
            let token = TokenCodec::from_keys(keys.clone()).encode(agent_id).unwrap();
            let verified = verify(token.as_bytes(), &keys, &guard());
            prop_assert_eq!(verified.map(|v| v.agent_id), Some(agent_id));
        }
    }
}
