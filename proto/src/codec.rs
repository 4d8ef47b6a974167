use crate::credential::{
    now_unix, Credential, WireToken, CREDENTIAL_LEN, IV_LEN, NONCE_LEN, PROTOCOL_VERSION,
};
use crate::keys::{DerivedKeys, KeyError, MasterKey};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct IdentityError(pub String);

/// Where the client's stable agent identifier comes from.
pub trait IdentitySource {
    fn agent_id(&self) -> Result<u64, IdentityError>;
}

impl IdentitySource for u64 {
    fn agent_id(&self) -> Result<u64, IdentityError> {
        Ok(*self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("entropy source failed: {0}")]
    Entropy(getrandom::Error),
    #[error("agent identity unavailable: {0}")]
    Identity(#[from] IdentityError),
    #[error("system clock outside the 32-bit timestamp range")]
    Clock,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Client-side token builder. Holds only the derived keys; every call draws
/// a fresh nonce and IV.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    keys: DerivedKeys,
}

impl TokenCodec {
    pub fn new(master: &MasterKey) -> Result<Self, GenerationError> {
        Ok(Self { keys: master.derive()? })
    }

    pub fn from_keys(keys: DerivedKeys) -> Self {
        Self { keys }
    }

    pub fn encode(&self, agent_id: u64) -> Result<WireToken, GenerationError> {
        let timestamp = u32::try_from(now_unix()).map_err(|_| GenerationError::Clock)?;
        self.encode_at(agent_id, timestamp)
    }

    pub fn encode_at(&self, agent_id: u64, timestamp: u32) -> Result<WireToken, GenerationError> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(GenerationError::Entropy)?;
        let mut iv = [0u8; IV_LEN];
        getrandom::getrandom(&mut iv).map_err(GenerationError::Entropy)?;

        let credential = Credential {
            version: PROTOCOL_VERSION,
            timestamp,
            agent_id,
            nonce,
        };
        self.seal(&credential, iv)
    }

    /// Encrypt-then-MAC a credential under a caller-chosen IV.
    pub fn seal(
        &self,
        credential: &Credential,
        iv: [u8; IV_LEN],
    ) -> Result<WireToken, GenerationError> {
        let mut ciphertext: [u8; CREDENTIAL_LEN] = credential.to_bytes();
        self.keys.apply_keystream(&iv, &mut ciphertext)?;
        let tag = self.keys.tag(&ciphertext)?;
        Ok(WireToken::assemble(&ciphertext, &tag, &iv))
    }
}

/// Builds one token for the identity under the master key.
pub fn encode<I: IdentitySource + ?Sized>(
    identity: &I,
    master: &MasterKey,
) -> Result<WireToken, GenerationError> {
    let agent_id = identity.agent_id()?;
    TokenCodec::new(master)?.encode(agent_id)
}
