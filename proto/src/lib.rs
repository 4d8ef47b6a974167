#![forbid(unsafe_code)]
//! Wire protocol for single packet authorization knocks.
//!
//! A knock is a 61-byte token: an AES-256-CTR encrypted credential, a
//! truncated HMAC-SHA256 tag over the ciphertext, and the CTR IV in clear.
//! The client side builds tokens with [`TokenCodec`]; the daemon side checks
//! them with [`TokenVerifier`], which consults a [`NonceGuard`] to reject
//! replays. [`carrier`] moves tokens in and out of TCP SYN packets.

pub mod carrier;
mod codec;
mod credential;
mod keys;
mod nonce;
mod verify;

pub use codec::{encode, GenerationError, IdentityError, IdentitySource, TokenCodec};
pub use credential::{
    now_unix, Credential, WireToken, CREDENTIAL_LEN, FRESHNESS_WINDOW_SECS, IV_LEN, NONCE_LEN,
    PROTOCOL_VERSION, TAG_LEN, TOKEN_LEN,
};
pub use keys::{DerivedKeys, KeyError, MasterKey, MASTER_KEY_LEN};
pub use nonce::{fingerprint, NonceGuard};
pub use verify::{verify, TokenVerifier, Verified};
