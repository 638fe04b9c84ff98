//! Enclave trust bootstrapping: attestation handshakes that authenticate an
//! enclave to a peer, and the ratcheting AEAD channel their keys seed.
//!
//! ```text
//! KeyRegistry ──> Handshake (local / remote) ──> SessionKeys ──> SecureChannel
//! ```

/// [`SecureChannel`](channel::SecureChannel), the encrypted record layer.
pub mod channel;
/// TOML `Config`.
pub mod config;
/// The `Handshake` trait, local and remote attestation.
pub mod handshake;
/// `ckdf` and the channel key `ratchet`.
pub mod kdf;
/// `KeyRegistry` and long-term `IdentityKey`s.
pub mod keyring;
/// P-256 signing and ECDH keys.
pub mod p256;
/// `DuplexStream` and handshake message framing.
pub mod stream;

/// Feature-gated test utilities that can be shared across crate boundaries.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
