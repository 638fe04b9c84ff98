//! Key derivation: [`ckdf`] turns an ECDH shared secret into purpose-specific
//! 128-bit keys, [`ratchet`] derives the next channel key from the current
//! one.

use std::fmt;

use ring::hkdf;
use secrecy::{ExposeSecret, Secret, zeroize::Zeroizing};
use trust_common::mac::aes128_cmac;

pub const KEY_LEN: usize = 16;

/// Conventional derivation labels.
pub mod label {
    /// Session MAC key: authenticates handshake messages.
    pub const SMK: &str = "SMK";
    /// Mask key: channel additional authenticated data.
    pub const MK: &str = "MK";
    /// Secret key: channel encryption.
    pub const SK: &str = "SK";
    /// Verification key: bound into remote attestation evidence.
    pub const VK: &str = "VK";
    /// Local attestation's authenticated encryption key.
    pub const AEK: &str = "AEK";

    pub const NEXT_SECRET_KEY: &[u8] = b"next_secret_key";
    pub const NEXT_MASK_KEY: &[u8] = b"next_maskin_key";
}

/// A 128-bit symmetric key, zeroized on drop.
pub struct Key128(Secret<[u8; KEY_LEN]>);

/// `ring` wants the HKDF output length as a [`hkdf::KeyType`].
struct OkmLength(usize);

/// CMAC-based KDF.
///
/// 1. `derivation_key = AES-CMAC(0^128, shared_secret)`
/// 2. `key = AES-CMAC(derivation_key, 0x01 || label || 0x00 || 128u16_le)`
pub fn ckdf(shared_secret: &[u8], label: &str) -> Key128 {
    let derivation_key =
        Zeroizing::new(aes128_cmac(&[0u8; KEY_LEN], &[shared_secret]));
    let key_bits = ((KEY_LEN * 8) as u16).to_le_bytes();
    let key = aes128_cmac(
        &derivation_key,
        &[&[0x01], label.as_bytes(), &[0x00], &key_bits],
    );
    Key128::new(key)
}

/// One-way key update: `HKDF-SHA256(salt = "", ikm = key, info = label)`,
/// truncated to [`KEY_LEN`] bytes.
pub fn ratchet(key: &Key128, label: &[u8]) -> Key128 {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &[])
        .extract(key.expose_secret());
    let mut next = [0u8; KEY_LEN];
    prk.expand(&[label], OkmLength(KEY_LEN))
        .expect("16 bytes is a valid HKDF-SHA256 output length")
        .fill(&mut next)
        .expect("output buffer matches the requested length");
    Key128::new(next)
}

// --- impl Key128 --- //

impl Key128 {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(Secret::new(bytes))
    }

    pub fn expose_secret(&self) -> &[u8; KEY_LEN] {
        self.0.expose_secret()
    }

    /// An independent copy. Kept explicit so key copies are easy to audit.
    pub(crate) fn duplicate(&self) -> Self {
        Self::new(*self.expose_secret())
    }
}

impl fmt::Debug for Key128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key128(..)")
    }
}

// --- impl OkmLength --- //

impl hkdf::KeyType for OkmLength {
    fn len(&self) -> usize {
        self.0
    }
}
