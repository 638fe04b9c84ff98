//! ECDSA P-256 identity key pairs, ephemeral P-256 ECDH keys, and the
//! conversions to and from SGX's little-endian point encoding.

use std::fmt;

use ring::{
    agreement::{self, ECDH_P256},
    rand::SystemRandom,
    signature::{
        self, ECDSA_P256_SHA256_FIXED, ECDSA_P256_SHA256_FIXED_SIGNING,
        EcdsaKeyPair, KeyPair as _,
    },
};
use secrecy::{ExposeSecret, Secret, zeroize::Zeroizing};
use thiserror::Error;
use trust_common::{hex, sha256};

/// Uncompressed SEC1 point length: `0x04 || x || y`.
pub const SEC1_POINT_LEN: usize = 65;
/// SGX `sgx_ec256_public_t` length: `x || y`, each little endian.
pub const SGX_POINT_LEN: usize = 64;
pub const SIGNATURE_LEN: usize = 64;
pub const SHARED_SECRET_LEN: usize = 32;

/// DER `SubjectPublicKeyInfo` header for an uncompressed P-256 point
/// (id-ecPublicKey, prime256v1).
const SPKI_DER_PREFIX: [u8; 26] = hex::decode_const(
    b"3059301306072a8648ce3d020106082a8648ce3d030107034200",
);
pub const SPKI_DER_LEN: usize = SPKI_DER_PREFIX.len() + SEC1_POINT_LEN;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to generate a P-256 key")]
    KeyGeneration,

    #[error("failed deserializing PKCS#8-encoded key pair")]
    KeyDeserialize,

    #[error("not an uncompressed P-256 point")]
    InvalidPublicKey,

    #[error("ECDH key agreement failed")]
    KeyAgreement,

    #[error("ECDSA signing failed")]
    Signing,

    #[error("ECDSA signature is invalid")]
    InvalidSignature,
}

/// A P-256 public key, stored as an uncompressed SEC1 point.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; SEC1_POINT_LEN]);

/// A fixed-size ECDSA signature `r || s`, each big endian.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Signature([u8; SIGNATURE_LEN]);

/// A long-lived ECDSA P-256 key pair.
pub struct KeyPair {
    key_pair: EcdsaKeyPair,
    pkcs8_bytes: Secret<Vec<u8>>,
    public_key: PublicKey,
}

/// A single-use P-256 ECDH key.
pub struct EphemeralKey {
    private_key: agreement::EphemeralPrivateKey,
    public_key: PublicKey,
}

// --- impl PublicKey --- //

impl PublicKey {
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, Error> {
        let point = <[u8; SEC1_POINT_LEN]>::try_from(bytes)
            .map_err(|_| Error::InvalidPublicKey)?;
        if point[0] != 0x04 {
            return Err(Error::InvalidPublicKey);
        }
        Ok(Self(point))
    }

    pub fn as_sec1(&self) -> &[u8; SEC1_POINT_LEN] {
        &self.0
    }

    /// Parse an SGX `sgx_ec256_public_t`. The point isn't validated until
    /// it's used.
    pub fn from_sgx_bytes(bytes: &[u8; SGX_POINT_LEN]) -> Self {
        let mut point = [0u8; SEC1_POINT_LEN];
        point[0] = 0x04;
        point[1..33].copy_from_slice(&bytes[..32]);
        point[33..].copy_from_slice(&bytes[32..]);
        point[1..33].reverse();
        point[33..].reverse();
        Self(point)
    }

    pub fn to_sgx_bytes(&self) -> [u8; SGX_POINT_LEN] {
        let mut out = [0u8; SGX_POINT_LEN];
        out.copy_from_slice(&self.0[1..]);
        out[..32].reverse();
        out[32..].reverse();
        out
    }

    /// The DER-encoded `SubjectPublicKeyInfo`.
    pub fn to_spki_der(&self) -> [u8; SPKI_DER_LEN] {
        let mut out = [0u8; SPKI_DER_LEN];
        out[..SPKI_DER_PREFIX.len()].copy_from_slice(&SPKI_DER_PREFIX);
        out[SPKI_DER_PREFIX.len()..].copy_from_slice(&self.0);
        out
    }

    /// SHA-256 of the DER-encoded `SubjectPublicKeyInfo`.
    pub fn spki_hash(&self) -> sha256::Hash {
        sha256::digest(&self.to_spki_der())
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> Result<(), Error> {
        signature::UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, &self.0)
            .verify(msg, &sig.0)
            .map_err(|_| Error::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&hex::display(&self.0))
            .finish()
    }
}

// --- impl Signature --- //

impl Signature {
    /// Parse an SGX `sgx_ec256_signature_t`: `r || s` as little-endian
    /// `u32` limbs, i.e. each scalar little endian.
    pub fn from_sgx_bytes(bytes: &[u8; SIGNATURE_LEN]) -> Self {
        let mut sig = *bytes;
        sig[..32].reverse();
        sig[32..].reverse();
        Self(sig)
    }

    pub fn to_sgx_bytes(&self) -> [u8; SIGNATURE_LEN] {
        let mut out = self.0;
        out[..32].reverse();
        out[32..].reverse();
        out
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature")
            .field(&hex::display(&self.0))
            .finish()
    }
}

// --- impl KeyPair --- //

impl KeyPair {
    pub fn from_sysrng() -> Result<Self, Error> {
        let rng = SystemRandom::new();
        let pkcs8_document =
            EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                .map_err(|_| Error::KeyGeneration)?;
        Self::deserialize_pkcs8_der(pkcs8_document.as_ref())
    }

    pub fn deserialize_pkcs8_der(bytes: &[u8]) -> Result<Self, Error> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_FIXED_SIGNING,
            bytes,
            &rng,
        )
        .map_err(|_| Error::KeyDeserialize)?;
        let public_key = PublicKey::from_sec1(key_pair.public_key().as_ref())?;
        Ok(Self {
            key_pair,
            pkcs8_bytes: Secret::new(bytes.to_vec()),
            public_key,
        })
    }

    pub fn as_pkcs8_der(&self) -> &[u8] {
        self.pkcs8_bytes.expose_secret()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// ECDSA-P256-SHA256 over `msg`.
    pub fn sign(&self, msg: &[u8]) -> Result<Signature, Error> {
        let rng = SystemRandom::new();
        let sig = self
            .key_pair
            .sign(&rng, msg)
            .map_err(|_| Error::Signing)?;
        <[u8; SIGNATURE_LEN]>::try_from(sig.as_ref())
            .map(Signature)
            .map_err(|_| Error::Signing)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

// --- impl EphemeralKey --- //

impl EphemeralKey {
    pub fn generate() -> Result<Self, Error> {
        let rng = SystemRandom::new();
        let private_key =
            agreement::EphemeralPrivateKey::generate(&ECDH_P256, &rng)
                .map_err(|_| Error::KeyGeneration)?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| Error::KeyGeneration)?;
        let public_key = PublicKey::from_sec1(public_key.as_ref())?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// ECDH with `peer`. Returns the shared x-coordinate in SGX
    /// (little-endian) byte order.
    pub fn agree(
        self,
        peer: &PublicKey,
    ) -> Result<Zeroizing<[u8; SHARED_SECRET_LEN]>, Error> {
        let peer =
            agreement::UnparsedPublicKey::new(&ECDH_P256, peer.as_sec1());
        agreement::agree_ephemeral(self.private_key, &peer, |shared_x| {
            let mut shared = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
            shared.copy_from_slice(shared_x);
            shared.reverse();
            shared
        })
        .map_err(|_| Error::KeyAgreement)
    }
}

impl fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// The P-256 base point.
    const GENERATOR: [u8; SEC1_POINT_LEN] = hex::decode_const(
        b"04\
          6b17d1f2e12c4247f8bce6e563a440f277037d812deb33a0f4a13945d898c296\
          4fe342e2fe1a7f9b8ee7eb4a7c0f9e162bce33576b315ececbb6406837bf51f5",
    );

    #[test]
    fn test_spki_hash_compat() {
        let pk = PublicKey::from_sec1(&GENERATOR).unwrap();
        assert_eq!(
            pk.spki_hash().to_string(),
            "5cd252fb0ce8932436faf8ccd1040981b89ee4ad6b9fe9e2a2b7e71aacb27cd3",
        );
    }

    #[test]
    fn test_sgx_point_encoding() {
        let pk = PublicKey::from_sec1(&GENERATOR).unwrap();
        let sgx = pk.to_sgx_bytes();
        // x and y are each byte-reversed
        assert_eq!(hex::encode(&sgx[..8]), "96c298d84539a1f4");
        assert_eq!(hex::encode(&sgx[56..]), "9b7f1afee242e34f");
        assert_eq!(PublicKey::from_sgx_bytes(&sgx), pk);
    }

    #[test]
    fn test_from_sec1_rejects_bad_points() {
        assert!(PublicKey::from_sec1(&GENERATOR[..64]).is_err());
        let mut compressed = GENERATOR;
        compressed[0] = 0x02;
        assert!(PublicKey::from_sec1(&compressed).is_err());
    }

    #[test]
    fn test_sign_verify_sgx_roundtrip() {
        let key_pair = KeyPair::from_sysrng().unwrap();
        let sig = key_pair.sign(b"g_b || g_a").unwrap();
        let sig = Signature::from_sgx_bytes(&sig.to_sgx_bytes());
        key_pair.public_key().verify(b"g_b || g_a", &sig).unwrap();
        assert!(key_pair.public_key().verify(b"g_a || g_b", &sig).is_err());

        let other = KeyPair::from_sysrng().unwrap();
        assert!(other.public_key().verify(b"g_b || g_a", &sig).is_err());
    }

    #[test]
    fn test_pkcs8_roundtrip() {
        let key_pair = KeyPair::from_sysrng().unwrap();
        let decoded =
            KeyPair::deserialize_pkcs8_der(key_pair.as_pkcs8_der()).unwrap();
        assert_eq!(decoded.public_key(), key_pair.public_key());
        assert!(KeyPair::deserialize_pkcs8_der(b"not a key").is_err());
    }

    #[test]
    fn test_ecdh_agreement() {
        let alice = EphemeralKey::generate().unwrap();
        let bob = EphemeralKey::generate().unwrap();
        let (alice_pk, bob_pk) = (*alice.public_key(), *bob.public_key());
        let alice_shared = alice.agree(&bob_pk).unwrap();
        let bob_shared = bob.agree(&alice_pk).unwrap();
        assert_eq!(*alice_shared, *bob_shared);

        // off-curve points are rejected
        let mut bogus = GENERATOR;
        bogus[64] ^= 1;
        let carol = EphemeralKey::generate().unwrap();
        assert!(carol.agree(&PublicKey(bogus)).is_err());
    }
}
