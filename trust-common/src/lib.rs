//! Shared primitives used by both ends of an attested session.
//!
//! + [`hex`]: constant-time-ish lowercase hex encoding.
//! + [`sha256`]: the SHA-256 [`Hash`](sha256::Hash) newtype.
//! + [`rng`]: RNG traits and the system RNG wrapper.
//! + [`mac`]: AES-128-CMAC helpers.
//! + [`enclave`]: in-enclave platform APIs (reports and target info), with an
//!   SGX backend and a mock backend for everything else.

/// In-enclave APIs for creating and verifying local attestation reports.
pub mod enclave;
/// Lowercase hex encoding and decoding.
pub mod hex;
/// AES-128-CMAC helpers.
pub mod mac;
/// Random number generation utilities.
pub mod rng;
/// SHA-256 hashing.
pub mod sha256;
