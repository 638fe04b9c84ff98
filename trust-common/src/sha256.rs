use std::fmt;

use crate::hex;

pub const HASH_LEN: usize = 32;

/// A SHA-256 digest. Also used as the stable identifier of identity keys.
#[derive(Copy, Clone, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Hash([u8; HASH_LEN]);

/// An incremental SHA-256 hasher.
#[derive(Clone)]
pub struct Context(ring::digest::Context);

/// SHA-256 digest a single input.
pub fn digest(input: &[u8]) -> Hash {
    digest_many(&[input])
}

/// SHA-256 digest the concatenation of several inputs without allocating.
pub fn digest_many(inputs: &[&[u8]]) -> Hash {
    let mut ctx = Context::new();
    for input in inputs {
        ctx.update(input);
    }
    ctx.finish()
}

// --- impl Hash --- //

impl Hash {
    pub const fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn to_array(self) -> [u8; HASH_LEN] {
        self.0
    }

    pub const fn as_array(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    fn from_ring(output: ring::digest::Digest) -> Self {
        let mut bytes = [0u8; HASH_LEN];
        // `Context` is always constructed with SHA-256.
        bytes.copy_from_slice(output.as_ref());
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&hex::display(&self.0), f)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&hex::display(&self.0)).finish()
    }
}

// --- impl Context --- //

impl Context {
    pub fn new() -> Self {
        Self(ring::digest::Context::new(&ring::digest::SHA256))
    }

    pub fn update(&mut self, input: &[u8]) {
        self.0.update(input);
    }

    pub fn finish(self) -> Hash {
        Hash::from_ring(self.0.finish())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
