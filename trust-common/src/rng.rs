use std::num::NonZeroU32;

pub use rand_core::{CryptoRng, RngCore, SeedableRng};
use ring::rand::SecureRandom;

const RAND_ERROR_CODE: NonZeroU32 =
    NonZeroU32::new(rand_core::Error::CUSTOM_START).unwrap();

/// A succinct trait alias for a Cryptographically Secure PRNG.
pub trait Crng: RngCore + CryptoRng {}

impl<R: RngCore + CryptoRng> Crng for R {}

/// Extension methods for any [`RngCore`].
pub trait RngExt: RngCore {
    /// Sample a fixed-size random byte array.
    fn gen_bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        self.fill_bytes(&mut out);
        out
    }
}

impl<R: RngCore + ?Sized> RngExt for R {}

/// Adapts `ring`'s system RNG to the `rand_core` traits.
#[derive(Clone, Debug)]
pub struct SysRng(ring::rand::SystemRandom);

impl SysRng {
    pub fn new() -> Self {
        Self(ring::rand::SystemRandom::new())
    }
}

impl Default for SysRng {
    fn default() -> Self {
        Self::new()
    }
}

/// [`ring::rand::SystemRandom`] is a cryptographically secure PRG.
impl CryptoRng for SysRng {}

impl RngCore for SysRng {
    fn next_u32(&mut self) -> u32 {
        rand_core::impls::next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.try_fill_bytes(dest).expect("ring SystemRandom failed")
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        // ring's error is unspecified, so any custom code will do
        self.0
            .fill(dest)
            .map_err(|_| rand_core::Error::from(RAND_ERROR_CODE))
    }
}

/// A deterministic, _non-cryptographic_ RNG for reproducible tests
/// (splitmix64).
#[cfg(any(test, feature = "test-utils"))]
#[derive(Clone, Debug)]
pub struct FastRng(u64);

#[cfg(any(test, feature = "test-utils"))]
impl FastRng {
    pub fn from_u64(seed: u64) -> Self {
        Self(seed)
    }
}

/// Only usable as a [`Crng`] in tests.
#[cfg(any(test, feature = "test-utils"))]
impl CryptoRng for FastRng {}

#[cfg(any(test, feature = "test-utils"))]
impl RngCore for FastRng {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest);
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fast_rng_deterministic() {
        let mut a = FastRng::from_u64(7);
        let mut b = FastRng::from_u64(7);
        assert_eq!(a.gen_bytes::<32>(), b.gen_bytes::<32>());
        assert_ne!(a.gen_bytes::<32>(), FastRng::from_u64(8).gen_bytes::<32>());
    }

    #[test]
    fn test_sys_rng_fills() {
        let mut rng = SysRng::new();
        let a = rng.gen_bytes::<32>();
        let b = rng.gen_bytes::<32>();
        assert_ne!(a, b);
    }
}
