use ring::aead::{AES_128_GCM, Aad, LessSafeKey, Nonce, NONCE_LEN, UnboundKey};
use tracing::info;

use crate::{
    channel::{Error, TAG_LEN},
    handshake::{Role, SessionKeys},
    kdf::{self, KEY_LEN, Key128, label},
};

/// AAD: `mask_key || counter_le`.
const AAD_LEN: usize = KEY_LEN + 8;

/// The keys and record counter for one direction of a channel.
///
/// Every record advances the counter by one. The record sealed or opened at
/// `max_counter` is the last under the current keys: both keys then ratchet
/// forward and the counter restarts at zero.
pub(crate) struct KeySchedule {
    /// The role of the side that seals under this schedule.
    sender: Role,
    secret_key: Key128,
    mask_key: Key128,
    aead: LessSafeKey,
    counter: u64,
    max_counter: u64,
    ratchets: u64,
}

impl KeySchedule {
    pub fn new(sender: Role, keys: &SessionKeys, max_counter: u64) -> Self {
        let keys = keys.duplicate();
        Self {
            sender,
            aead: aead_key(&keys.secret_key),
            secret_key: keys.secret_key,
            mask_key: keys.mask_key,
            counter: 0,
            max_counter,
            ratchets: 0,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn ratchets(&self) -> u64 {
        self.ratchets
    }

    pub fn set_max_counter(&mut self, max_counter: u64) {
        self.max_counter = max_counter;
    }

    /// `sender_role || 0^3 || counter_be`, unique per key.
    fn nonce(&self) -> Nonce {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[0] = self.sender as u8;
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        Nonce::assume_unique_for_key(nonce)
    }

    fn aad(&self) -> [u8; AAD_LEN] {
        let mut aad = [0u8; AAD_LEN];
        aad[..KEY_LEN].copy_from_slice(self.mask_key.expose_secret());
        aad[KEY_LEN..].copy_from_slice(&self.counter.to_le_bytes());
        aad
    }

    /// Encrypt `in_out` in place and append the tag.
    pub fn seal(&mut self, in_out: &mut Vec<u8>, start: usize) {
        let tag = self
            .aead
            .seal_in_place_separate_tag(
                self.nonce(),
                Aad::from(self.aad()),
                &mut in_out[start..],
            )
            .expect("record is far below the AES-GCM length limit");
        in_out.extend_from_slice(tag.as_ref());
        self.advance();
    }

    /// Decrypt `ciphertext || tag` in place, leaving just the plaintext. The
    /// counter only advances on success.
    pub fn open(&mut self, record: &mut Vec<u8>) -> Result<(), Error> {
        let plaintext_len = self
            .aead
            .open_in_place(self.nonce(), Aad::from(self.aad()), record)
            .map_err(|_| Error::Decrypt)?
            .len();
        debug_assert_eq!(plaintext_len + TAG_LEN, record.len());
        record.truncate(plaintext_len);
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        if self.counter < self.max_counter {
            self.counter += 1;
            return;
        }

        self.secret_key =
            kdf::ratchet(&self.secret_key, label::NEXT_SECRET_KEY);
        self.mask_key = kdf::ratchet(&self.mask_key, label::NEXT_MASK_KEY);
        self.aead = aead_key(&self.secret_key);
        self.counter = 0;
        self.ratchets += 1;
        info!(
            sender = ?self.sender,
            ratchets = self.ratchets,
            "channel keys ratcheted"
        );
    }

    #[cfg(test)]
    pub fn secret_key(&self) -> &Key128 {
        &self.secret_key
    }
}

fn aead_key(key: &Key128) -> LessSafeKey {
    let unbound = UnboundKey::new(&AES_128_GCM, key.expose_secret())
        .expect("AES-128 keys are 16 bytes");
    LessSafeKey::new(unbound)
}
