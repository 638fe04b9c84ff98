use aes::Aes128;
use cmac::{Cmac, Mac, digest::generic_array::GenericArray};

pub const CMAC_KEY_LEN: usize = 16;
pub const CMAC_TAG_LEN: usize = 16;

/// AES-128-CMAC over the concatenation of `inputs`.
pub fn aes128_cmac(
    key: &[u8; CMAC_KEY_LEN],
    inputs: &[&[u8]],
) -> [u8; CMAC_TAG_LEN] {
    let mut cmac = new_cmac(key);
    for input in inputs {
        cmac.update(input);
    }
    cmac.finalize().into_bytes().into()
}

/// Check a CMAC tag over the concatenation of `inputs` in constant time.
pub fn aes128_cmac_verify(
    key: &[u8; CMAC_KEY_LEN],
    inputs: &[&[u8]],
    tag: &[u8; CMAC_TAG_LEN],
) -> bool {
    let mut cmac = new_cmac(key);
    for input in inputs {
        cmac.update(input);
    }
    cmac.verify(&GenericArray::from(*tag)).is_ok()
}

fn new_cmac(key: &[u8; CMAC_KEY_LEN]) -> Cmac<Aes128> {
    let key = GenericArray::from(*key);
    <Cmac<Aes128> as Mac>::new(&key)
}
