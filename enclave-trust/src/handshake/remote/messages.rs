//! Wire formats, as in the SGX SDK's `sgx_ra_msg*_t`. Points and signature
//! scalars are little endian, as are all integers.
//!
//! ```text
//! msg0s  extended_gid: u32                                            4 B
//! msg0r  sp_sign_key: [u8; 64]                                       64 B
//! msg1   g_a: [u8; 64] || gid: [u8; 4]                               68 B
//! msg2   g_b: [u8; 64] || spid: [u8; 16] || quote_type: u16 ||
//!        kdf_id: u16 || sign_gb_ga: [u8; 64] || mac: [u8; 16] ||
//!        sig_rl_size: u32 || sig_rl                            168 B + rl
//! msg3   mac: [u8; 16] || g_a: [u8; 64] || ps_sec_prop: [u8; 256] ||
//!        quote                                              336 B + quote
//! msg4   status: u8 || mac: [u8; 16]                                 17 B
//! ```
//!
//! msg2 and msg3 travel `u64` length prefixed.

use bytes::{Buf, BufMut};
use trust_common::mac::CMAC_TAG_LEN;

use super::{GroupId, QuoteType, Spid};
use crate::{
    handshake::{Error, len_u32},
    p256::{PublicKey, SGX_POINT_LEN, SIGNATURE_LEN, Signature},
};

pub const MSG0S_LEN: usize = 4;
pub const MSG0R_LEN: usize = SGX_POINT_LEN;
pub const MSG1_LEN: usize = SGX_POINT_LEN + 4;
pub const MSG2_HEADER_LEN: usize = MSG2_MAC_OFFSET + CMAC_TAG_LEN + 4;
pub const MSG3_HEADER_LEN: usize =
    CMAC_TAG_LEN + SGX_POINT_LEN + PS_SEC_PROP_LEN;
pub const MSG4_LEN: usize = 1 + CMAC_TAG_LEN;

/// Everything before `mac` in msg2 is covered by it.
const MSG2_MAC_OFFSET: usize = SGX_POINT_LEN + 16 + 2 + 2 + SIGNATURE_LEN;
/// `sgx_ps_sec_prop_desc_t`
pub(super) const PS_SEC_PROP_LEN: usize = 256;

pub(super) struct Msg1 {
    pub g_a: PublicKey,
    pub gid: GroupId,
}

pub(super) struct Msg2 {
    pub g_b: PublicKey,
    pub spid: Spid,
    pub quote_type: QuoteType,
    pub kdf_id: u16,
    pub sign_gb_ga: Signature,
    pub mac: [u8; CMAC_TAG_LEN],
    pub sig_rl: Vec<u8>,
}

pub(super) struct Msg3 {
    pub mac: [u8; CMAC_TAG_LEN],
    pub g_a: PublicKey,
    pub ps_sec_prop: [u8; PS_SEC_PROP_LEN],
    pub quote: Vec<u8>,
}

/// The server's final verdict on the client's evidence.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum Verdict {
    Accepted = 0,
    Rejected = 1,
}

pub(super) struct Msg4 {
    pub verdict: Verdict,
    pub mac: [u8; CMAC_TAG_LEN],
}

pub(super) fn msg0s(extended_gid: u32) -> [u8; MSG0S_LEN] {
    extended_gid.to_le_bytes()
}

pub(super) fn parse_msg0s(bytes: [u8; MSG0S_LEN]) -> u32 {
    u32::from_le_bytes(bytes)
}

impl Msg1 {
    pub fn to_bytes(&self) -> [u8; MSG1_LEN] {
        let mut out = [0u8; MSG1_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(&self.g_a.to_sgx_bytes());
        buf.put_slice(&self.gid.0);
        out
    }

    pub fn from_bytes(bytes: &[u8; MSG1_LEN]) -> Self {
        let mut buf = &bytes[..];
        Self {
            g_a: PublicKey::from_sgx_bytes(&get_array(&mut buf)),
            gid: GroupId(get_array(&mut buf)),
        }
    }
}

impl Msg2 {
    /// The bytes covered by `mac`.
    pub fn mac_inputs(&self) -> [u8; MSG2_MAC_OFFSET] {
        let mut out = [0u8; MSG2_MAC_OFFSET];
        let mut buf = &mut out[..];
        buf.put_slice(&self.g_b.to_sgx_bytes());
        buf.put_slice(&self.spid.0);
        buf.put_u16_le(self.quote_type.to_u16());
        buf.put_u16_le(self.kdf_id);
        buf.put_slice(&self.sign_gb_ga.to_sgx_bytes());
        out
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let sig_rl_len =
            len_u32("signature revocation list", self.sig_rl.len())?;
        let mut out = Vec::with_capacity(MSG2_HEADER_LEN + self.sig_rl.len());
        out.put_slice(&self.mac_inputs());
        out.put_slice(&self.mac);
        out.put_u32_le(sig_rl_len);
        out.put_slice(&self.sig_rl);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        const MSG: &str = "remote attestation msg2";
        if bytes.len() < MSG2_HEADER_LEN {
            return Err(Error::malformed(
                MSG,
                format!("{} bytes is shorter than the header", bytes.len()),
            ));
        }
        let mut buf = bytes;
        let g_b = PublicKey::from_sgx_bytes(&get_array(&mut buf));
        let spid = Spid(get_array(&mut buf));
        let quote_type = QuoteType::try_from_u16(buf.get_u16_le())
            .map_err(|err| Error::malformed(MSG, err))?;
        let kdf_id = buf.get_u16_le();
        let sign_gb_ga = Signature::from_sgx_bytes(&get_array(&mut buf));
        let mac = get_array(&mut buf);
        let sig_rl_size = buf.get_u32_le() as usize;
        if buf.len() != sig_rl_size {
            return Err(Error::malformed(
                MSG,
                format!(
                    "revocation list is {} bytes, header says {sig_rl_size}",
                    buf.len()
                ),
            ));
        }
        Ok(Self {
            g_b,
            spid,
            quote_type,
            kdf_id,
            sign_gb_ga,
            mac,
            sig_rl: buf.to_vec(),
        })
    }
}

impl Msg3 {
    /// The bytes covered by `mac`: everything after it.
    pub fn mac_inputs(
        g_a: &PublicKey,
        ps_sec_prop: &[u8; PS_SEC_PROP_LEN],
        quote: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(MSG3_HEADER_LEN + quote.len());
        out.put_slice(&g_a.to_sgx_bytes());
        out.put_slice(ps_sec_prop);
        out.put_slice(quote);
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MSG3_HEADER_LEN + self.quote.len());
        out.put_slice(&self.mac);
        let mac_inputs =
            Self::mac_inputs(&self.g_a, &self.ps_sec_prop, &self.quote);
        out.put_slice(&mac_inputs);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < MSG3_HEADER_LEN {
            return Err(Error::malformed(
                "remote attestation msg3",
                format!("{} bytes is shorter than the header", bytes.len()),
            ));
        }
        let mut buf = bytes;
        Ok(Self {
            mac: get_array(&mut buf),
            g_a: PublicKey::from_sgx_bytes(&get_array(&mut buf)),
            ps_sec_prop: get_array(&mut buf),
            quote: buf.to_vec(),
        })
    }

    /// Whether the platform service security properties were provided.
    pub fn has_ps_sec_prop(&self) -> bool {
        self.ps_sec_prop.iter().any(|&b| b != 0)
    }
}

impl Msg4 {
    pub fn to_bytes(&self) -> [u8; MSG4_LEN] {
        let mut out = [0u8; MSG4_LEN];
        out[0] = self.verdict as u8;
        out[1..].copy_from_slice(&self.mac);
        out
    }

    pub fn from_bytes(bytes: &[u8; MSG4_LEN]) -> Result<Self, Error> {
        let verdict = match bytes[0] {
            0 => Verdict::Accepted,
            1 => Verdict::Rejected,
            other => return Err(Error::malformed(
                "remote attestation msg4",
                format!("unknown verdict {other}"),
            )),
        };
        let mut mac = [0u8; CMAC_TAG_LEN];
        mac.copy_from_slice(&bytes[1..]);
        Ok(Self { verdict, mac })
    }
}

fn get_array<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}
