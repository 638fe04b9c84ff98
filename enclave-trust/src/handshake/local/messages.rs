//! Wire formats. Points are SGX little-endian `x || y`, integers little
//! endian.
//!
//! ```text
//! msg1 (responder -> initiator, 576 bytes)
//!     g_a: [u8; 64] || target_info: [u8; 512]
//! msg2 (initiator -> responder, 512 bytes)
//!     g_b: [u8; 64] || report: [u8; 432] || cmac: [u8; 16]
//! msg3 (responder -> initiator, u64 length prefixed)
//!     cmac: [u8; 16] || report: [u8; 432] || props_len: u32 || props
//! ```

use bytes::{Buf, BufMut};
use trust_common::{
    enclave::{REPORT_LEN, Report, TARGET_INFO_LEN, TargetInfo},
    mac::CMAC_TAG_LEN,
};

use crate::{
    handshake::{Error, len_u32},
    p256::{PublicKey, SGX_POINT_LEN},
};

pub const MSG1_LEN: usize = SGX_POINT_LEN + TARGET_INFO_LEN;
pub const MSG2_LEN: usize = SGX_POINT_LEN + REPORT_LEN + CMAC_TAG_LEN;
pub const MSG3_HEADER_LEN: usize = CMAC_TAG_LEN + REPORT_LEN + 4;

pub(super) struct Msg1 {
    pub g_a: PublicKey,
    pub target_info: TargetInfo,
}

pub(super) struct Msg2 {
    pub g_b: PublicKey,
    pub report: Report,
    pub cmac: [u8; CMAC_TAG_LEN],
}

pub(super) struct Msg3 {
    pub cmac: [u8; CMAC_TAG_LEN],
    pub report: Report,
    pub additional_props: Vec<u8>,
}

impl Msg1 {
    pub fn to_bytes(&self) -> [u8; MSG1_LEN] {
        let mut out = [0u8; MSG1_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(&self.g_a.to_sgx_bytes());
        buf.put_slice(&self.target_info.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; MSG1_LEN]) -> Result<Self, Error> {
        let (g_a, target_info) = bytes.split_at(SGX_POINT_LEN);
        Ok(Self {
            g_a: point(g_a),
            target_info: TargetInfo::try_from_bytes(target_info)?,
        })
    }
}

impl Msg2 {
    /// The bytes covered by `cmac`.
    pub fn mac_inputs(g_b: &PublicKey, report: &Report) -> Vec<u8> {
        let mut out = Vec::with_capacity(SGX_POINT_LEN + REPORT_LEN);
        out.put_slice(&g_b.to_sgx_bytes());
        out.put_slice(&report.to_bytes());
        out
    }

    pub fn to_bytes(&self) -> [u8; MSG2_LEN] {
        let mut out = [0u8; MSG2_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(&Self::mac_inputs(&self.g_b, &self.report));
        buf.put_slice(&self.cmac);
        out
    }

    pub fn from_bytes(bytes: &[u8; MSG2_LEN]) -> Result<Self, Error> {
        let (g_b, rest) = bytes.split_at(SGX_POINT_LEN);
        let (report, cmac) = rest.split_at(REPORT_LEN);
        let mut tag = [0u8; CMAC_TAG_LEN];
        tag.copy_from_slice(cmac);
        Ok(Self {
            g_b: point(g_b),
            report: Report::try_from_bytes(report)?,
            cmac: tag,
        })
    }
}

impl Msg3 {
    /// The bytes covered by `cmac`: everything after it.
    pub fn mac_inputs(
        report: &Report,
        additional_props: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let props_len =
            len_u32("additional properties", additional_props.len())?;
        let mut out =
            Vec::with_capacity(REPORT_LEN + 4 + additional_props.len());
        out.put_slice(&report.to_bytes());
        out.put_u32_le(props_len);
        out.put_slice(additional_props);
        Ok(out)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let body = Self::mac_inputs(&self.report, &self.additional_props)?;
        let mut out = Vec::with_capacity(CMAC_TAG_LEN + body.len());
        out.put_slice(&self.cmac);
        out.put_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < MSG3_HEADER_LEN {
            return Err(Error::malformed(
                "local attestation msg3",
                format!("{} bytes is shorter than the header", bytes.len()),
            ));
        }
        let mut buf = bytes;
        let mut cmac = [0u8; CMAC_TAG_LEN];
        buf.copy_to_slice(&mut cmac);
        let report = Report::try_from_bytes(&buf[..REPORT_LEN])?;
        buf.advance(REPORT_LEN);
        let props_len = buf.get_u32_le() as usize;
        if buf.len() != props_len {
            return Err(Error::malformed(
                "local attestation msg3",
                format!(
                    "additional properties are {} bytes, header says \
                     {props_len}",
                    buf.len()
                ),
            ));
        }
        Ok(Self {
            cmac,
            report,
            additional_props: buf.to_vec(),
        })
    }
}

fn point(bytes: &[u8]) -> PublicKey {
    let mut sgx = [0u8; SGX_POINT_LEN];
    sgx.copy_from_slice(bytes);
    PublicKey::from_sgx_bytes(&sgx)
}

#[cfg(test)]
mod test {
    use trust_common::enclave::{
        EnclaveIdentity, Measurement, MockPlatform, Platform, ReportData,
    };

    use super::*;
    use crate::p256::EphemeralKey;

    fn report() -> Report {
        let platform =
            MockPlatform::with_measurement(Measurement::new([7; 32]));
        platform
            .create_report(&platform.target_info(), &ReportData::new([3; 64]))
            .unwrap()
    }

    #[test]
    fn test_message_lengths() {
        assert_eq!(MSG1_LEN, 576);
        assert_eq!(MSG2_LEN, 512);
        assert_eq!(MSG3_HEADER_LEN, 452);
    }

    #[test]
    fn test_msg_roundtrips() {
        let key = *EphemeralKey::generate().unwrap().public_key();
        let report = report();

        let msg1 = Msg1 {
            g_a: key,
            target_info: TargetInfo::from_report(&report),
        };
        let decoded = Msg1::from_bytes(&msg1.to_bytes()).unwrap();
        assert_eq!(decoded.g_a, key);
        assert_eq!(decoded.target_info, msg1.target_info);

        let msg2 = Msg2 {
            g_b: key,
            report: report.clone(),
            cmac: [9; 16],
        };
        let decoded = Msg2::from_bytes(&msg2.to_bytes()).unwrap();
        assert_eq!(decoded.report, report);
        assert_eq!(decoded.cmac, [9; 16]);

        let msg3 = Msg3 {
            cmac: [5; 16],
            report: report.clone(),
            additional_props: b"props".to_vec(),
        };
        let bytes = msg3.to_bytes().unwrap();
        assert_eq!(bytes.len(), MSG3_HEADER_LEN + 5);
        let decoded = Msg3::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.additional_props, b"props");
        assert_eq!(decoded.report.identity(), EnclaveIdentity {
            measurement: Measurement::new([7; 32]),
            ..report.identity()
        });
    }

    #[test]
    fn test_msg3_bad_lengths() {
        let msg3 = Msg3 {
            cmac: [0; 16],
            report: report(),
            additional_props: vec![1, 2, 3],
        };
        let bytes = msg3.to_bytes().unwrap();
        assert!(Msg3::from_bytes(&bytes[..MSG3_HEADER_LEN - 1]).is_err());
        assert!(Msg3::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
