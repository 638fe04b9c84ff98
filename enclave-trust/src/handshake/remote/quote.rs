//! The EPID quote layout (`sgx_quote_t`). Quotes are mostly opaque to us; the
//! service provider only reads the report body back out of the verified
//! quote body.
//!
//! ```text
//! version: u16 || sign_type: u16 || epid_group_id: [u8; 4] ||
//! qe_svn: u16 || pce_svn: u16 || xeid: u32 || basename: [u8; 32] ||
//! report_body: [u8; 384] || signature_len: u32 || signature
//! ```

use bytes::{Buf, BufMut};
use trust_common::enclave::{REPORT_BODY_LEN, Report};

use super::GroupId;
use crate::handshake::{Error, len_u32};

/// Offset of the report body within a quote.
pub const QUOTE_REPORT_BODY_OFFSET: usize = 48;
/// Length of the quote body: everything up to the signature length.
pub const QUOTE_BODY_LEN: usize = QUOTE_REPORT_BODY_OFFSET + REPORT_BODY_LEN;

#[derive(Clone, Debug)]
pub struct Quote {
    pub version: u16,
    pub sign_type: u16,
    pub group_id: GroupId,
    pub qe_svn: u16,
    pub pce_svn: u16,
    pub xeid: u32,
    pub basename: [u8; 32],
    /// The quoted report. `key_id` and `mac` are zero.
    pub report: Report,
    pub signature: Vec<u8>,
}

impl Quote {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let signature_len = len_u32("quote signature", self.signature.len())?;
        let mut out =
            Vec::with_capacity(QUOTE_BODY_LEN + 4 + self.signature.len());
        out.put_slice(&self.body_bytes());
        out.put_u32_le(signature_len);
        out.put_slice(&self.signature);
        Ok(out)
    }

    /// The signed prefix the verification service echoes back as
    /// `isvEnclaveQuoteBody`.
    pub fn body_bytes(&self) -> [u8; QUOTE_BODY_LEN] {
        let mut out = [0u8; QUOTE_BODY_LEN];
        let mut buf = &mut out[..];
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.sign_type);
        buf.put_slice(&self.group_id.0);
        buf.put_u16_le(self.qe_svn);
        buf.put_u16_le(self.pce_svn);
        buf.put_u32_le(self.xeid);
        buf.put_slice(&self.basename);
        buf.put_slice(&self.report.body_bytes());
        out
    }

    /// Parse a full quote, including its signature.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut quote = Self::try_from_body_bytes(bytes)?;
        let mut rest = &bytes[QUOTE_BODY_LEN..];
        if rest.remaining() < 4 {
            return Err(Error::malformed("quote", "missing signature length"));
        }
        let signature_len = rest.get_u32_le() as usize;
        if rest.len() != signature_len {
            return Err(Error::malformed(
                "quote",
                format!(
                    "signature is {} bytes, header says {signature_len}",
                    rest.len()
                ),
            ));
        }
        quote.signature = rest.to_vec();
        Ok(quote)
    }

    /// Parse a quote body. Trailing bytes (the signature) are ignored.
    pub fn try_from_body_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < QUOTE_BODY_LEN {
            return Err(Error::malformed(
                "quote",
                format!("{} bytes is shorter than a quote body", bytes.len()),
            ));
        }
        let mut buf = bytes;
        let version = buf.get_u16_le();
        let sign_type = buf.get_u16_le();
        let mut group_id = [0u8; 4];
        buf.copy_to_slice(&mut group_id);
        let qe_svn = buf.get_u16_le();
        let pce_svn = buf.get_u16_le();
        let xeid = buf.get_u32_le();
        let mut basename = [0u8; 32];
        buf.copy_to_slice(&mut basename);
        let report = Report::try_from_body_bytes(&buf[..REPORT_BODY_LEN])?;
        Ok(Self {
            version,
            sign_type,
            group_id: GroupId(group_id),
            qe_svn,
            pce_svn,
            xeid,
            basename,
            report,
            signature: Vec::new(),
        })
    }
}

#[cfg(test)]
mod test {
    use trust_common::enclave::{EnclaveIdentity, Measurement, ReportData};

    use super::*;

    fn quote() -> Quote {
        let identity = EnclaveIdentity {
            measurement: Measurement::new([0xab; 32]),
            ..Default::default()
        };
        Quote {
            version: 2,
            sign_type: 1,
            group_id: GroupId([0xc, 0xb, 0, 0]),
            qe_svn: 7,
            pce_svn: 8,
            xeid: 0,
            basename: [0x11; 32],
            report: Report::new(&identity, ReportData::new([0x42; 64])),
            signature: vec![0x99; 680],
        }
    }

    #[test]
    fn test_quote_layout() {
        let quote = quote();
        let bytes = quote.to_bytes().unwrap();
        assert_eq!(bytes.len(), QUOTE_BODY_LEN + 4 + 680);
        assert_eq!(&bytes[4..8], &[0xc, 0xb, 0, 0]);
        // report body: mrenclave at +64, report data at +320
        let body = &bytes[QUOTE_REPORT_BODY_OFFSET..];
        assert_eq!(&body[64..96], &[0xab; 32]);
        assert_eq!(&body[320..384], &[0x42; 64]);

        let decoded = Quote::try_from_bytes(&bytes).unwrap();
        assert_eq!(decoded.report, quote.report);
        assert_eq!(decoded.signature.len(), 680);
        assert_eq!(decoded.group_id, quote.group_id);

        let body = Quote::try_from_body_bytes(&quote.body_bytes()).unwrap();
        assert_eq!(body.report.report_data, ReportData::new([0x42; 64]));
        assert!(body.signature.is_empty());
    }

    #[test]
    fn test_truncated_quotes() {
        let bytes = quote().to_bytes().unwrap();
        let short = &bytes[..QUOTE_BODY_LEN - 1];
        assert!(Quote::try_from_body_bytes(short).is_err());
        assert!(Quote::try_from_bytes(&bytes[..QUOTE_BODY_LEN + 2]).is_err());
        assert!(Quote::try_from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
