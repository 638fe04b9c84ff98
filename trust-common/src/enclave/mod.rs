//! SGX lets an enclave produce a [`Report`] about itself, MAC'd under a key
//! only the *target* enclave on the same machine can derive. This module
//! provides byte-exact [`Report`] and [`TargetInfo`] types plus the
//! [`Platform`] trait that creates and verifies them.
//!
//! + In SGX, [`SgxPlatform`] calls `EREPORT` / `EGETKEY` via [`sgx_isa`].
//! + Outside SGX, [`MockPlatform`] computes the report MAC with AES-CMAC under
//!   a key derived from a shared mock "machine" key and the target's
//!   measurement.
//!
//! [`sgx_isa`]: https://docs.rs/sgx-isa

use std::fmt;

use bytes::{Buf, BufMut};
use cfg_if::cfg_if;
#[cfg(any(test, feature = "test-utils"))]
use proptest_derive::Arbitrary;
use thiserror::Error;

use crate::{hex, sha256};

mod mock;
pub use mock::MockPlatform;

cfg_if! {
    if #[cfg(target_env = "sgx")] {
        mod sgx;
        pub use sgx::SgxPlatform;
    }
}

/// Serialized size of a [`Report`].
pub const REPORT_LEN: usize = 432;
/// Size of the MAC'd portion of a [`Report`] (everything before `keyid`).
pub const REPORT_BODY_LEN: usize = 384;
/// Serialized size of a [`TargetInfo`].
pub const TARGET_INFO_LEN: usize = 512;
pub const REPORT_DATA_LEN: usize = 64;

/// Create and verify local attestation reports from inside an enclave.
pub trait Platform: Send + Sync {
    /// The identity this enclave reports about itself.
    fn identity(&self) -> EnclaveIdentity;

    /// The [`TargetInfo`] peers need to create reports this enclave can
    /// verify.
    fn target_info(&self) -> TargetInfo;

    /// Create a report about this enclave, verifiable only by `target`.
    fn create_report(
        &self,
        target: &TargetInfo,
        report_data: &ReportData,
    ) -> Result<Report, Error>;

    /// Verify the MAC of a report that was created with this enclave as its
    /// target.
    fn verify_report(&self, report: &Report) -> Result<(), Error>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{what} is {actual} bytes, expected {expected}")]
    InvalidLength {
        what: &'static str,
        actual: usize,
        expected: usize,
    },

    #[error("report MAC failed to verify")]
    InvalidReportMac,
}

/// An enclave measurement (`MRENCLAVE`), or an enclave signer measurement
/// (`MRSIGNER`).
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Measurement([u8; 32]);

/// The SGX `ATTRIBUTES` field.
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Attributes {
    pub flags: u64,
    pub xfrm: u64,
}

/// 64 bytes of caller-chosen data bound into a [`Report`].
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ReportData([u8; REPORT_DATA_LEN]);

/// The identity claims of an enclave, as read off a verified [`Report`].
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct EnclaveIdentity {
    pub measurement: Measurement,
    pub signer: Measurement,
    pub isv_prod_id: u16,
    pub isv_svn: u16,
    pub attributes: Attributes,
    pub misc_select: u32,
}

/// An SGX `REPORT`, in the exact 432-byte hardware layout.
#[derive(Clone, Eq, PartialEq)]
pub struct Report {
    pub cpu_svn: [u8; 16],
    pub misc_select: u32,
    pub isv_ext_prod_id: [u8; 16],
    pub attributes: Attributes,
    pub measurement: Measurement,
    pub signer: Measurement,
    pub config_id: [u8; 64],
    pub isv_prod_id: u16,
    pub isv_svn: u16,
    pub config_svn: u16,
    pub isv_family_id: [u8; 16],
    pub report_data: ReportData,
    pub key_id: [u8; 32],
    pub mac: [u8; 16],
}

/// An SGX `TARGETINFO`, in the exact 512-byte hardware layout.
#[derive(Clone, Eq, PartialEq)]
pub struct TargetInfo {
    pub measurement: Measurement,
    pub attributes: Attributes,
    pub config_svn: u16,
    pub misc_select: u32,
    pub config_id: [u8; 64],
}

// --- impl Measurement --- //

impl Measurement {
    pub const MOCK_ENCLAVE: Self =
        Self::new(*b"~~~~ ENCLAVE-TRUST MOCK ENCLAVE ");
    pub const MOCK_SIGNER: Self =
        Self::new(*b"==== ENCLAVE-TRUST MOCK SIGNER =");

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn to_array(self) -> [u8; 32] {
        self.0
    }

    pub const fn as_array(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&hex::display(&self.0), f)
    }
}

impl fmt::Debug for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Measurement")
            .field(&hex::display(&self.0))
            .finish()
    }
}

// --- impl Attributes --- //

impl Attributes {
    /// `ATTRIBUTES.DEBUG`: the enclave's memory can be inspected by a debugger.
    pub const DEBUG: u64 = 1 << 1;

    pub fn is_debug(&self) -> bool {
        self.flags & Self::DEBUG != 0
    }
}

// --- impl ReportData --- //

impl ReportData {
    pub const fn new(bytes: [u8; REPORT_DATA_LEN]) -> Self {
        Self(bytes)
    }

    /// The conventional layout: a 32-byte digest followed by 32 zero bytes.
    pub fn from_hash(hash: &sha256::Hash) -> Self {
        let mut bytes = [0u8; REPORT_DATA_LEN];
        bytes[..32].copy_from_slice(hash.as_ref());
        Self(bytes)
    }

    pub const fn as_array(&self) -> &[u8; REPORT_DATA_LEN] {
        &self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl Default for ReportData {
    fn default() -> Self {
        Self([0u8; REPORT_DATA_LEN])
    }
}

impl fmt::Debug for ReportData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReportData")
            .field(&hex::display(&self.0))
            .finish()
    }
}

// --- impl EnclaveIdentity --- //

impl fmt::Display for EnclaveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mrenclave={} mrsigner={} isvprodid={} isvsvn={}",
            self.measurement, self.signer, self.isv_prod_id, self.isv_svn,
        )?;
        if self.attributes.is_debug() {
            f.write_str(" (debug)")?;
        }
        Ok(())
    }
}

// --- impl Report --- //

impl Report {
    /// A report for `identity` with all other fields zeroed.
    pub fn new(identity: &EnclaveIdentity, report_data: ReportData) -> Self {
        Self {
            cpu_svn: [0; 16],
            misc_select: identity.misc_select,
            isv_ext_prod_id: [0; 16],
            attributes: identity.attributes,
            measurement: identity.measurement,
            signer: identity.signer,
            config_id: [0; 64],
            isv_prod_id: identity.isv_prod_id,
            isv_svn: identity.isv_svn,
            config_svn: 0,
            isv_family_id: [0; 16],
            report_data,
            key_id: [0; 32],
            mac: [0; 16],
        }
    }

    pub fn identity(&self) -> EnclaveIdentity {
        EnclaveIdentity {
            measurement: self.measurement,
            signer: self.signer,
            isv_prod_id: self.isv_prod_id,
            isv_svn: self.isv_svn,
            attributes: self.attributes,
            misc_select: self.misc_select,
        }
    }

    pub fn to_bytes(&self) -> [u8; REPORT_LEN] {
        let mut out = [0u8; REPORT_LEN];
        let mut buf = &mut out[..];
        self.put_body(&mut buf);
        buf.put_slice(&self.key_id);
        buf.put_slice(&self.mac);
        out
    }

    /// The MAC'd prefix of the report.
    pub fn body_bytes(&self) -> [u8; REPORT_BODY_LEN] {
        let mut out = [0u8; REPORT_BODY_LEN];
        self.put_body(&mut &mut out[..]);
        out
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        check_len("report", bytes.len(), REPORT_LEN)?;
        let mut buf = bytes;
        let mut report = Self::get_body(&mut buf);
        buf.copy_to_slice(&mut report.key_id);
        buf.copy_to_slice(&mut report.mac);
        Ok(report)
    }

    /// Parse just the 384-byte report body, as embedded in a quote. The
    /// `key_id` and `mac` are zeroed.
    pub fn try_from_body_bytes(bytes: &[u8]) -> Result<Self, Error> {
        check_len("report body", bytes.len(), REPORT_BODY_LEN)?;
        Ok(Self::get_body(&mut &bytes[..]))
    }

    fn put_body(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.cpu_svn); // 0
        buf.put_u32_le(self.misc_select); // 16
        buf.put_bytes(0, 12); // 20
        buf.put_slice(&self.isv_ext_prod_id); // 32
        put_attributes(buf, &self.attributes); // 48
        buf.put_slice(self.measurement.as_array()); // 64
        buf.put_bytes(0, 32); // 96
        buf.put_slice(self.signer.as_array()); // 128
        buf.put_bytes(0, 32); // 160
        buf.put_slice(&self.config_id); // 192
        buf.put_u16_le(self.isv_prod_id); // 256
        buf.put_u16_le(self.isv_svn); // 258
        buf.put_u16_le(self.config_svn); // 260
        buf.put_bytes(0, 42); // 262
        buf.put_slice(&self.isv_family_id); // 304
        buf.put_slice(self.report_data.as_array()); // 320
    }

    /// Caller has checked that `buf` holds at least [`REPORT_BODY_LEN`] bytes.
    fn get_body(buf: &mut &[u8]) -> Self {
        let cpu_svn = get_array(buf);
        let misc_select = buf.get_u32_le();
        buf.advance(12);
        let isv_ext_prod_id = get_array(buf);
        let attributes = get_attributes(buf);
        let measurement = Measurement::new(get_array(buf));
        buf.advance(32);
        let signer = Measurement::new(get_array(buf));
        buf.advance(32);
        let config_id = get_array(buf);
        let isv_prod_id = buf.get_u16_le();
        let isv_svn = buf.get_u16_le();
        let config_svn = buf.get_u16_le();
        buf.advance(42);
        let isv_family_id = get_array(buf);
        let report_data = ReportData::new(get_array(buf));
        Self {
            cpu_svn,
            misc_select,
            isv_ext_prod_id,
            attributes,
            measurement,
            signer,
            config_id,
            isv_prod_id,
            isv_svn,
            config_svn,
            isv_family_id,
            report_data,
            key_id: [0; 32],
            mac: [0; 16],
        }
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Report")
            .field("measurement", &self.measurement)
            .field("signer", &self.signer)
            .field("isv_prod_id", &self.isv_prod_id)
            .field("isv_svn", &self.isv_svn)
            .field("attributes", &self.attributes)
            .field("report_data", &self.report_data)
            .finish_non_exhaustive()
    }
}

// --- impl TargetInfo --- //

impl TargetInfo {
    /// Target info that lets us create reports for the enclave that created
    /// `report`.
    pub fn from_report(report: &Report) -> Self {
        Self {
            measurement: report.measurement,
            attributes: report.attributes,
            config_svn: report.config_svn,
            misc_select: report.misc_select,
            config_id: report.config_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; TARGET_INFO_LEN] {
        let mut out = [0u8; TARGET_INFO_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(self.measurement.as_array()); // 0
        put_attributes(&mut buf, &self.attributes); // 32
        buf.put_bytes(0, 2); // 48
        buf.put_u16_le(self.config_svn); // 50
        buf.put_u32_le(self.misc_select); // 52
        buf.put_bytes(0, 8); // 56
        buf.put_slice(&self.config_id); // 64
        // remaining 384 bytes are reserved
        out
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        check_len("target info", bytes.len(), TARGET_INFO_LEN)?;
        let mut buf = bytes;
        let measurement = Measurement::new(get_array(&mut buf));
        let attributes = get_attributes(&mut buf);
        buf.advance(2);
        let config_svn = buf.get_u16_le();
        let misc_select = buf.get_u32_le();
        buf.advance(8);
        let config_id = get_array(&mut buf);
        Ok(Self {
            measurement,
            attributes,
            config_svn,
            misc_select,
            config_id,
        })
    }
}

impl fmt::Debug for TargetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetInfo")
            .field("measurement", &self.measurement)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

// --- Helpers --- //

fn check_len(
    what: &'static str,
    actual: usize,
    expected: usize,
) -> Result<(), Error> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::InvalidLength {
            what,
            actual,
            expected,
        })
    }
}

fn put_attributes(buf: &mut impl BufMut, attributes: &Attributes) {
    buf.put_u64_le(attributes.flags);
    buf.put_u64_le(attributes.xfrm);
}

fn get_attributes(buf: &mut &[u8]) -> Attributes {
    let flags = buf.get_u64_le();
    let xfrm = buf.get_u64_le();
    Attributes { flags, xfrm }
}

fn get_array<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, prop_assert_eq, proptest};

    use super::*;

    fn report_from_parts(
        identity: EnclaveIdentity,
        data: [u8; 32],
        key_id: [u8; 32],
        mac: [u8; 16],
    ) -> Report {
        let mut report_data = [0u8; 64];
        report_data[..32].copy_from_slice(&data);
        let mut report = Report::new(&identity, ReportData::new(report_data));
        report.key_id = key_id;
        report.mac = mac;
        report.config_svn = identity.isv_svn ^ 0x5a5a;
        report
    }

    #[test]
    fn test_report_field_offsets() {
        let identity = EnclaveIdentity {
            measurement: Measurement::new([0x11; 32]),
            signer: Measurement::new([0x22; 32]),
            isv_prod_id: 0x0304,
            isv_svn: 0x0506,
            attributes: Attributes {
                flags: 0x07,
                xfrm: 0x08,
            },
            misc_select: 0x0a0b_0c0d,
        };
        let report =
            report_from_parts(identity, [0x33; 32], [0x44; 32], [0x55; 16]);
        let bytes = report.to_bytes();

        assert_eq!(&bytes[16..20], &[0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(bytes[48], 0x07);
        assert_eq!(bytes[56], 0x08);
        assert_eq!(&bytes[64..96], &[0x11; 32]);
        assert_eq!(&bytes[128..160], &[0x22; 32]);
        assert_eq!(&bytes[256..258], &[0x04, 0x03]);
        assert_eq!(&bytes[258..260], &[0x06, 0x05]);
        assert_eq!(&bytes[320..352], &[0x33; 32]);
        assert_eq!(&bytes[352..384], &[0; 32]);
        assert_eq!(&bytes[384..416], &[0x44; 32]);
        assert_eq!(&bytes[416..432], &[0x55; 16]);
        assert_eq!(&report.body_bytes()[..], &bytes[..REPORT_BODY_LEN]);
    }

    #[test]
    fn test_report_roundtrip() {
        proptest!(|(
            identity in any::<EnclaveIdentity>(),
            data in any::<[u8; 32]>(),
            key_id in any::<[u8; 32]>(),
            mac in any::<[u8; 16]>(),
        )| {
            let report = report_from_parts(identity, data, key_id, mac);
            let decoded = Report::try_from_bytes(&report.to_bytes()).unwrap();
            prop_assert_eq!(&decoded, &report);
            prop_assert_eq!(decoded.identity(), identity);

            let body =
                Report::try_from_body_bytes(&report.body_bytes()).unwrap();
            prop_assert_eq!(body.report_data, report.report_data);
            prop_assert_eq!(body.mac, [0u8; 16]);
        });
    }

    #[test]
    fn test_target_info_roundtrip() {
        proptest!(|(identity in any::<EnclaveIdentity>())| {
            let report = Report::new(&identity, ReportData::default());
            let target = TargetInfo::from_report(&report);
            let bytes = target.to_bytes();
            prop_assert_eq!(&bytes[..32], identity.measurement.as_array());
            let decoded = TargetInfo::try_from_bytes(&bytes).unwrap();
            prop_assert_eq!(decoded, target);
        });
    }

    #[test]
    fn test_bad_lengths() {
        assert!(matches!(
            Report::try_from_bytes(&[0u8; REPORT_LEN - 1]),
            Err(Error::InvalidLength { expected: REPORT_LEN, .. }),
        ));
        let too_long = [0u8; TARGET_INFO_LEN + 1];
        assert!(TargetInfo::try_from_bytes(&too_long).is_err());
    }
}
