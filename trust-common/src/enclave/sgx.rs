//! The real [`Platform`], backed by the `EREPORT` and `EGETKEY` instructions.

use super::{
    EnclaveIdentity, Error, Platform, Report, ReportData, TARGET_INFO_LEN,
    TargetInfo,
};
use crate::mac::aes128_cmac_verify;

pub struct SgxPlatform {
    identity: EnclaveIdentity,
    target_info: TargetInfo,
}

impl SgxPlatform {
    pub fn new() -> Result<Self, Error> {
        let self_report = sgx_isa::Report::for_self();
        let identity = Report::try_from_bytes(self_report.as_ref())?.identity();
        let target_info = TargetInfo::try_from_bytes(
            sgx_isa::Targetinfo::from(self_report).as_ref(),
        )?;
        Ok(Self {
            identity,
            target_info,
        })
    }
}

impl Platform for SgxPlatform {
    fn identity(&self) -> EnclaveIdentity {
        self.identity
    }

    fn target_info(&self) -> TargetInfo {
        self.target_info.clone()
    }

    fn create_report(
        &self,
        target: &TargetInfo,
        report_data: &ReportData,
    ) -> Result<Report, Error> {
        let target = sgx_isa::Targetinfo::try_copy_from(&target.to_bytes())
            .ok_or(Error::InvalidLength {
                what: "target info",
                actual: TARGET_INFO_LEN,
                expected: sgx_isa::Targetinfo::UNPADDED_SIZE,
            })?;
        let report =
            sgx_isa::Report::for_target(&target, report_data.as_array());
        Report::try_from_bytes(report.as_ref())
    }

    fn verify_report(&self, report: &Report) -> Result<(), Error> {
        let bytes = report.to_bytes();
        let report = sgx_isa::Report::try_copy_from(&bytes).ok_or(
            Error::InvalidLength {
                what: "report",
                actual: bytes.len(),
                expected: sgx_isa::Report::UNPADDED_SIZE,
            },
        )?;

        // `verify` derives our report key with EGETKEY and hands it to us
        let is_valid_mac = report.verify(|key, body, mac| {
            aes128_cmac_verify(key, &[&body[..]], mac)
        });
        if is_valid_mac {
            Ok(())
        } else {
            Err(Error::InvalidReportMac)
        }
    }
}
