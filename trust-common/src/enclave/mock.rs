//! A mock [`Platform`] for running enclave code outside of SGX.
//!
//! NOTE: this provides no security whatsoever. Any process that knows the mock
//! machine key can forge reports.

use tracing::trace;

use super::{
    Attributes, EnclaveIdentity, Error, Measurement, Platform, Report,
    ReportData, TargetInfo,
};
use crate::mac::{aes128_cmac, aes128_cmac_verify};

/// Mock enclaves sharing a machine key can attest to each other, the way SGX
/// enclaves on the same CPU can.
#[derive(Clone)]
pub struct MockPlatform {
    identity: EnclaveIdentity,
    machine_key: [u8; 16],
}

impl MockPlatform {
    pub const MACHINE_KEY: [u8; 16] = *b"mock sgx machine";

    /// `ATTRIBUTES.INIT | ATTRIBUTES.MODE64BIT`
    const FLAGS: u64 = 0x1 | 0x4;
    /// x87 + SSE
    const XFRM: u64 = 0x3;

    /// A mock enclave with the given identity on the default mock machine.
    pub fn new(identity: EnclaveIdentity) -> Self {
        Self::on_machine(identity, Self::MACHINE_KEY)
    }

    /// A mock enclave with the given identity on a specific mock machine.
    pub fn on_machine(
        identity: EnclaveIdentity,
        machine_key: [u8; 16],
    ) -> Self {
        Self {
            identity,
            machine_key,
        }
    }

    /// A mock enclave with the mock signer and a custom enclave measurement.
    pub fn with_measurement(measurement: Measurement) -> Self {
        Self::new(EnclaveIdentity {
            measurement,
            signer: Measurement::MOCK_SIGNER,
            isv_prod_id: 0,
            isv_svn: 0,
            attributes: Attributes {
                flags: Self::FLAGS,
                xfrm: Self::XFRM,
            },
            misc_select: 0,
        })
    }

    /// Stand-in for the EGETKEY report key of the enclave `target`.
    fn report_key(&self, target: &Measurement) -> [u8; 16] {
        aes128_cmac(&self.machine_key, &[b"REPORT KEY", target.as_array()])
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::with_measurement(Measurement::MOCK_ENCLAVE)
    }
}

impl Platform for MockPlatform {
    fn identity(&self) -> EnclaveIdentity {
        self.identity
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo::from_report(&Report::new(
            &self.identity,
            ReportData::default(),
        ))
    }

    fn create_report(
        &self,
        target: &TargetInfo,
        report_data: &ReportData,
    ) -> Result<Report, Error> {
        let mut report = Report::new(&self.identity, *report_data);
        let key = self.report_key(&target.measurement);
        report.mac = aes128_cmac(&key, &[&report.body_bytes()]);
        trace!(target = %target.measurement, "mock report created");
        Ok(report)
    }

    fn verify_report(&self, report: &Report) -> Result<(), Error> {
        let key = self.report_key(&self.identity.measurement);
        if aes128_cmac_verify(&key, &[&report.body_bytes()], &report.mac) {
            Ok(())
        } else {
            Err(Error::InvalidReportMac)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn enclave(byte: u8) -> MockPlatform {
        MockPlatform::with_measurement(Measurement::new([byte; 32]))
    }

    #[test]
    fn test_report_verifies_only_at_target() {
        let (alice, bob, carol) = (enclave(1), enclave(2), enclave(3));
        let data = ReportData::new([0x42; 64]);

        let report = alice.create_report(&bob.target_info(), &data).unwrap();
        assert_eq!(report.identity(), alice.identity());
        assert_eq!(report.report_data, data);

        bob.verify_report(&report).unwrap();
        assert!(matches!(
            carol.verify_report(&report),
            Err(Error::InvalidReportMac)
        ));
        // not even the creator can verify a report targeted elsewhere
        assert!(alice.verify_report(&report).is_err());
    }

    #[test]
    fn test_tampered_report_fails() {
        let (alice, bob) = (enclave(1), enclave(2));
        let report = alice
            .create_report(&bob.target_info(), &ReportData::default())
            .unwrap();

        let mut forged = report.clone();
        forged.measurement = Measurement::new([9; 32]);
        assert!(bob.verify_report(&forged).is_err());

        let mut forged = report;
        forged.report_data = ReportData::new([1; 64]);
        assert!(bob.verify_report(&forged).is_err());
    }

    #[test]
    fn test_different_machines_cannot_attest() {
        let alice = enclave(1);
        let remote_bob = MockPlatform::on_machine(
            enclave(2).identity(),
            *b"another machine!",
        );
        let report = alice
            .create_report(&remote_bob.target_info(), &ReportData::default())
            .unwrap();
        assert!(remote_bob.verify_report(&report).is_err());
    }
}
