//! Local attestation: a three-message mutual Diffie-Hellman exchange between
//! two enclaves on the same machine, each proving its identity with a
//! [`Report`] only the other can verify.
//!
//! ```text
//! LocalResponder                               LocalInitiator
//!   Initial     --- msg1: g_a, target_info --->  Initial
//!   Msg1Sent    <-- msg2: g_b, report, cmac ---  Msg2Sent
//!   Done        --- msg3: cmac, report ------->  Done
//! ```
//!
//! Each report's data is `SHA-256(own_half_of_dh || other_half)`, which binds
//! the exchange to the attested enclaves. The handshake MAC key is
//! `ckdf(shared, "SMK")`, the session root is `AEK = ckdf(shared, "AEK")`,
//! and the channel keys are `ckdf(AEK, "SK")` and `ckdf(AEK, "MK")`.

use tracing::info;
use trust_common::{
    enclave::{EnclaveIdentity, Platform, Report, ReportData},
    mac::aes128_cmac_verify,
    sha256,
};

use crate::{
    handshake::{Error, PeerIdentityCheck, SessionKeys},
    kdf::{self, Key128, label},
    p256::PublicKey,
};

mod initiator;
mod messages;
mod responder;

pub use initiator::LocalInitiator;
pub use messages::{MSG1_LEN, MSG2_LEN, MSG3_HEADER_LEN};
pub use responder::LocalResponder;

/// Keys derived from the DH shared secret.
struct DhKeys {
    smk: Key128,
    aek: Key128,
}

impl DhKeys {
    fn derive(shared_secret: &[u8]) -> Self {
        Self {
            smk: kdf::ckdf(shared_secret, label::SMK),
            aek: kdf::ckdf(shared_secret, label::AEK),
        }
    }
}

fn session_keys(aek: &Key128) -> SessionKeys {
    SessionKeys {
        secret_key: kdf::ckdf(aek.expose_secret(), label::SK),
        mask_key: kdf::ckdf(aek.expose_secret(), label::MK),
    }
}

/// `SHA-256(first || second)` over the SGX encodings of the DH halves.
fn report_binding(first: &PublicKey, second: &PublicKey) -> ReportData {
    ReportData::from_hash(&sha256::digest_many(&[
        &first.to_sgx_bytes(),
        &second.to_sgx_bytes(),
    ]))
}

/// Check a peer report that claims to be targeted at us and bound to this
/// exchange, then run the caller's identity check on it.
fn verify_peer_report(
    message: &'static str,
    platform: &dyn Platform,
    smk: &Key128,
    mac_inputs: &[u8],
    cmac: &[u8; 16],
    report: &Report,
    expected_binding: &ReportData,
    peer_check: Option<&mut PeerIdentityCheck>,
) -> Result<EnclaveIdentity, Error> {
    if !aes128_cmac_verify(smk.expose_secret(), &[mac_inputs], cmac) {
        return Err(Error::InvalidMac(message));
    }
    platform.verify_report(report)?;
    if &report.report_data != expected_binding {
        return Err(Error::ReportDataMismatch(message));
    }

    let identity = report.identity();
    if let Some(check) = peer_check {
        check(&identity).map_err(Error::PeerRejected)?;
    }
    info!(peer = %identity, "local attestation peer verified");
    Ok(identity)
}
