//! Remote attestation of an enclave ([`RaClient`]) to a service provider
//! ([`RaServer`]) that has its evidence checked by an [`ExternalVerifier`].
//!
//! ```text
//! RaClient (enclave)                               RaServer (service provider)
//!   Initial            --- msg0s: extended gid --->  Initial
//!   GroupIdSent        <-- msg0r: SP signing key --  GroupIdEchoed
//!   ContextInitialized
//!   KeyExchangeSent    --- msg1: g_a, gid -------->
//!                      <-- msg2: g_b, sig, sig_rl -  KeyExchangeReceived
//!   EvidenceSubmitted  --- msg3: quote ----------->  (verifier round trip)
//!   Done               <-- msg4: verdict ---------  EvidenceReceived -> Done
//! ```
//!
//! Both sides derive `SMK`, `MK`, `SK`, `VK` with [`ckdf`] from the ECDH
//! shared secret. The enclave binds `SHA-256(g_a || g_b || VK)` into its
//! quote, optionally customized by a [`ReportDataFn`], so that a verified
//! quote proves the enclave holds this session's keys.
//!
//! [`ckdf`]: crate::kdf::ckdf

use std::{fmt, str::FromStr, sync::Arc};

use anyhow::{anyhow, ensure};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use trust_common::{
    enclave::{Report, ReportData, TargetInfo},
    hex, sha256,
};

use crate::{kdf::Key128, p256::PublicKey};

mod client;
mod messages;
pub mod quote;
mod server;
pub mod verifier;

pub use client::RaClient;
pub use messages::{
    MSG0R_LEN, MSG0S_LEN, MSG1_LEN, MSG2_HEADER_LEN, MSG3_HEADER_LEN, MSG4_LEN,
};
pub use server::{RaServer, RaServerConfig};
pub use verifier::{AttestationEvidence, ExternalVerifier, VerificationReport};

/// The only key derivation function defined for remote attestation.
pub const KDF_ID: u16 = 1;

/// An EPID group id, `sgx_epid_group_id_t`.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct GroupId(pub [u8; 4]);

/// A service provider id, registered with the verification service.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct Spid(pub [u8; 16]);

/// Whether quotes from the same platform are linkable by the verifier.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum QuoteType {
    Unlinkable,
    #[default]
    Linkable,
}

/// Customizes the report data an enclave binds into its quote. Both sides
/// must apply the same function to the standard report data.
pub type ReportDataFn = Arc<dyn Fn(&ReportData) -> ReportData + Send + Sync>;

/// The parameters an enclave needs to get its report quoted.
#[derive(Copy, Clone, Debug)]
pub struct QuoteRequest<'a> {
    pub spid: Spid,
    pub quote_type: QuoteType,
    /// The signature revocation list for the enclave's EPID group.
    pub sig_rl: &'a [u8],
}

/// The untrusted host's quoting service.
pub trait QuoteProvider: Send + Sync {
    fn extended_group_id(&self) -> anyhow::Result<u32>;

    fn group_id(&self) -> anyhow::Result<GroupId>;

    /// The quoting enclave's target info; the enclave's report must target
    /// it.
    fn qe_target_info(&self) -> anyhow::Result<TargetInfo>;

    /// Convert an enclave report into a quote.
    fn get_quote(
        &self,
        report: &Report,
        request: QuoteRequest<'_>,
    ) -> anyhow::Result<Vec<u8>>;
}

/// The per-session keys shared by both sides of a remote attestation.
struct RaKeys {
    smk: Key128,
    mk: Key128,
    sk: Key128,
    vk: Key128,
}

impl RaKeys {
    fn derive(shared_secret: &[u8]) -> Self {
        use crate::kdf::{ckdf, label};
        Self {
            smk: ckdf(shared_secret, label::SMK),
            mk: ckdf(shared_secret, label::MK),
            sk: ckdf(shared_secret, label::SK),
            vk: ckdf(shared_secret, label::VK),
        }
    }

    fn session_keys(&self) -> crate::handshake::SessionKeys {
        crate::handshake::SessionKeys {
            secret_key: self.sk.duplicate(),
            mask_key: self.mk.duplicate(),
        }
    }
}

/// `SHA-256(g_a || g_b || VK) || 0^32`.
pub fn standard_report_data(
    g_a: &PublicKey,
    g_b: &PublicKey,
    vk: &Key128,
) -> ReportData {
    ReportData::from_hash(&sha256::digest_many(&[
        &g_a.to_sgx_bytes(),
        &g_b.to_sgx_bytes(),
        vk.expose_secret(),
    ]))
}

/// Use the standard report data as is.
pub fn default_report_data_fn() -> ReportDataFn {
    Arc::new(|std_data: &ReportData| *std_data)
}

/// Fold extra caller data into the report data:
/// `SHA-256(standard_report_data || additional) || 0^32`.
///
/// A common `additional` is a [`KeyRegistry`] digest, which commits the
/// enclave to the set of identity keys it trusts.
///
/// [`KeyRegistry`]: crate::keyring::KeyRegistry
pub fn fold_report_data_fn(additional: Vec<u8>) -> ReportDataFn {
    Arc::new(move |std_data: &ReportData| {
        ReportData::from_hash(&sha256::digest_many(&[
            std_data.as_slice(),
            &additional,
        ]))
    })
}

// --- impl GroupId --- //

impl GroupId {
    /// The group id as the little-endian `u32` SGX tooling prints.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.to_u32())
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({self})")
    }
}

// --- impl Spid --- //

impl FromStr for Spid {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode_array(s)
            .map(Self)
            .map_err(|err| anyhow!("Invalid SPID: {err}"))
    }
}

impl fmt::Display for Spid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&hex::display(&self.0), f)
    }
}

impl fmt::Debug for Spid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Spid({self})")
    }
}

// --- impl QuoteType --- //

impl QuoteType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unlinkable => "unlinkable",
            Self::Linkable => "linkable",
        }
    }

    /// The `quote_type` field of msg2.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Unlinkable => 0,
            Self::Linkable => 1,
        }
    }

    pub fn try_from_u16(value: u16) -> anyhow::Result<Self> {
        ensure!(value <= 1, "Invalid quote type {value}");
        Ok(if value == 0 {
            Self::Unlinkable
        } else {
            Self::Linkable
        })
    }
}

impl FromStr for QuoteType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unlinkable" => Ok(Self::Unlinkable),
            "linkable" => Ok(Self::Linkable),
            _ => Err(anyhow!("Invalid `QuoteType`: '{s}'")),
        }
    }
}

impl fmt::Display for QuoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use trust_common::enclave::{EnclaveIdentity, MockPlatform, Platform};

    use super::*;
    use crate::{
        handshake::{ErrorCategory, Error, Handshake, Role},
        keyring::{IdentityKey, KeyRegistry},
        p256::EphemeralKey,
        test_utils::{MemPipe, MockQuoteProvider, MockVerifier},
    };

    const SPID: Spid = Spid([0x5a; 16]);

    struct Fixture {
        client: RaClient,
        server: RaServer,
        verifier: Arc<MockVerifier>,
    }

    fn fixture(trust_sp_key: bool) -> Fixture {
        let sp_key =
            Arc::new(IdentityKey::generate("service-provider").unwrap());
        let registry = Arc::new(KeyRegistry::new());
        if trust_sp_key {
            registry.register(sp_key.clone()).unwrap();
        }
        let verifier = Arc::new(MockVerifier::new());

        let client = RaClient::new(
            Arc::new(MockPlatform::default()),
            Arc::new(MockQuoteProvider::new()),
            registry,
        );
        let server = RaServer::new(
            sp_key,
            verifier.clone(),
            RaServerConfig::new(SPID),
        );
        Fixture {
            client,
            server,
            verifier,
        }
    }

    /// Step both sides in lock step. Returns the first error.
    fn run(client: &mut RaClient, server: &mut RaServer) -> Result<(), Error> {
        let (mut c_stream, mut s_stream) = MemPipe::pair();
        client.step(&mut c_stream)?; // msg0s
        server.step(&mut s_stream)?; // msg0r
        client.step(&mut c_stream)?; // authenticate SP key
        client.step(&mut c_stream)?; // msg1
        server.step(&mut s_stream)?; // msg2
        client.step(&mut c_stream)?; // msg3
        server.step(&mut s_stream)?; // verify evidence
        server.step(&mut s_stream)?; // msg4
        client.step(&mut c_stream)?;
        Ok(())
    }

    #[test]
    fn test_lockstep_handshake_agrees_on_keys() {
        let Fixture {
            mut client,
            mut server,
            verifier,
        } = fixture(true);
        run(&mut client, &mut server).unwrap();
        assert!(client.is_done() && server.is_done());
        assert_eq!(client.role(), Role::Initiator);
        assert_eq!(server.role(), Role::Responder);

        let c_keys = client.session_keys().unwrap();
        let s_keys = server.session_keys().unwrap();
        assert_eq!(
            c_keys.secret_key.expose_secret(),
            s_keys.secret_key.expose_secret()
        );
        assert_eq!(
            c_keys.mask_key.expose_secret(),
            s_keys.mask_key.expose_secret()
        );
        assert!(server.verification_key().is_some());
        assert!(server.session_mac_key().is_some());

        let identity = server.attested_identity().unwrap();
        assert_eq!(identity, &MockPlatform::default().identity());
        let report = server.verification_report().unwrap();
        assert_eq!(report.signature, b"mock signature");
        assert_eq!(verifier.num_submissions(), 1);

        // the verifier saw a well-formed request
        let request: serde_json::Value =
            serde_json::from_str(&verifier.last_request().unwrap()).unwrap();
        assert_eq!(request["nonce"].as_str().unwrap().len(), 32);
        assert!(request.get("pseManifest").is_none());
    }

    #[test]
    fn test_untrusted_service_provider() {
        let Fixture {
            mut client,
            mut server,
            ..
        } = fixture(false);
        let err = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, Error::UntrustedSigningKey));
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert!(client.session_keys().is_err());
    }

    #[test]
    fn test_unsupported_extended_group_id() {
        let Fixture {
            mut client,
            verifier,
            ..
        } = fixture(true);
        let config = RaServerConfig {
            extended_group_ids: vec![7],
            ..RaServerConfig::new(SPID)
        };
        let sp_key = Arc::new(IdentityKey::generate("other-sp").unwrap());
        let mut server = RaServer::new(sp_key, verifier, config);

        let err = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, Error::UnsupportedGroupId(0)));
        assert_eq!(err.category(), ErrorCategory::InputValidation);
    }

    #[test]
    fn test_rejected_quote_status() {
        let Fixture {
            mut client,
            mut server,
            verifier,
        } = fixture(true);
        verifier.set_quote_status("GROUP_REVOKED");

        let (mut c_stream, mut s_stream) = MemPipe::pair();
        client.step(&mut c_stream).unwrap(); // msg0s
        server.step(&mut s_stream).unwrap(); // msg0r
        client.step(&mut c_stream).unwrap();
        client.step(&mut c_stream).unwrap(); // msg1
        server.step(&mut s_stream).unwrap(); // msg2
        client.step(&mut c_stream).unwrap(); // msg3

        let err = server.step(&mut s_stream).unwrap_err();
        assert!(matches!(err, Error::Verification(_)), "{err:?}");
        assert_eq!(err.category(), ErrorCategory::Verification);
        assert!(server.session_keys().is_err());
        assert!(server.attested_identity().is_none());

        // the client learns of the rejection through msg4
        let err = client.step(&mut c_stream).unwrap_err();
        assert!(matches!(err, Error::RejectedByPeer));
        assert!(!client.is_done());
    }

    /// Rejects reports not signed with `trusted_signature`.
    struct SignatureChecking {
        inner: MockVerifier,
        trusted_signature: &'static [u8],
    }

    impl ExternalVerifier for SignatureChecking {
        fn fetch_revocation_list(
            &self,
            gid: GroupId,
        ) -> anyhow::Result<Vec<u8>> {
            self.inner.fetch_revocation_list(gid)
        }

        fn submit_evidence(
            &self,
            request_body: &str,
        ) -> anyhow::Result<VerificationReport> {
            let report = self.inner.submit_evidence(request_body)?;
            anyhow::ensure!(
                report.signature == self.trusted_signature,
                "report signature doesn't verify"
            );
            Ok(report)
        }
    }

    #[test]
    fn test_verifier_signature_failure_aborts() {
        let pair = |trusted_signature: &'static [u8]| {
            let sp_key = Arc::new(IdentityKey::generate("sp").unwrap());
            let registry = Arc::new(KeyRegistry::new());
            registry.register(sp_key.clone()).unwrap();
            let client = RaClient::new(
                Arc::new(MockPlatform::default()),
                Arc::new(MockQuoteProvider::new()),
                registry,
            );
            let verifier = Arc::new(SignatureChecking {
                inner: MockVerifier::new(),
                trusted_signature,
            });
            let server =
                RaServer::new(sp_key, verifier, RaServerConfig::new(SPID));
            (client, server)
        };

        let (mut client, mut server) = pair(MockVerifier::SIGNATURE);
        run(&mut client, &mut server).unwrap();
        assert!(server.verification_report().is_some());

        let (mut client, mut server) = pair(&b"someone else"[..]);
        let err = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, Error::Verification(_)), "{err:?}");
        assert!(server.attested_identity().is_none());
        assert!(server.verification_report().is_none());
    }

    #[test]
    fn test_enclave_identity_check() {
        let Fixture {
            mut client,
            server,
            ..
        } = fixture(true);
        let check = |identity: &EnclaveIdentity| {
            anyhow::ensure!(!identity.attributes.is_debug(), "debug enclave");
            anyhow::bail!("enclave {} is not allowed", identity.measurement)
        };
        let mut server = server.with_enclave_check(Box::new(check));
        let err = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, Error::PeerRejected(_)), "{err:?}");
    }

    #[test]
    fn test_mismatched_report_data_fn() {
        let Fixture {
            client,
            mut server,
            ..
        } = fixture(true);
        let mut client =
            client.with_report_data_fn(fold_report_data_fn(b"extra".to_vec()));
        let err = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, Error::ReportDataMismatch(_)), "{err:?}");
    }

    #[test]
    fn test_matching_report_data_fn() {
        let Fixture {
            client,
            server,
            ..
        } = fixture(true);
        let registry = KeyRegistry::new();
        let digest = registry.registry_digest();
        let report_data_fn = fold_report_data_fn(digest.to_array().to_vec());
        let mut client = client.with_report_data_fn(report_data_fn.clone());
        let mut server = server.with_report_data_fn(report_data_fn);
        run(&mut client, &mut server).unwrap();
        assert!(client.is_done() && server.is_done());
    }

    #[test]
    fn test_step_after_done_is_an_error() {
        let Fixture {
            mut client,
            mut server,
            ..
        } = fixture(true);
        run(&mut client, &mut server).unwrap();
        let (mut stream, _peer) = MemPipe::pair();
        assert!(matches!(
            client.step(&mut stream),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            server.step(&mut stream),
            Err(Error::InvalidState(_))
        ));
        assert!(server.session_keys().is_ok());
    }

    #[test]
    fn test_standard_report_data_binds_every_input() {
        let g_a = *EphemeralKey::generate().unwrap().public_key();
        let g_b = *EphemeralKey::generate().unwrap().public_key();
        let vk = Key128::new([1; 16]);
        let data = standard_report_data(&g_a, &g_b, &vk);
        assert_eq!(&data.as_array()[32..], &[0u8; 32]);
        assert_ne!(data, standard_report_data(&g_b, &g_a, &vk));
        let other_vk = Key128::new([2; 16]);
        assert_ne!(data, standard_report_data(&g_a, &g_b, &other_vk));
        assert_eq!((default_report_data_fn())(&data), data);
        assert_ne!((fold_report_data_fn(Vec::new()))(&data), data);
    }

    #[test]
    fn test_spid_and_quote_type_parsing() {
        let spid = Spid::from_str("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(spid.0[1], 0x11);
        assert_eq!(spid.to_string(), "00112233445566778899aabbccddeeff");
        assert!(Spid::from_str("0011").is_err());

        let quote_type = QuoteType::from_str("unlinkable").unwrap();
        assert_eq!(quote_type, QuoteType::Unlinkable);
        assert!(QuoteType::from_str("Linkable").is_err());
        assert_eq!(QuoteType::try_from_u16(1).unwrap(), QuoteType::Linkable);
        assert!(QuoteType::try_from_u16(2).is_err());
        assert_eq!(GroupId([1, 0, 0, 0]).to_string(), "00000001");
    }
}
