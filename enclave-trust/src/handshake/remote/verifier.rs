//! The external attestation verification service, and the JSON it speaks.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use trust_common::{
    hex,
    rng::{Crng, RngExt},
};

use super::{GroupId, quote::Quote};
use crate::handshake::Error;

/// A service that verifies quotes, e.g. the Intel Attestation Service. The
/// HTTP transport lives behind this trait.
///
/// [`RaServer`](super::RaServer) acts on a returned report as-is: it checks
/// the quote status, nonce and quote body, but never `signature` or
/// `signer_cert_chain`. Implementations must verify the chain up to a pinned
/// root and the signature over `evidence` before returning `Ok`.
pub trait ExternalVerifier: Send + Sync {
    /// The signature revocation list for an EPID group, raw (not base64).
    fn fetch_revocation_list(&self, gid: GroupId) -> anyhow::Result<Vec<u8>>;

    /// Submit a JSON verification request body.
    fn submit_evidence(
        &self,
        request_body: &str,
    ) -> anyhow::Result<VerificationReport>;
}

/// The verifier's signed response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerificationReport {
    /// The JSON attestation verification report.
    pub evidence: String,
    /// The verifier's signature over `evidence`.
    pub signature: Vec<u8>,
    /// PEM certificate chain for the signing key.
    pub signer_cert_chain: String,
}

/// Request body for the verifier's report endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRequest {
    /// base64 quote.
    pub isv_enclave_quote: String,
    pub nonce: String,
    /// base64 platform service security properties.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pse_manifest: Option<String>,
}

/// The fields of the verifier's JSON report we act on. Unknown fields are
/// ignored.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationEvidence {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub isv_enclave_quote_status: String,
    /// base64 quote body.
    pub isv_enclave_quote_body: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub platform_info_blob: Option<String>,
}

/// Number of random bytes in a request nonce. Hex encoded, this is the 32
/// character maximum the verifier accepts.
const NONCE_BYTES: usize = 16;

/// A random lowercase hex nonce.
pub(super) fn new_nonce(rng: &mut impl Crng) -> String {
    hex::encode(&rng.gen_bytes::<NONCE_BYTES>())
}

impl EvidenceRequest {
    pub fn new(
        quote: &[u8],
        nonce: String,
        pse_manifest: Option<&[u8]>,
    ) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD;
        Self {
            isv_enclave_quote: b64.encode(quote),
            nonce,
            pse_manifest: pse_manifest.map(|manifest| b64.encode(manifest)),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing plain strings can't fail.
        serde_json::to_string(self).expect("EvidenceRequest serializes")
    }
}

impl AttestationEvidence {
    pub fn from_json(evidence: &str) -> Result<Self, Error> {
        serde_json::from_str(evidence)
            .map_err(|err| Error::malformed("attestation evidence", err))
    }

    /// Decode the verified quote body.
    pub fn quote_body(&self) -> Result<Quote, Error> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.isv_enclave_quote_body)
            .map_err(|err| Error::malformed("attestation evidence", err))?;
        Quote::try_from_body_bytes(&bytes)
    }
}
