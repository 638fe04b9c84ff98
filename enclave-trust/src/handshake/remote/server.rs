use std::{mem, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trust_common::{
    enclave::EnclaveIdentity,
    mac::{aes128_cmac, aes128_cmac_verify},
    rng::SysRng,
};

use super::{
    KDF_ID, QuoteType, RaKeys, ReportDataFn, Spid, default_report_data_fn,
    messages::{self, MSG0S_LEN, MSG1_LEN, Msg1, Msg2, Msg3, Msg4, Verdict},
    standard_report_data,
    verifier::{
        AttestationEvidence, EvidenceRequest, ExternalVerifier,
        VerificationReport, new_nonce,
    },
};
use crate::{
    handshake::{
        Error, Handshake, MAX_MESSAGE_LEN, PeerIdentityCheck, Role,
        SessionKeys,
    },
    kdf::Key128,
    keyring::IdentityKey,
    p256::{EphemeralKey, PublicKey},
    stream::{self, DuplexStream},
};

/// Service provider policy for remote attestation. This is also the
/// `[remote-attestation]` section of the config file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RaServerConfig {
    /// Our service provider id, as registered with the verifier.
    pub spid: Spid,
    #[serde(default)]
    pub quote_type: QuoteType,
    /// Extended EPID group ids we accept from clients.
    #[serde(default = "default_extended_group_ids")]
    pub extended_group_ids: Vec<u32>,
    /// `isvEnclaveQuoteStatus` values we accept.
    #[serde(default = "default_accepted_quote_statuses")]
    pub accepted_quote_statuses: Vec<String>,
}

/// The service provider side of a remote attestation.
pub struct RaServer {
    signing_key: Arc<IdentityKey>,
    verifier: Arc<dyn ExternalVerifier>,
    config: RaServerConfig,
    report_data_fn: ReportDataFn,
    enclave_check: Option<PeerIdentityCheck>,
    state: State,
}

enum State {
    Initial,
    GroupIdEchoed,
    KeyExchangeReceived {
        g_a: PublicKey,
        g_b: PublicKey,
        keys: RaKeys,
    },
    EvidenceReceived(Box<Attested>),
    Done(Box<Attested>),
    Failed,
}

/// Everything we learned from a successful attestation.
struct Attested {
    keys: RaKeys,
    identity: EnclaveIdentity,
    report: VerificationReport,
}

fn default_extended_group_ids() -> Vec<u32> {
    vec![0]
}

fn default_accepted_quote_statuses() -> Vec<String> {
    vec!["OK".to_owned()]
}

impl RaServerConfig {
    /// Defaults for everything but the SPID.
    pub fn new(spid: Spid) -> Self {
        Self {
            spid,
            quote_type: QuoteType::default(),
            extended_group_ids: default_extended_group_ids(),
            accepted_quote_statuses: default_accepted_quote_statuses(),
        }
    }
}

impl RaServer {
    /// `signing_key` is our long-term identity; clients must already trust
    /// its public key.
    pub fn new(
        signing_key: Arc<IdentityKey>,
        verifier: Arc<dyn ExternalVerifier>,
        config: RaServerConfig,
    ) -> Self {
        Self {
            signing_key,
            verifier,
            config,
            report_data_fn: default_report_data_fn(),
            enclave_check: None,
            state: State::Initial,
        }
    }

    /// The report data function the client uses.
    pub fn with_report_data_fn(mut self, report_data_fn: ReportDataFn) -> Self {
        self.report_data_fn = report_data_fn;
        self
    }

    /// Run `check` on the attested enclave's identity after the verifier
    /// accepts its quote.
    pub fn with_enclave_check(mut self, check: PeerIdentityCheck) -> Self {
        self.enclave_check = Some(check);
        self
    }

    fn attested(&self) -> Option<&Attested> {
        match &self.state {
            State::Done(attested) => Some(attested),
            _ => None,
        }
    }

    /// The attested enclave's identity, once done.
    pub fn attested_identity(&self) -> Option<&EnclaveIdentity> {
        self.attested().map(|attested| &attested.identity)
    }

    /// The verifier's signed report on the client's quote, once done.
    pub fn verification_report(&self) -> Option<&VerificationReport> {
        self.attested().map(|attested| &attested.report)
    }

    /// SMK, once done.
    pub fn session_mac_key(&self) -> Option<&Key128> {
        self.attested().map(|attested| &attested.keys.smk)
    }

    /// VK, once done.
    pub fn verification_key(&self) -> Option<&Key128> {
        self.attested().map(|attested| &attested.keys.vk)
    }

    /// Receive msg0s and reply with our signing key.
    fn recv_msg0(&self, stream: &mut dyn DuplexStream) -> Result<State, Error> {
        let extended_gid =
            messages::parse_msg0s(stream::recv_fixed::<MSG0S_LEN>(stream)?);
        if !self.config.extended_group_ids.contains(&extended_gid) {
            return Err(Error::UnsupportedGroupId(extended_gid));
        }
        let msg0r = self.signing_key.public_key().to_sgx_bytes();
        stream::send_fixed(stream, &msg0r)?;
        debug!(extended_gid, "remote attestation: sent msg0 response");
        Ok(State::GroupIdEchoed)
    }

    /// Receive msg1 and reply with our signed half of the key exchange.
    fn recv_msg1(&self, stream: &mut dyn DuplexStream) -> Result<State, Error> {
        let msg1 = Msg1::from_bytes(&stream::recv_fixed::<MSG1_LEN>(stream)?);
        debug!(gid = %msg1.gid, "remote attestation: received msg1");

        let ephemeral = EphemeralKey::generate()?;
        let g_b = *ephemeral.public_key();
        let shared = ephemeral.agree(&msg1.g_a).map_err(Error::InvalidPeerKey)?;
        let keys = RaKeys::derive(shared.as_slice());

        let mut signed = [0u8; 128];
        signed[..64].copy_from_slice(&g_b.to_sgx_bytes());
        signed[64..].copy_from_slice(&msg1.g_a.to_sgx_bytes());
        let sign_gb_ga = self.signing_key.key_pair().sign(&signed)?;

        let sig_rl = self
            .verifier
            .fetch_revocation_list(msg1.gid)
            .map_err(|err| Error::Verification(format!("{err:#}")))?;

        let mut msg2 = Msg2 {
            g_b,
            spid: self.config.spid,
            quote_type: self.config.quote_type,
            kdf_id: KDF_ID,
            sign_gb_ga,
            mac: [0; 16],
            sig_rl,
        };
        msg2.mac = aes128_cmac(keys.smk.expose_secret(), &[&msg2.mac_inputs()]);
        stream::send_sized(stream, &msg2.to_bytes()?)?;
        debug!(
            sig_rl_len = msg2.sig_rl.len(),
            "remote attestation: sent msg2"
        );

        Ok(State::KeyExchangeReceived {
            g_a: msg1.g_a,
            g_b,
            keys,
        })
    }

    /// Receive msg3 and have the client's quote verified. A rejection is
    /// reported to the client before failing.
    fn recv_msg3(
        &mut self,
        stream: &mut dyn DuplexStream,
        g_a: PublicKey,
        g_b: PublicKey,
        keys: RaKeys,
    ) -> Result<State, Error> {
        let bytes = stream::recv_sized(stream, MAX_MESSAGE_LEN)?;
        let msg3 = Msg3::from_bytes(&bytes)?;
        debug!(
            quote_len = msg3.quote.len(),
            "remote attestation: received msg3"
        );

        match self.verify_evidence(&msg3, &g_a, &g_b, &keys) {
            Ok((identity, report)) => {
                Ok(State::EvidenceReceived(Box::new(Attested {
                    keys,
                    identity,
                    report,
                })))
            }
            Err(err) => {
                // Best effort; the verification error is what matters.
                if let Err(send_err) =
                    send_msg4(stream, &keys.smk, Verdict::Rejected)
                {
                    debug!("failed to send rejection: {send_err}");
                }
                Err(err)
            }
        }
    }

    fn verify_evidence(
        &mut self,
        msg3: &Msg3,
        g_a: &PublicKey,
        g_b: &PublicKey,
        keys: &RaKeys,
    ) -> Result<(EnclaveIdentity, VerificationReport), Error> {
        let mac_inputs =
            Msg3::mac_inputs(&msg3.g_a, &msg3.ps_sec_prop, &msg3.quote);
        let smk = keys.smk.expose_secret();
        if !aes128_cmac_verify(smk, &[&mac_inputs], &msg3.mac) {
            return Err(Error::InvalidMac("remote attestation msg3"));
        }
        if &msg3.g_a != g_a {
            return Err(Error::malformed(
                "remote attestation msg3",
                "g_a doesn't match msg1",
            ));
        }

        let nonce = new_nonce(&mut SysRng::new());
        let pse_manifest =
            msg3.has_ps_sec_prop().then_some(msg3.ps_sec_prop.as_slice());
        let request =
            EvidenceRequest::new(&msg3.quote, nonce.clone(), pse_manifest)
                .to_json();
        debug!(%nonce, "remote attestation: submitting evidence");
        let report = self
            .verifier
            .submit_evidence(&request)
            .map_err(|err| Error::Verification(format!("{err:#}")))?;

        let evidence = AttestationEvidence::from_json(&report.evidence)?;
        if evidence.nonce.as_deref() != Some(nonce.as_str()) {
            return Err(Error::Verification(
                "verifier report doesn't echo our nonce".to_owned(),
            ));
        }
        let status = &evidence.isv_enclave_quote_status;
        if !self.config.accepted_quote_statuses.contains(status) {
            return Err(Error::Verification(format!(
                "quote status {status} is not accepted"
            )));
        }

        let quote = evidence.quote_body()?;
        let std_data = standard_report_data(g_a, g_b, &keys.vk);
        if quote.report.report_data != (self.report_data_fn)(&std_data) {
            return Err(Error::ReportDataMismatch("verified quote"));
        }

        let identity = quote.report.identity();
        if let Some(check) = self.enclave_check.as_mut() {
            check(&identity).map_err(Error::PeerRejected)?;
        }
        info!(
            enclave = %identity,
            %status,
            "remote attestation: enclave verified"
        );
        Ok((identity, report))
    }
}

fn send_msg4(
    stream: &mut dyn DuplexStream,
    smk: &Key128,
    verdict: Verdict,
) -> Result<(), Error> {
    let mac = aes128_cmac(smk.expose_secret(), &[&[verdict as u8]]);
    stream::send_fixed(stream, &Msg4 { verdict, mac }.to_bytes())?;
    Ok(())
}

impl Handshake for RaServer {
    fn role(&self) -> Role {
        Role::Responder
    }

    fn is_done(&self) -> bool {
        matches!(self.state, State::Done(_))
    }

    fn step(&mut self, stream: &mut dyn DuplexStream) -> Result<(), Error> {
        if self.is_done() {
            return Err(Error::InvalidState(
                "remote attestation server is done",
            ));
        }

        let result = match mem::replace(&mut self.state, State::Failed) {
            State::Initial => self.recv_msg0(stream),
            State::GroupIdEchoed => self.recv_msg1(stream),
            State::KeyExchangeReceived { g_a, g_b, keys } =>
                self.recv_msg3(stream, g_a, g_b, keys),
            State::EvidenceReceived(attested) =>
                send_msg4(stream, &attested.keys.smk, Verdict::Accepted)
                    .map(|()| State::Done(attested)),
            State::Done(_) => unreachable!("checked above"),
            State::Failed => Err(Error::InvalidState(
                "remote attestation server has failed",
            )),
        };

        match result {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(err) => {
                warn!("remote attestation server failed: {err}");
                Err(err)
            }
        }
    }

    fn session_keys(&self) -> Result<SessionKeys, Error> {
        self.attested()
            .map(|attested| attested.keys.session_keys())
            .ok_or(Error::NotDone)
    }
}
