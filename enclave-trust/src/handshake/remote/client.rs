use std::{mem, sync::Arc};

use tracing::{debug, info, warn};
use trust_common::{
    enclave::Platform,
    mac::{aes128_cmac, aes128_cmac_verify},
};

use super::{
    KDF_ID, QuoteProvider, QuoteRequest, RaKeys, ReportDataFn,
    default_report_data_fn,
    messages::{
        self, MSG0R_LEN, MSG4_LEN, Msg1, Msg2, Msg3, Msg4, PS_SEC_PROP_LEN,
        Verdict,
    },
    standard_report_data,
};
use crate::{
    handshake::{Error, Handshake, MAX_MESSAGE_LEN, Role, SessionKeys},
    keyring::IdentityAuthenticator,
    p256::{EphemeralKey, PublicKey},
    stream::{self, DuplexStream},
};

/// The enclave side of a remote attestation.
pub struct RaClient {
    platform: Arc<dyn Platform>,
    quoter: Arc<dyn QuoteProvider>,
    authenticator: Arc<dyn IdentityAuthenticator>,
    report_data_fn: ReportDataFn,
    state: State,
}

enum State {
    Initial,
    GroupIdSent,
    ContextInitialized {
        sp_key: PublicKey,
        ephemeral: EphemeralKey,
    },
    KeyExchangeSent {
        sp_key: PublicKey,
        ephemeral: EphemeralKey,
    },
    EvidenceSubmitted {
        keys: RaKeys,
    },
    /// Only the channel keys outlive the handshake.
    Done {
        keys: SessionKeys,
    },
    Failed,
}

impl RaClient {
    /// `authenticator` decides which service provider signing keys to trust,
    /// usually a [`KeyRegistry`](crate::keyring::KeyRegistry).
    pub fn new(
        platform: Arc<dyn Platform>,
        quoter: Arc<dyn QuoteProvider>,
        authenticator: Arc<dyn IdentityAuthenticator>,
    ) -> Self {
        Self {
            platform,
            quoter,
            authenticator,
            report_data_fn: default_report_data_fn(),
            state: State::Initial,
        }
    }

    /// Customize the report data bound into the quote. The server must use
    /// the same function.
    pub fn with_report_data_fn(mut self, report_data_fn: ReportDataFn) -> Self {
        self.report_data_fn = report_data_fn;
        self
    }

    fn send_msg0(&self, stream: &mut dyn DuplexStream) -> Result<State, Error> {
        let extended_gid =
            self.quoter.extended_group_id().map_err(Error::Quoting)?;
        stream::send_fixed(stream, &messages::msg0s(extended_gid))?;
        debug!(extended_gid, "remote attestation: sent msg0");
        Ok(State::GroupIdSent)
    }

    /// Receive msg0r and decide whether we trust the service provider.
    fn recv_msg0(&self, stream: &mut dyn DuplexStream) -> Result<State, Error> {
        let msg0r = stream::recv_fixed::<MSG0R_LEN>(stream)?;
        let sp_key = PublicKey::from_sgx_bytes(&msg0r);
        if !self.authenticator.authenticate(&sp_key) {
            return Err(Error::UntrustedSigningKey);
        }
        debug!(
            sp_key_hash = %sp_key.spki_hash(),
            "remote attestation: service provider authenticated"
        );
        let ephemeral = EphemeralKey::generate()?;
        Ok(State::ContextInitialized { sp_key, ephemeral })
    }

    fn send_msg1(
        &self,
        stream: &mut dyn DuplexStream,
        sp_key: PublicKey,
        ephemeral: EphemeralKey,
    ) -> Result<State, Error> {
        let gid = self.quoter.group_id().map_err(Error::Quoting)?;
        let msg1 = Msg1 {
            g_a: *ephemeral.public_key(),
            gid,
        };
        stream::send_fixed(stream, &msg1.to_bytes())?;
        debug!(%gid, "remote attestation: sent msg1");
        Ok(State::KeyExchangeSent { sp_key, ephemeral })
    }

    /// Receive and check msg2, then reply with our quote in msg3.
    fn recv_msg2(
        &self,
        stream: &mut dyn DuplexStream,
        sp_key: PublicKey,
        ephemeral: EphemeralKey,
    ) -> Result<State, Error> {
        let bytes = stream::recv_sized(stream, MAX_MESSAGE_LEN)?;
        let msg2 = Msg2::from_bytes(&bytes)?;
        debug!(
            sig_rl_len = msg2.sig_rl.len(),
            "remote attestation: received msg2"
        );

        let g_a = *ephemeral.public_key();
        let shared = ephemeral.agree(&msg2.g_b).map_err(Error::InvalidPeerKey)?;
        let keys = RaKeys::derive(shared.as_slice());

        if !aes128_cmac_verify(
            keys.smk.expose_secret(),
            &[&msg2.mac_inputs()],
            &msg2.mac,
        ) {
            return Err(Error::InvalidMac("remote attestation msg2"));
        }
        let mut signed = [0u8; 128];
        signed[..64].copy_from_slice(&msg2.g_b.to_sgx_bytes());
        signed[64..].copy_from_slice(&g_a.to_sgx_bytes());
        sp_key
            .verify(&signed, &msg2.sign_gb_ga)
            .map_err(|_| Error::InvalidSignature)?;
        if msg2.kdf_id != KDF_ID {
            return Err(Error::Unsupported(format!("kdf id {}", msg2.kdf_id)));
        }

        let std_data = standard_report_data(&g_a, &msg2.g_b, &keys.vk);
        let report_data = (self.report_data_fn)(&std_data);
        let qe_target_info =
            self.quoter.qe_target_info().map_err(Error::Quoting)?;
        let report =
            self.platform.create_report(&qe_target_info, &report_data)?;
        let quote = self
            .quoter
            .get_quote(&report, QuoteRequest {
                spid: msg2.spid,
                quote_type: msg2.quote_type,
                sig_rl: &msg2.sig_rl,
            })
            .map_err(Error::Quoting)?;

        let ps_sec_prop = [0u8; PS_SEC_PROP_LEN];
        let mac = aes128_cmac(
            keys.smk.expose_secret(),
            &[&Msg3::mac_inputs(&g_a, &ps_sec_prop, &quote)],
        );
        let msg3 = Msg3 {
            mac,
            g_a,
            ps_sec_prop,
            quote,
        };
        stream::send_sized(stream, &msg3.to_bytes())?;
        debug!(
            quote_len = msg3.quote.len(),
            "remote attestation: sent msg3"
        );
        Ok(State::EvidenceSubmitted { keys })
    }

    /// Receive the server's verdict.
    fn recv_msg4(
        &self,
        stream: &mut dyn DuplexStream,
        keys: RaKeys,
    ) -> Result<State, Error> {
        let msg4 = Msg4::from_bytes(&stream::recv_fixed::<MSG4_LEN>(stream)?)?;
        if !aes128_cmac_verify(
            keys.smk.expose_secret(),
            &[&[msg4.verdict as u8]],
            &msg4.mac,
        ) {
            return Err(Error::InvalidMac("remote attestation msg4"));
        }
        match msg4.verdict {
            Verdict::Accepted => {
                info!("remote attestation: evidence accepted");
                Ok(State::Done {
                    keys: keys.session_keys(),
                })
            }
            Verdict::Rejected => Err(Error::RejectedByPeer),
        }
    }
}

impl Handshake for RaClient {
    fn role(&self) -> Role {
        Role::Initiator
    }

    fn is_done(&self) -> bool {
        matches!(self.state, State::Done { .. })
    }

    fn step(&mut self, stream: &mut dyn DuplexStream) -> Result<(), Error> {
        if self.is_done() {
            return Err(Error::InvalidState(
                "remote attestation client is done",
            ));
        }

        let result = match mem::replace(&mut self.state, State::Failed) {
            State::Initial => self.send_msg0(stream),
            State::GroupIdSent => self.recv_msg0(stream),
            State::ContextInitialized { sp_key, ephemeral } =>
                self.send_msg1(stream, sp_key, ephemeral),
            State::KeyExchangeSent { sp_key, ephemeral } =>
                self.recv_msg2(stream, sp_key, ephemeral),
            State::EvidenceSubmitted { keys } => self.recv_msg4(stream, keys),
            State::Done { .. } => unreachable!("checked above"),
            State::Failed => Err(Error::InvalidState(
                "remote attestation client has failed",
            )),
        };

        match result {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(err) => {
                warn!("remote attestation client failed: {err}");
                Err(err)
            }
        }
    }

    fn session_keys(&self) -> Result<SessionKeys, Error> {
        match &self.state {
            State::Done { keys } => Ok(keys.duplicate()),
            _ => Err(Error::NotDone),
        }
    }
}
