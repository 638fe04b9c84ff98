use std::{mem, sync::Arc};

use tracing::{debug, warn};
use trust_common::{
    enclave::{EnclaveIdentity, Platform, TargetInfo},
    mac::aes128_cmac,
};

use super::{
    DhKeys,
    messages::{MSG2_LEN, Msg1, Msg2, Msg3},
    report_binding, session_keys, verify_peer_report,
};
use crate::{
    handshake::{Error, Handshake, PeerIdentityCheck, Role, SessionKeys},
    kdf::Key128,
    p256::EphemeralKey,
    stream::{self, DuplexStream},
};

/// The side of a local attestation that speaks first.
pub struct LocalResponder {
    platform: Arc<dyn Platform>,
    peer_check: Option<PeerIdentityCheck>,
    additional_props: Vec<u8>,
    state: State,
}

enum State {
    Initial,
    Msg1Sent { ephemeral: EphemeralKey },
    Done { aek: Key128, peer: EnclaveIdentity },
    Failed,
}

impl LocalResponder {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            peer_check: None,
            additional_props: Vec::new(),
            state: State::Initial,
        }
    }

    /// Run `check` on the initiator's attested identity before replying.
    pub fn with_peer_check(mut self, check: PeerIdentityCheck) -> Self {
        self.peer_check = Some(check);
        self
    }

    /// Opaque bytes carried in msg3 under its MAC.
    pub fn with_additional_props(mut self, props: Vec<u8>) -> Self {
        self.additional_props = props;
        self
    }

    /// The initiator's verified identity, once done.
    pub fn peer_identity(&self) -> Option<&EnclaveIdentity> {
        match &self.state {
            State::Done { peer, .. } => Some(peer),
            _ => None,
        }
    }

    fn send_msg1(&self, stream: &mut dyn DuplexStream) -> Result<State, Error> {
        let ephemeral = EphemeralKey::generate()?;
        let msg1 = Msg1 {
            g_a: *ephemeral.public_key(),
            target_info: self.platform.target_info(),
        };
        stream::send_fixed(stream, &msg1.to_bytes())?;
        debug!("local attestation: sent msg1");
        Ok(State::Msg1Sent { ephemeral })
    }

    /// Receive and verify msg2, reply with msg3.
    fn recv_msg2(
        &mut self,
        stream: &mut dyn DuplexStream,
        ephemeral: EphemeralKey,
    ) -> Result<State, Error> {
        let msg2 = Msg2::from_bytes(&stream::recv_fixed::<MSG2_LEN>(stream)?)?;
        debug!("local attestation: received msg2");

        let g_a = *ephemeral.public_key();
        let shared = ephemeral.agree(&msg2.g_b).map_err(Error::InvalidPeerKey)?;
        let keys = DhKeys::derive(shared.as_slice());

        let peer = verify_peer_report(
            "local attestation msg2",
            self.platform.as_ref(),
            &keys.smk,
            &Msg2::mac_inputs(&msg2.g_b, &msg2.report),
            &msg2.cmac,
            &msg2.report,
            &report_binding(&g_a, &msg2.g_b),
            self.peer_check.as_mut(),
        )?;

        let report = self.platform.create_report(
            &TargetInfo::from_report(&msg2.report),
            &report_binding(&msg2.g_b, &g_a),
        )?;
        let additional_props = mem::take(&mut self.additional_props);
        let mac_inputs = Msg3::mac_inputs(&report, &additional_props)?;
        let cmac = aes128_cmac(keys.smk.expose_secret(), &[&mac_inputs]);
        let msg3 = Msg3 {
            cmac,
            report,
            additional_props,
        };
        stream::send_sized(stream, &msg3.to_bytes()?)?;
        debug!("local attestation: sent msg3");

        Ok(State::Done {
            aek: keys.aek,
            peer,
        })
    }
}

impl Handshake for LocalResponder {
    fn role(&self) -> Role {
        Role::Responder
    }

    fn is_done(&self) -> bool {
        matches!(self.state, State::Done { .. })
    }

    fn step(&mut self, stream: &mut dyn DuplexStream) -> Result<(), Error> {
        if self.is_done() {
            return Err(Error::InvalidState("local responder is already done"));
        }

        let result = match mem::replace(&mut self.state, State::Failed) {
            State::Initial => self.send_msg1(stream),
            State::Msg1Sent { ephemeral } => self.recv_msg2(stream, ephemeral),
            State::Done { .. } => unreachable!("checked above"),
            State::Failed =>
                Err(Error::InvalidState("local responder has failed")),
        };

        match result {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(err) => {
                warn!("local attestation responder failed: {err}");
                Err(err)
            }
        }
    }

    fn session_keys(&self) -> Result<SessionKeys, Error> {
        match &self.state {
            State::Done { aek, .. } => Ok(session_keys(aek)),
            _ => Err(Error::NotDone),
        }
    }
}
