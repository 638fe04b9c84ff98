use std::{mem, sync::Arc};

use tracing::{debug, warn};
use trust_common::{
    enclave::{EnclaveIdentity, Platform},
    mac::aes128_cmac,
};

use super::{
    DhKeys,
    messages::{MSG1_LEN, Msg1, Msg2, Msg3},
    report_binding, session_keys, verify_peer_report,
};
use crate::{
    handshake::{
        Error, Handshake, MAX_MESSAGE_LEN, PeerIdentityCheck, Role,
        SessionKeys,
    },
    kdf::Key128,
    p256::{EphemeralKey, PublicKey},
    stream::{self, DuplexStream},
};

/// The side of a local attestation that waits for the peer's first message.
pub struct LocalInitiator {
    platform: Arc<dyn Platform>,
    peer_check: Option<PeerIdentityCheck>,
    state: State,
}

enum State {
    Initial,
    Msg2Sent {
        g_a: PublicKey,
        g_b: PublicKey,
        keys: DhKeys,
    },
    Done {
        aek: Key128,
        peer: EnclaveIdentity,
    },
    Failed,
}

impl LocalInitiator {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            peer_check: None,
            state: State::Initial,
        }
    }

    /// Run `check` on the responder's attested identity before finishing.
    pub fn with_peer_check(mut self, check: PeerIdentityCheck) -> Self {
        self.peer_check = Some(check);
        self
    }

    /// The responder's verified identity, once done.
    pub fn peer_identity(&self) -> Option<&EnclaveIdentity> {
        match &self.state {
            State::Done { peer, .. } => Some(peer),
            _ => None,
        }
    }

    /// Receive msg1, reply with msg2.
    fn recv_msg1(&self, stream: &mut dyn DuplexStream) -> Result<State, Error> {
        let msg1 = Msg1::from_bytes(&stream::recv_fixed::<MSG1_LEN>(stream)?)?;
        debug!("local attestation: received msg1");

        let ephemeral = EphemeralKey::generate()?;
        let g_b = *ephemeral.public_key();
        let shared = ephemeral.agree(&msg1.g_a).map_err(Error::InvalidPeerKey)?;
        let keys = DhKeys::derive(shared.as_slice());

        let report = self.platform.create_report(
            &msg1.target_info,
            &report_binding(&msg1.g_a, &g_b),
        )?;
        let cmac = aes128_cmac(
            keys.smk.expose_secret(),
            &[&Msg2::mac_inputs(&g_b, &report)],
        );
        let msg2 = Msg2 { g_b, report, cmac };
        stream::send_fixed(stream, &msg2.to_bytes())?;
        debug!("local attestation: sent msg2");

        Ok(State::Msg2Sent {
            g_a: msg1.g_a,
            g_b,
            keys,
        })
    }

    /// Receive and verify msg3.
    fn recv_msg3(
        &mut self,
        stream: &mut dyn DuplexStream,
        g_a: PublicKey,
        g_b: PublicKey,
        keys: DhKeys,
    ) -> Result<State, Error> {
        let msg3 =
            Msg3::from_bytes(&stream::recv_sized(stream, MAX_MESSAGE_LEN)?)?;
        debug!(
            props_len = msg3.additional_props.len(),
            "local attestation: received msg3"
        );

        let peer = verify_peer_report(
            "local attestation msg3",
            self.platform.as_ref(),
            &keys.smk,
            &Msg3::mac_inputs(&msg3.report, &msg3.additional_props)?,
            &msg3.cmac,
            &msg3.report,
            &report_binding(&g_b, &g_a),
            self.peer_check.as_mut(),
        )?;
        Ok(State::Done {
            aek: keys.aek,
            peer,
        })
    }
}

impl Handshake for LocalInitiator {
    fn role(&self) -> Role {
        Role::Initiator
    }

    fn is_done(&self) -> bool {
        matches!(self.state, State::Done { .. })
    }

    fn step(&mut self, stream: &mut dyn DuplexStream) -> Result<(), Error> {
        if self.is_done() {
            return Err(Error::InvalidState("local initiator is already done"));
        }

        let result = match mem::replace(&mut self.state, State::Failed) {
            State::Initial => self.recv_msg1(stream),
            State::Msg2Sent { g_a, g_b, keys } =>
                self.recv_msg3(stream, g_a, g_b, keys),
            State::Done { .. } => unreachable!("checked above"),
            State::Failed =>
                Err(Error::InvalidState("local initiator has failed")),
        };

        match result {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(err) => {
                warn!("local attestation initiator failed: {err}");
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
