//! Full handshakes between two threads over loopback TCP, followed by channel
//! traffic in both directions.

use std::{
    io::{Read, Write},
    sync::Arc,
    thread,
};

use enclave_trust::{
    channel::{ChannelConfig, Error as ChannelError, SecureChannel},
    handshake::{
        Handshake,
        local::{LocalInitiator, LocalResponder},
        remote::{RaClient, RaServer, RaServerConfig, Spid},
    },
    keyring::{IdentityKey, KeyRegistry},
    test_utils::{MockQuoteProvider, MockVerifier, tcp_pair},
};
use trust_common::enclave::{Measurement, MockPlatform, Platform};

const CONFIG: ChannelConfig = ChannelConfig {
    max_record_plaintext: 1000,
    ratchet_interval: 7,
};

/// Echo everything through `channel` until the peer hangs up.
fn echo<S: Read + Write>(mut channel: SecureChannel<S>) -> u64 {
    let mut buf = [0u8; 4096];
    let mut total = 0;
    loop {
        let n = channel.read(&mut buf).unwrap();
        if n == 0 {
            return total;
        }
        channel.write_all(&buf[..n]).unwrap();
        total += n as u64;
    }
}

/// Send a few differently sized messages and check they come back intact.
fn exercise<S: Read + Write>(channel: &mut SecureChannel<S>) {
    for len in [0usize, 1, 999, 1000, 1001, 12345] {
        let msg = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        channel.send(&msg).unwrap();
        let mut echoed = vec![0u8; len];
        channel.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, msg, "len {len}");
    }
    assert!(channel.send_ratchets() > 0);
}

#[test]
fn local_attestation_over_tcp() {
    trust_logger::init_for_testing();
    let (i_stream, r_stream) = tcp_pair().unwrap();
    let i_platform =
        Arc::new(MockPlatform::with_measurement(Measurement::new([1; 32])));
    let r_platform =
        Arc::new(MockPlatform::with_measurement(Measurement::new([2; 32])));
    let r_identity = r_platform.identity();

    let responder = thread::spawn(move || {
        let mut handshake = LocalResponder::new(r_platform)
            .with_additional_props(b"session=1".to_vec());
        let channel = SecureChannel::establish(r_stream, &mut handshake)
            .unwrap()
            .with_config(CONFIG);
        echo(channel)
    });

    let mut handshake = LocalInitiator::new(i_platform);
    let mut channel = SecureChannel::establish(i_stream, &mut handshake)
        .unwrap()
        .with_config(CONFIG);
    assert_eq!(handshake.peer_identity(), Some(&r_identity));
    exercise(&mut channel);
    drop(channel);

    let echoed = responder.join().unwrap();
    assert_eq!(echoed, 1 + 999 + 1000 + 1001 + 12345);
}

#[test]
fn remote_attestation_over_tcp() {
    trust_logger::init_for_testing();
    let (c_stream, s_stream) = tcp_pair().unwrap();
    let sp_key = Arc::new(IdentityKey::generate("service-provider").unwrap());
    let registry = Arc::new(KeyRegistry::new());
    registry.register(sp_key.clone()).unwrap();
    let verifier = Arc::new(MockVerifier::new());

    let server_verifier = verifier.clone();
    let server = thread::spawn(move || {
        let config = RaServerConfig::new(Spid([0x33; 16]));
        let mut handshake = RaServer::new(sp_key, server_verifier, config);
        let channel = SecureChannel::establish(s_stream, &mut handshake)
            .unwrap()
            .with_config(CONFIG);
        assert_eq!(
            handshake.attested_identity(),
            Some(&MockPlatform::default().identity())
        );
        echo(channel)
    });

    let mut handshake = RaClient::new(
        Arc::new(MockPlatform::default()),
        Arc::new(MockQuoteProvider::new()),
        registry.clone(),
    );
    let mut channel = SecureChannel::establish(c_stream, &mut handshake)
        .unwrap()
        .with_config(CONFIG);
    exercise(&mut channel);
    drop(channel);

    server.join().unwrap();
    assert_eq!(verifier.num_submissions(), 1);
    // looking up keys froze the registry
    assert!(registry.is_locked());
}

#[test]
fn rejected_evidence_over_tcp() {
    trust_logger::init_for_testing();
    let (c_stream, s_stream) = tcp_pair().unwrap();
    let sp_key = Arc::new(IdentityKey::generate("service-provider").unwrap());
    let registry = Arc::new(KeyRegistry::new());
    registry.register(sp_key.clone()).unwrap();
    let verifier = Arc::new(MockVerifier::new());
    verifier.set_quote_status("SIGNATURE_INVALID");

    let server = thread::spawn(move || {
        let config = RaServerConfig::new(Spid([0x33; 16]));
        let mut handshake = RaServer::new(sp_key, verifier, config);
        SecureChannel::establish(s_stream, &mut handshake).map(|_| ())
    });

    let mut handshake = RaClient::new(
        Arc::new(MockPlatform::default()),
        Arc::new(MockQuoteProvider::new()),
        registry,
    );
    let err = SecureChannel::establish(c_stream, &mut handshake)
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, ChannelError::Handshake(_)), "{err:?}");
    assert!(handshake.session_keys().is_err());

    let err = server.join().unwrap().unwrap_err();
    assert!(matches!(err, ChannelError::Handshake(_)), "{err:?}");
}
