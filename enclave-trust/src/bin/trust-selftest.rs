//! Runs a mock local attestation between two threads over loopback TCP, then
//! echoes records through the resulting secure channels.

use std::{
    io::{self, Read},
    net::{TcpListener, TcpStream},
    path::PathBuf,
    sync::Arc,
    thread,
    time::Instant,
};

use anyhow::{Context, ensure};
use enclave_trust::{
    channel::{ChannelConfig, SecureChannel},
    config::Config,
    handshake::{
        Handshake, PeerIdentityCheck,
        local::{LocalInitiator, LocalResponder},
    },
};
use tracing::info;
use trust_common::enclave::{
    EnclaveIdentity, Measurement, MockPlatform, Platform,
};

/// Mock local attestation and secure channel self test.
#[derive(argh::FromArgs)]
struct Args {
    /// number of records to echo. Default: 1000.
    #[argh(option, default = "1000")]
    records: u64,

    /// ratchet the channel keys after this many records. Overrides the
    /// config file.
    #[argh(option)]
    ratchet_interval: Option<u64>,

    /// path to a TOML config file.
    #[argh(option)]
    config: Option<PathBuf>,
}

const INITIATOR: Measurement = Measurement::new([0x11; 32]);
const RESPONDER: Measurement = Measurement::new([0x22; 32]);

fn main() -> anyhow::Result<()> {
    trust_logger::init();
    let args = argh::from_env::<Args>();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(interval) = args.ratchet_interval {
        config.channel.ratchet_interval = interval;
    }
    let channel_config = config.channel;

    let listener =
        TcpListener::bind("127.0.0.1:0").context("Failed to bind listener")?;
    let addr = listener.local_addr()?;
    info!(%addr, records = args.records, "starting self test");
    let start = Instant::now();

    thread::scope(|scope| {
        let responder = thread::Builder::new()
            .name("responder".to_owned())
            .spawn_scoped(scope, || {
                let (stream, _) =
                    listener.accept().context("Failed to accept")?;
                run_responder(stream, channel_config)
            })
            .context("Failed to spawn responder")?;

        let stream = TcpStream::connect(addr).context("Failed to connect")?;
        let initiator_result =
            run_initiator(stream, channel_config, args.records);
        let responder_result = responder
            .join()
            .map_err(|_| anyhow::anyhow!("Responder panicked"))?;
        initiator_result.context("Initiator failed")?;
        let echoed = responder_result.context("Responder failed")?;
        ensure!(echoed == args.records, "Responder echoed {echoed} records");
        Ok::<_, anyhow::Error>(())
    })?;

    info!(elapsed = ?start.elapsed(), "self test passed");
    Ok(())
}

fn expect_measurement(expected: Measurement) -> PeerIdentityCheck {
    Box::new(move |peer: &EnclaveIdentity| {
        ensure!(
            peer.measurement == expected,
            "unexpected peer enclave {}",
            peer.measurement
        );
        Ok(())
    })
}

/// Responds to the handshake, then echoes records until the initiator hangs
/// up. Returns the number of records echoed.
fn run_responder(
    mut stream: TcpStream,
    config: ChannelConfig,
) -> anyhow::Result<u64> {
    stream.set_nodelay(true)?;
    let platform = Arc::new(MockPlatform::with_measurement(RESPONDER));
    let mut handshake = LocalResponder::new(platform)
        .with_peer_check(expect_measurement(INITIATOR));
    handshake.drive(&mut stream).context("Handshake failed")?;
    let mut channel =
        SecureChannel::from_handshake(stream, &handshake)?.with_config(config);

    let mut echoed = 0;
    loop {
        let mut record = [0u8; 8];
        match channel.read_exact(&mut record) {
            Ok(()) => (),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("Failed to receive"),
        }
        channel.send(&record)?;
        echoed += 1;
    }
    info!(echoed, ratchets = channel.send_ratchets(), "responder done");
    Ok(echoed)
}

fn run_initiator(
    stream: TcpStream,
    config: ChannelConfig,
    records: u64,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let platform = Arc::new(MockPlatform::with_measurement(INITIATOR));
    let mut handshake = LocalInitiator::new(platform.clone())
        .with_peer_check(expect_measurement(RESPONDER));
    let mut channel =
        SecureChannel::establish(stream, &mut handshake)?.with_config(config);
    info!(
        peer = %handshake.peer_identity().context("No peer identity")?,
        us = %platform.identity(),
        "local attestation complete"
    );

    for i in 0..records {
        channel.send(&i.to_le_bytes())?;
        let echo = channel.recv(8)?;
        ensure!(echo[..] == i.to_le_bytes(), "Bad echo for record {i}");
    }
    info!(ratchets = channel.send_ratchets(), "initiator done");
    // Dropping the channel closes the stream, ending the echo loop.
    Ok(())
}
