//! In-memory transports and mock attestation services for tests.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex},
};

use anyhow::{Context, ensure};
use base64::Engine as _;
use trust_common::enclave::{
    Measurement, MockPlatform, Platform, Report, TargetInfo,
};

use crate::handshake::remote::{
    AttestationEvidence, ExternalVerifier, GroupId, QuoteProvider,
    QuoteRequest, VerificationReport,
    quote::{QUOTE_BODY_LEN, Quote},
    verifier::EvidenceRequest,
};

type Buffer = Arc<Mutex<VecDeque<u8>>>;

/// One end of an in-memory duplex pipe. Reads from an empty pipe return
/// `Ok(0)`, so a peer that stops writing looks like EOF.
pub struct MemPipe {
    inbound: Buffer,
    outbound: Buffer,
}

impl MemPipe {
    pub fn pair() -> (Self, Self) {
        let (a_to_b, b_to_a) = (Buffer::default(), Buffer::default());
        let a = Self {
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
        };
        let b = Self {
            inbound: a_to_b,
            outbound: b_to_a,
        };
        (a, b)
    }

    /// The bytes we've written that the peer hasn't read yet.
    pub fn peek_outbound(&self) -> Vec<u8> {
        self.outbound.lock().unwrap().iter().copied().collect()
    }

    /// XOR the unread inbound byte at `offset` with `xor`.
    pub fn tamper_inbound(&self, offset: usize, xor: u8) {
        let mut inbound = self.inbound.lock().unwrap();
        let byte = inbound.get_mut(offset).expect("offset past buffered data");
        *byte ^= xor;
    }

    /// Drop all but the first `len` unread inbound bytes.
    pub fn truncate_inbound(&self, len: usize) {
        self.inbound.lock().unwrap().truncate(len);
    }
}

impl Read for MemPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inbound.lock().unwrap().read(buf)
    }
}

impl Write for MemPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.lock().unwrap().extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A connected pair of loopback TCP streams.
pub fn tcp_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let client = TcpStream::connect(listener.local_addr()?)?;
    let (server, _) = listener.accept()?;
    client.set_nodelay(true)?;
    server.set_nodelay(true)?;
    Ok((client, server))
}

/// Hands out at most one byte per read.
pub struct Trickle<S>(S);

impl<S> Trickle<S> {
    pub fn new(inner: S) -> Self {
        Self(inner)
    }
}

impl<S: Read> Read for Trickle<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(1);
        self.0.read(&mut buf[..len])
    }
}

impl<S: Write> Write for Trickle<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// A quoting service backed by a mock quoting enclave on the default mock
/// machine. Quotes carry a fake EPID signature.
pub struct MockQuoteProvider {
    qe: MockPlatform,
    group_id: GroupId,
}

impl MockQuoteProvider {
    pub const QE_MEASUREMENT: Measurement = Measurement::new([0x0e; 32]);

    pub fn new() -> Self {
        Self {
            qe: MockPlatform::with_measurement(Self::QE_MEASUREMENT),
            group_id: GroupId([0x2a, 0x0b, 0, 0]),
        }
    }
}

impl Default for MockQuoteProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl QuoteProvider for MockQuoteProvider {
    fn extended_group_id(&self) -> anyhow::Result<u32> {
        Ok(0)
    }

    fn group_id(&self) -> anyhow::Result<GroupId> {
        Ok(self.group_id)
    }

    fn qe_target_info(&self) -> anyhow::Result<TargetInfo> {
        Ok(self.qe.target_info())
    }

    fn get_quote(
        &self,
        report: &Report,
        request: QuoteRequest<'_>,
    ) -> anyhow::Result<Vec<u8>> {
        self.qe
            .verify_report(report)
            .context("Report isn't targeted at the quoting enclave")?;
        let mut quoted = report.clone();
        quoted.key_id = [0; 32];
        quoted.mac = [0; 16];
        let quote = Quote {
            version: 2,
            sign_type: request.quote_type.to_u16(),
            group_id: self.group_id,
            qe_svn: 1,
            pce_svn: 1,
            xeid: 0,
            basename: [0; 32],
            report: quoted,
            signature: b"mock epid signature".to_vec(),
        };
        Ok(quote.to_bytes()?)
    }
}

/// A verification service that trusts every well-formed quote and reports
/// a configurable quote status.
pub struct MockVerifier {
    state: Mutex<MockVerifierState>,
}

struct MockVerifierState {
    quote_status: String,
    num_submissions: usize,
    last_request: Option<String>,
}

impl MockVerifier {
    pub const SIGNATURE: &'static [u8] = b"mock signature";

    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockVerifierState {
                quote_status: "OK".to_owned(),
                num_submissions: 0,
                last_request: None,
            }),
        }
    }

    /// The `isvEnclaveQuoteStatus` of future reports.
    pub fn set_quote_status(&self, status: &str) {
        self.state.lock().unwrap().quote_status = status.to_owned();
    }

    pub fn num_submissions(&self) -> usize {
        self.state.lock().unwrap().num_submissions
    }

    /// The JSON body of the latest submission.
    pub fn last_request(&self) -> Option<String> {
        self.state.lock().unwrap().last_request.clone()
    }
}

impl Default for MockVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalVerifier for MockVerifier {
    fn fetch_revocation_list(&self, _gid: GroupId) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn submit_evidence(
        &self,
        request_body: &str,
    ) -> anyhow::Result<VerificationReport> {
        let mut state = self.state.lock().unwrap();
        state.num_submissions += 1;
        state.last_request = Some(request_body.to_owned());

        let request = serde_json::from_str::<EvidenceRequest>(request_body)
            .context("Invalid evidence request")?;
        let b64 = base64::engine::general_purpose::STANDARD;
        let quote = b64
            .decode(&request.isv_enclave_quote)
            .context("Quote isn't base64")?;
        ensure!(quote.len() >= QUOTE_BODY_LEN, "Quote is too short");

        let evidence = AttestationEvidence {
            id: Some(format!("mock-{}", state.num_submissions)),
            timestamp: Some("2026-10-14T00:00:00.000000".to_owned()),
            isv_enclave_quote_status: state.quote_status.clone(),
            isv_enclave_quote_body: b64.encode(&quote[..QUOTE_BODY_LEN]),
            nonce: Some(request.nonce),
            platform_info_blob: None,
        };
        Ok(VerificationReport {
            evidence: serde_json::to_string(&evidence)?,
            signature: Self::SIGNATURE.to_vec(),
            signer_cert_chain: String::new(),
        })
    }
}
