//! [`SecureChannel`]: an AES-128-GCM record layer over a plaintext duplex
//! stream, keyed by a completed attestation handshake.
//!
//! Each record on the wire is
//!
//! ```text
//! len: u64 (LE) || AES-128-GCM(secret_key, nonce, aad, plaintext) || tag
//! nonce = sender_role: u8 || 0^3 || counter: u64 (BE)
//! aad   = mask_key || counter: u64 (LE)
//! ```
//!
//! where `len` covers the ciphertext and tag. Each direction keeps its own
//! key schedule. After the record at the configured ratchet interval, both
//! keys of that direction ratchet forward and its counter restarts at zero.
//!
//! A record that fails authentication, or has an impossible length, closes
//! the channel for good.

use std::io::{self, Read, Write};

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    handshake::{self, Handshake, Role, SessionKeys},
    stream::{DuplexStream, LEN_PREFIX_LEN},
};

mod record;
mod schedule;

use record::RecordDecoder;
use schedule::KeySchedule;

/// AES-GCM tag length.
pub const TAG_LEN: usize = 16;
/// Default bound on the plaintext carried by one record.
pub const DEFAULT_MAX_RECORD_PLAINTEXT: usize = 1 << 20;
/// Largest configurable record plaintext.
pub const MAX_RECORD_PLAINTEXT_LIMIT: usize = 1 << 30;

#[derive(Debug, Error)]
pub enum Error {
    #[error("channel i/o: {0}")]
    Io(#[from] io::Error),

    #[error("record failed authentication")]
    Decrypt,

    #[error("invalid record length {0}")]
    InvalidRecordLength(u64),

    #[error("channel is closed after an earlier failure")]
    Closed,

    #[error("handshake: {0}")]
    Handshake(#[from] handshake::Error),
}

/// Channel tuning. Both ends should agree on these. This is also the
/// `[channel]` section of the config file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ChannelConfig {
    /// Larger sends are split across records. We reject received records
    /// larger than this.
    #[serde(default = "default_max_record_plaintext")]
    pub max_record_plaintext: usize,
    /// The record counter value after which each direction ratchets.
    #[serde(default = "default_ratchet_interval")]
    pub ratchet_interval: u64,
}

/// An encrypted, authenticated duplex byte stream.
pub struct SecureChannel<S> {
    stream: S,
    role: Role,
    config: ChannelConfig,
    /// Seals what we send.
    self_schedule: KeySchedule,
    /// Opens what the peer sends.
    peer_schedule: KeySchedule,
    decoder: RecordDecoder,
    /// Decrypted bytes not yet returned to the caller.
    pending: Bytes,
    closed: bool,
}

fn default_max_record_plaintext() -> usize {
    DEFAULT_MAX_RECORD_PLAINTEXT
}

fn default_ratchet_interval() -> u64 {
    u64::MAX
}

// --- impl Error --- //

impl Error {
    /// Whether the peer (or someone in between) sent bytes that failed
    /// authentication.
    pub fn is_tamper(&self) -> bool {
        matches!(self, Self::Decrypt | Self::InvalidRecordLength(_))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::Decrypt | Error::InvalidRecordLength(_) =>
                io::Error::new(io::ErrorKind::InvalidData, err),
            Error::Closed => io::Error::new(io::ErrorKind::NotConnected, err),
            Error::Handshake(_) => io::Error::other(err),
        }
    }
}

// --- impl ChannelConfig --- //

impl ChannelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let limit = MAX_RECORD_PLAINTEXT_LIMIT;
        anyhow::ensure!(
            (1..=limit).contains(&self.max_record_plaintext),
            "max-record-plaintext must be within 1..={limit}",
        );
        Ok(())
    }

    fn chunk_len(&self) -> usize {
        self.max_record_plaintext.clamp(1, MAX_RECORD_PLAINTEXT_LIMIT)
    }

    fn max_record_len(&self) -> usize {
        self.chunk_len() + TAG_LEN
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_record_plaintext: default_max_record_plaintext(),
            ratchet_interval: default_ratchet_interval(),
        }
    }
}

// --- impl SecureChannel --- //

impl<S> SecureChannel<S> {
    /// Wrap `stream` with the keys from a completed handshake.
    pub fn from_handshake<H: Handshake + ?Sized>(
        stream: S,
        handshake: &H,
    ) -> Result<Self, Error> {
        let keys = handshake.session_keys()?;
        Ok(Self::from_session_keys(stream, handshake.role(), &keys))
    }

    /// Wrap `stream` with explicit keys. `role` must be the opposite of the
    /// peer's.
    pub fn from_session_keys(
        stream: S,
        role: Role,
        keys: &SessionKeys,
    ) -> Self {
        let config = ChannelConfig::default();
        let interval = config.ratchet_interval;
        Self {
            stream,
            role,
            self_schedule: KeySchedule::new(role, keys, interval),
            peer_schedule: KeySchedule::new(role.peer(), keys, interval),
            decoder: RecordDecoder::new(config.max_record_len()),
            pending: Bytes::new(),
            closed: false,
            config,
        }
    }

    /// Apply `config`. Only meaningful before any traffic.
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.self_schedule.set_max_counter(config.ratchet_interval);
        self.peer_schedule.set_max_counter(config.ratchet_interval);
        self.decoder.set_max_record_len(config.max_record_len());
        self.config = config;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The counter of the next record we'll send.
    pub fn send_counter(&self) -> u64 {
        self.self_schedule.counter()
    }

    /// The counter of the next record we expect.
    pub fn recv_counter(&self) -> u64 {
        self.peer_schedule.counter()
    }

    /// How many times our sending keys have ratcheted.
    pub fn send_ratchets(&self) -> u64 {
        self.self_schedule.ratchets()
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed { Err(Error::Closed) } else { Ok(()) }
    }

    fn poison(&mut self, err: Error) -> Error {
        if !self.closed {
            warn!(role = ?self.role, "closing secure channel: {err}");
        }
        self.closed = true;
        err
    }

    /// Seal `buf` into one or more framed records. An empty `buf` still
    /// produces one (empty) record.
    fn seal_records(&mut self, buf: &[u8]) -> Vec<u8> {
        let chunk_len = self.config.chunk_len();
        let num_records = buf.len().div_ceil(chunk_len).max(1);
        let mut out = Vec::with_capacity(
            buf.len() + num_records * (LEN_PREFIX_LEN + TAG_LEN),
        );
        let mut chunks = buf.chunks(chunk_len);
        let empty: &[u8] = &[];
        for _ in 0..num_records {
            let chunk = chunks.next().unwrap_or(empty);
            out.put_u64_le((chunk.len() + TAG_LEN) as u64);
            let start = out.len();
            out.put_slice(chunk);
            self.self_schedule.seal(&mut out, start);
        }
        out
    }

    /// Decrypt an assembled record and make its plaintext pending.
    fn open_record(&mut self, mut record: Vec<u8>) -> Result<(), Error> {
        if let Err(err) = self.peer_schedule.open(&mut record) {
            return Err(self.poison(err));
        }
        self.pending = Bytes::from(record);
        Ok(())
    }

    fn take_pending(&mut self, max: usize) -> Bytes {
        let n = max.min(self.pending.len());
        self.pending.split_to(n)
    }

    fn copy_pending(&mut self, buf: &mut [u8]) -> usize {
        let pending = self.take_pending(buf.len());
        buf[..pending.len()].copy_from_slice(&pending);
        pending.len()
    }
}

impl<S: Read + Write> SecureChannel<S> {
    /// Drive `handshake` to completion over `stream`, then wrap it.
    pub fn establish<H: Handshake + ?Sized>(
        mut stream: S,
        handshake: &mut H,
    ) -> Result<Self, Error> {
        handshake.drive(&mut stream as &mut dyn DuplexStream)?;
        Self::from_handshake(stream, handshake)
    }
}

impl<S: Write> SecureChannel<S> {
    /// Encrypt and send all of `buf`. Returns `buf.len()`.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.check_open()?;
        let records = self.seal_records(buf);
        let result = self
            .stream
            .write_all(&records)
            .and_then(|()| self.stream.flush());
        match result {
            Ok(()) => Ok(buf.len()),
            // A partially written record can't be resumed.
            Err(err) => Err(self.poison(Error::Io(err))),
        }
    }
}

impl<S: Read> SecureChannel<S> {
    /// Receive up to `max` plaintext bytes: leftovers from the last record
    /// first, otherwise one new record. The peer closing the stream between
    /// records is an `UnexpectedEof` error.
    pub fn recv(&mut self, max: usize) -> Result<Bytes, Error> {
        self.check_open()?;
        if !self.pending.is_empty() || max == 0 {
            return Ok(self.take_pending(max));
        }
        if !self.read_record()? {
            return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(self.take_pending(max))
    }

    /// Read and open one record. Returns `false` on a clean EOF between
    /// records. Transport errors leave the partial record in the decoder,
    /// but EOF inside a record closes the channel.
    fn read_record(&mut self) -> Result<bool, Error> {
        loop {
            let n = match self.stream.read(self.decoder.unfilled()) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted =>
                    continue,
                Err(err) => return Err(Error::Io(err)),
            };
            if n == 0 {
                return if self.decoder.is_idle() {
                    Ok(false)
                } else {
                    Err(self.poison(truncated_record()))
                };
            }
            match self.decoder.advance(n) {
                Ok(None) => continue,
                Ok(Some(record)) =>
                    return self.open_record(record).map(|()| true),
                Err(err) => return Err(self.poison(err)),
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> SecureChannel<S> {
    /// [`send`](Self::send) over an async stream.
    pub async fn send_async(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.check_open()?;
        let records = self.seal_records(buf);
        let result = async {
            self.stream.write_all(&records).await?;
            self.stream.flush().await
        }
        .await;
        match result {
            Ok(()) => Ok(buf.len()),
            Err(err) => Err(self.poison(Error::Io(err))),
        }
    }
}

impl<S: AsyncRead + Unpin> SecureChannel<S> {
    /// [`recv`](Self::recv) over an async stream. Dropping the returned
    /// future loses no bytes: decoder progress lives in the channel.
    pub async fn recv_async(&mut self, max: usize) -> Result<Bytes, Error> {
        self.check_open()?;
        if !self.pending.is_empty() || max == 0 {
            return Ok(self.take_pending(max));
        }
        loop {
            let n = match self.stream.read(self.decoder.unfilled()).await {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted =>
                    continue,
                Err(err) => return Err(Error::Io(err)),
            };
            if n == 0 {
                return if self.decoder.is_idle() {
                    Err(Error::Io(io::ErrorKind::UnexpectedEof.into()))
                } else {
                    Err(self.poison(truncated_record()))
                };
            }
            match self.decoder.advance(n) {
                Ok(None) => continue,
                Ok(Some(record)) => {
                    self.open_record(record)?;
                    debug!(len = self.pending.len(), "received record");
                    return Ok(self.take_pending(max));
                }
                Err(err) => return Err(self.poison(err)),
            }
        }
    }
}

/// The peer hung up partway through a record.
fn truncated_record() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "stream ended inside a record",
    ))
}

impl<S: Read> Read for SecureChannel<S> {
    /// Empty records are skipped. Returns `Ok(0)` once the peer has closed
    /// the stream between records.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            if !self.read_record()? {
                return Ok(0);
            }
        }
        Ok(self.copy_pending(buf))
    }
}

impl<S: Write> Write for SecureChannel<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.send(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        self.stream.flush()
    }
}
