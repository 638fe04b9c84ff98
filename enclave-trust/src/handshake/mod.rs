//! Attestation handshakes. Each one is a state machine advanced by
//! [`Handshake::step`], and on success yields the [`SessionKeys`] that seed a
//! [`SecureChannel`](crate::channel::SecureChannel).
//!
//! + [`local`]: mutual attestation between two enclaves on one machine.
//! + [`remote`]: attestation of an enclave to a service provider, backed by
//!   an external verification service.

use std::io;

use thiserror::Error;
use trust_common::enclave::{self, EnclaveIdentity};

use crate::{kdf::Key128, p256, stream::DuplexStream};

pub mod local;
pub mod remote;

/// Upper bound on variable-size handshake messages.
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Which side of a handshake we are. Each side's channel records use a
/// distinct nonce space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Role {
    Initiator = 0,
    Responder = 1,
}

/// The two 128-bit keys a completed handshake hands to the channel.
#[derive(Debug)]
pub struct SessionKeys {
    pub secret_key: Key128,
    pub mask_key: Key128,
}

/// Caller-supplied check on the attested identity of the peer enclave.
/// Returning an error aborts the handshake.
pub type PeerIdentityCheck =
    Box<dyn FnMut(&EnclaveIdentity) -> anyhow::Result<()> + Send>;

/// An attestation handshake.
pub trait Handshake {
    fn role(&self) -> Role;

    fn is_done(&self) -> bool;

    /// Perform one unit of protocol work: usually one send or one receive.
    /// Calling this on a completed or failed handshake is an error. Any error
    /// is terminal.
    fn step(&mut self, stream: &mut dyn DuplexStream) -> Result<(), Error>;

    /// Step until done.
    fn drive(&mut self, stream: &mut dyn DuplexStream) -> Result<(), Error> {
        while !self.is_done() {
            self.step(stream)?;
        }
        Ok(())
    }

    /// The derived channel keys. Only available once done.
    fn session_keys(&self) -> Result<SessionKeys, Error>;
}

/// Coarse classification of [`Error`]s.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    /// Malformed messages or unsupported parameters.
    InputValidation,
    /// The peer couldn't prove who it is.
    Authentication,
    /// The external verifier failed or rejected the evidence.
    Verification,
    /// The handshake was misused.
    Protocol,
    Io,
    Platform,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("handshake i/o: {0}")]
    Io(#[from] io::Error),

    #[error("malformed {message}: {reason}")]
    Malformed {
        message: &'static str,
        reason: String,
    },

    #[error("unsupported extended group id {0}")]
    UnsupportedGroupId(u32),

    #[error("unsupported {0}")]
    Unsupported(String),

    #[error("invalid peer key: {0}")]
    InvalidPeerKey(#[source] p256::Error),

    #[error("service provider's signing key is not a trusted identity key")]
    UntrustedSigningKey,

    #[error("{0} failed MAC verification")]
    InvalidMac(&'static str),

    #[error("service provider's key exchange signature is invalid")]
    InvalidSignature,

    #[error("{0} report data doesn't bind this key exchange")]
    ReportDataMismatch(&'static str),

    #[error("peer identity rejected: {0:#}")]
    PeerRejected(anyhow::Error),

    #[error("peer rejected our attestation evidence")]
    RejectedByPeer,

    #[error("attestation verification failed: {0}")]
    Verification(String),

    #[error("enclave platform: {0}")]
    Platform(#[from] enclave::Error),

    #[error("quoting service: {0:#}")]
    Quoting(anyhow::Error),

    #[error("crypto: {0}")]
    Crypto(#[from] p256::Error),

    #[error("handshake step in invalid state: {0}")]
    InvalidState(&'static str),

    #[error("handshake is not complete")]
    NotDone,
}

// --- impl Role --- //

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

// --- impl SessionKeys --- //

impl SessionKeys {
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            secret_key: self.secret_key.duplicate(),
            mask_key: self.mask_key.duplicate(),
        }
    }
}

// --- impl Error --- //

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Malformed { .. }
            | Self::UnsupportedGroupId(_)
            | Self::Unsupported(_)
            | Self::InvalidPeerKey(_) => ErrorCategory::InputValidation,
            Self::UntrustedSigningKey
            | Self::InvalidMac(_)
            | Self::InvalidSignature
            | Self::ReportDataMismatch(_)
            | Self::PeerRejected(_) => ErrorCategory::Authentication,
            Self::RejectedByPeer | Self::Verification(_) =>
                ErrorCategory::Verification,
            Self::InvalidState(_) | Self::NotDone => ErrorCategory::Protocol,
            Self::Io(_) => ErrorCategory::Io,
            Self::Platform(_) | Self::Quoting(_) | Self::Crypto(_) =>
                ErrorCategory::Platform,
        }
    }

    pub(crate) fn malformed(
        message: &'static str,
        reason: impl ToString,
    ) -> Self {
        Self::Malformed {
            message,
            reason: reason.to_string(),
        }
    }
}

/// A length for a `u32` length field.
fn len_u32(what: &'static str, len: usize) -> Result<u32, Error> {
    u32::try_from(len)
        .map_err(|_| Error::Unsupported(format!("{len} byte {what}")))
}

impl<H: Handshake + ?Sized> Handshake for Box<H> {
    fn role(&self) -> Role {
        (**self).role()
    }

    fn is_done(&self) -> bool {
        (**self).is_done()
    }

    fn step(&mut self, stream: &mut dyn DuplexStream) -> Result<(), Error> {
        (**self).step(stream)
    }

    fn drive(&mut self, stream: &mut dyn DuplexStream) -> Result<(), Error> {
        (**self).drive(stream)
    }

    fn session_keys(&self) -> Result<SessionKeys, Error> {
        (**self).session_keys()
    }
}
