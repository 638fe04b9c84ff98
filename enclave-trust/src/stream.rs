//! The plaintext byte streams handshakes and channels run over, plus the
//! framing helpers handshake messages use.

use std::io::{self, Read, Write};

/// A blocking, ordered, reliable duplex byte stream, e.g. a `TcpStream`.
pub trait DuplexStream: Read + Write {}

impl<T: Read + Write + ?Sized> DuplexStream for T {}

/// Length of the `u64` little-endian prefix on variable-size messages.
pub const LEN_PREFIX_LEN: usize = 8;

/// Write a fixed-size message.
pub(crate) fn send_fixed(
    stream: &mut dyn DuplexStream,
    msg: &[u8],
) -> io::Result<()> {
    stream.write_all(msg)?;
    stream.flush()
}

/// Read a fixed-size message.
pub(crate) fn recv_fixed<const N: usize>(
    stream: &mut dyn DuplexStream,
) -> io::Result<[u8; N]> {
    let mut msg = [0u8; N];
    stream.read_exact(&mut msg)?;
    Ok(msg)
}

/// Write a variable-size message behind a `u64` little-endian length.
pub(crate) fn send_sized(
    stream: &mut dyn DuplexStream,
    msg: &[u8],
) -> io::Result<()> {
    stream.write_all(&(msg.len() as u64).to_le_bytes())?;
    stream.write_all(msg)?;
    stream.flush()
}

/// Read a `u64` length-prefixed message of at most `max_len` bytes.
pub(crate) fn recv_sized(
    stream: &mut dyn DuplexStream,
    max_len: usize,
) -> io::Result<Vec<u8>> {
    let len = u64::from_le_bytes(recv_fixed::<LEN_PREFIX_LEN>(stream)?);
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| len <= max_len)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "message length {len} exceeds the {max_len} byte limit"
                ),
            )
        })?;
    let mut msg = vec![0u8; len];
    stream.read_exact(&mut msg)?;
    Ok(msg)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::MemPipe;

    #[test]
    fn test_sized_roundtrip() {
        let (mut a, mut b) = MemPipe::pair();
        send_sized(&mut a, b"hello").unwrap();
        send_sized(&mut a, b"").unwrap();
        assert_eq!(recv_sized(&mut b, 16).unwrap(), b"hello");
        assert_eq!(recv_sized(&mut b, 16).unwrap(), b"");
    }

    #[test]
    fn test_sized_too_large() {
        let (mut a, mut b) = MemPipe::pair();
        send_sized(&mut a, &[0u8; 17]).unwrap();
        let err = recv_sized(&mut b, 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_fixed_eof() {
        let (mut a, mut b) = MemPipe::pair();
        send_fixed(&mut a, &[1, 2, 3]).unwrap();
        let err = recv_fixed::<4>(&mut b).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
