use crate::{channel::{Error, TAG_LEN}, stream::LEN_PREFIX_LEN};

/// Incrementally reassembles `u64` length-prefixed records from however
/// many bytes the transport hands us at a time.
///
/// Callers fill [`RecordDecoder::unfilled`] then report how much they wrote
/// with [`RecordDecoder::advance`]. All progress lives in the decoder, so a
/// read that's interrupted (or an async read future that's dropped) between
/// calls loses nothing.
pub(crate) struct RecordDecoder {
    max_record_len: usize,
    phase: Phase,
    len_prefix: [u8; LEN_PREFIX_LEN],
    body: Vec<u8>,
    filled: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Length,
    Body,
}

impl RecordDecoder {
    /// `max_record_len` bounds `ciphertext || tag`.
    pub fn new(max_record_len: usize) -> Self {
        Self {
            max_record_len,
            phase: Phase::Length,
            len_prefix: [0; LEN_PREFIX_LEN],
            body: Vec::new(),
            filled: 0,
        }
    }

    pub fn set_max_record_len(&mut self, max_record_len: usize) {
        self.max_record_len = max_record_len;
    }

    /// Whether we're between records.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Length && self.filled == 0
    }

    /// The buffer the next transport read should fill. Never empty.
    pub fn unfilled(&mut self) -> &mut [u8] {
        match self.phase {
            Phase::Length => &mut self.len_prefix[self.filled..],
            Phase::Body => &mut self.body[self.filled..],
        }
    }

    /// Record that `n` bytes of [`unfilled`](Self::unfilled) were written.
    /// Returns a complete `ciphertext || tag` once one is assembled.
    pub fn advance(&mut self, n: usize) -> Result<Option<Vec<u8>>, Error> {
        self.filled += n;
        match self.phase {
            Phase::Length => {
                if self.filled < LEN_PREFIX_LEN {
                    return Ok(None);
                }
                let len = u64::from_le_bytes(self.len_prefix);
                let valid = TAG_LEN..=self.max_record_len;
                let body_len = usize::try_from(len)
                    .ok()
                    .filter(|len| valid.contains(len))
                    .ok_or(Error::InvalidRecordLength(len))?;
                self.phase = Phase::Body;
                self.body = vec![0u8; body_len];
                self.filled = 0;
                Ok(None)
            }
            Phase::Body => {
                if self.filled < self.body.len() {
                    return Ok(None);
                }
                self.phase = Phase::Length;
                self.filled = 0;
                Ok(Some(std::mem::take(&mut self.body)))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::{collection::vec, prop_assert_eq, proptest};

    use super::*;

    fn record(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    /// Feed `bytes` to the decoder in chunks of at most `chunk` bytes.
    fn feed(
        decoder: &mut RecordDecoder,
        mut bytes: &[u8],
        chunk: usize,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let mut records = Vec::new();
        while !bytes.is_empty() {
            let unfilled = decoder.unfilled();
            let n = unfilled.len().min(chunk).min(bytes.len());
            unfilled[..n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            if let Some(record) = decoder.advance(n)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    #[test]
    fn test_fragmented_delivery() {
        proptest!(|(
            bodies in vec(vec(0u8..=255, TAG_LEN..64), 1..5),
            chunk in 1usize..40,
        )| {
            let stream =
                bodies.iter().flat_map(|b| record(b)).collect::<Vec<_>>();
            let mut decoder = RecordDecoder::new(64);
            let records = feed(&mut decoder, &stream, chunk).unwrap();
            prop_assert_eq!(records, bodies);
            prop_assert_eq!(decoder.is_idle(), true);
        });
    }

    #[test]
    fn test_invalid_lengths() {
        let mut decoder = RecordDecoder::new(64);
        assert!(matches!(
            feed(&mut decoder, &record(&[0; TAG_LEN - 1]), 8),
            Err(Error::InvalidRecordLength(15)),
        ));

        let mut decoder = RecordDecoder::new(64);
        assert!(matches!(
            feed(&mut decoder, &65u64.to_le_bytes(), 3),
            Err(Error::InvalidRecordLength(65)),
        ));

        let mut decoder = RecordDecoder::new(64);
        assert!(matches!(
            feed(&mut decoder, &u64::MAX.to_le_bytes(), 8),
            Err(Error::InvalidRecordLength(u64::MAX)),
        ));
    }

    #[test]
    fn test_idle_tracking() {
        let mut decoder = RecordDecoder::new(64);
        assert!(decoder.is_idle());
        let bytes = record(&[7; TAG_LEN]);
        feed(&mut decoder, &bytes[..3], 8).unwrap();
        assert!(!decoder.is_idle());
        feed(&mut decoder, &bytes[3..10], 8).unwrap();
        assert!(!decoder.is_idle());
        let records = feed(&mut decoder, &bytes[10..], 8).unwrap();
        assert_eq!(records, vec![vec![7; TAG_LEN]]);
        assert!(decoder.is_idle());
    }
}
