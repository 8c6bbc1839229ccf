//! Large-payload chunking: base64 split on the sending side, index-ordered
//! reassembly on the receiving side.
//!
//! Chunk bodies are base64 so an arbitrary byte split never lands inside a
//! JSON string escape. Reassembly is strictly ordered by the declared
//! `chunkIndex`, not arrival order; a duplicate index is ignored and an
//! out-of-range index is an error.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::BytesMut;

/// Default slice size for outbound chunk bodies.
pub const DEFAULT_CHUNK_BYTES: usize = 256 * 1024;

/// Split raw payload bytes into base64 chunk bodies of at most
/// `chunk_bytes` raw bytes each. Empty input yields no chunks.
#[must_use]
pub fn split(payload: &[u8], chunk_bytes: usize) -> Vec<String> {
    let chunk_bytes = chunk_bytes.max(1);
    payload
        .chunks(chunk_bytes)
        .map(|slice| BASE64.encode(slice))
        .collect()
}

/// Reassembly failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// Declared index at or past the declared total.
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Declared total.
        total: u32,
    },
    /// Chunk body was not valid base64.
    #[error("chunk {index} is not valid base64")]
    BadEncoding {
        /// Offending index.
        index: u32,
    },
}

/// Index-ordered reassembly buffer for one `payloadId`.
///
/// Append-only until all `total` slots are filled, at which point
/// [`insert`](Self::insert) returns the concatenated payload and the caller
/// drops the assembly.
#[derive(Debug)]
pub struct ChunkAssembly {
    slots: Vec<Option<Vec<u8>>>,
    received: u32,
}

impl ChunkAssembly {
    /// Start an assembly expecting `total` chunks (must be > 0; a declared
    /// total of zero resolves at the call site with an empty result and no
    /// assembly is created).
    #[must_use]
    pub fn new(total: u32) -> Self {
        Self {
            slots: vec![None; total as usize],
            received: 0,
        }
    }

    /// Declared chunk count.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn total(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Chunks received so far.
    #[must_use]
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Insert the chunk at its declared index.
    ///
    /// Returns the full payload once every slot is filled, `None` while
    /// chunks are still outstanding. A duplicate index is ignored.
    pub fn insert(&mut self, index: u32, data_b64: &str) -> Result<Option<Vec<u8>>, ChunkError> {
        let total = self.total();
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(ChunkError::IndexOutOfRange { index, total })?;
        if slot.is_some() {
            return Ok(None);
        }
        let bytes = BASE64
            .decode(data_b64)
            .map_err(|_| ChunkError::BadEncoding { index })?;
        *slot = Some(bytes);
        self.received += 1;

        if self.received < total {
            return Ok(None);
        }
        let mut buffer = BytesMut::new();
        for slot in &self.slots {
            // Every slot is filled once received == total.
            if let Some(bytes) = slot {
                buffer.extend_from_slice(bytes);
            }
        }
        Ok(Some(buffer.to_vec()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn split_small_payload_is_one_chunk() {
        let chunks = split(b"hello", 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(BASE64.decode(&chunks[0]).unwrap(), b"hello");
    }

    #[test]
    fn split_empty_payload_has_no_chunks() {
        assert!(split(b"", 1024).is_empty());
    }

    #[test]
    fn split_exact_boundary() {
        let payload = vec![7u8; 2048];
        let chunks = split(&payload, 1024);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn split_zero_chunk_bytes_clamps_to_one() {
        let chunks = split(b"ab", 0);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn reassemble_in_order() {
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        let chunks = split(&payload, 8);
        let mut assembly = ChunkAssembly::new(u32::try_from(chunks.len()).unwrap());
        let mut result = None;
        for (i, chunk) in chunks.iter().enumerate() {
            result = assembly
                .insert(u32::try_from(i).unwrap(), chunk)
                .unwrap();
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn reassemble_reverse_order() {
        let payload = b"out of order arrival must not corrupt the buffer".to_vec();
        let chunks = split(&payload, 7);
        let total = u32::try_from(chunks.len()).unwrap();
        let mut assembly = ChunkAssembly::new(total);
        let mut result = None;
        for (i, chunk) in chunks.iter().enumerate().rev() {
            result = assembly
                .insert(u32::try_from(i).unwrap(), chunk)
                .unwrap();
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn incomplete_assembly_returns_none() {
        let chunks = split(b"abcdef", 2);
        let mut assembly = ChunkAssembly::new(3);
        assert!(assembly.insert(0, &chunks[0]).unwrap().is_none());
        assert!(assembly.insert(2, &chunks[2]).unwrap().is_none());
        assert_eq!(assembly.received(), 2);
    }

    #[test]
    fn duplicate_index_is_ignored() {
        let chunks = split(b"abcd", 2);
        let mut assembly = ChunkAssembly::new(2);
        assert!(assembly.insert(0, &chunks[0]).unwrap().is_none());
        assert!(assembly.insert(0, &chunks[0]).unwrap().is_none());
        assert_eq!(assembly.received(), 1);
        let done = assembly.insert(1, &chunks[1]).unwrap();
        assert_eq!(done.unwrap(), b"abcd");
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let mut assembly = ChunkAssembly::new(2);
        let err = assembly.insert(2, "aGk=").unwrap_err();
        assert_eq!(err, ChunkError::IndexOutOfRange { index: 2, total: 2 });
    }

    #[test]
    fn bad_base64_is_an_error() {
        let mut assembly = ChunkAssembly::new(1);
        let err = assembly.insert(0, "!!not base64!!").unwrap_err();
        assert_eq!(err, ChunkError::BadEncoding { index: 0 });
    }

    proptest! {
        #[test]
        fn any_permutation_reassembles_byte_for_byte(
            payload in prop::collection::vec(any::<u8>(), 1..4096),
            chunk_bytes in 1usize..512,
            seed in any::<u64>(),
        ) {
            let chunks = split(&payload, chunk_bytes);
            let total = u32::try_from(chunks.len()).unwrap();

            // Deterministic permutation of delivery order from the seed.
            let mut order: Vec<usize> = (0..chunks.len()).collect();
            let mut state = seed;
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                #[allow(clippy::cast_possible_truncation)]
                let j = (state % (i as u64 + 1)) as usize;
                order.swap(i, j);
            }

            let mut assembly = ChunkAssembly::new(total);
            let mut result = None;
            for &i in &order {
                let out = assembly.insert(u32::try_from(i).unwrap(), &chunks[i]).unwrap();
                if out.is_some() {
                    result = out;
                }
            }
            prop_assert_eq!(result.unwrap(), payload);
        }
    }
}
