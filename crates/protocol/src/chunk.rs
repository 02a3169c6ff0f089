//! Chunk framing and integrity checks.
//!
//! ```text
//! CHUNK payload:
//!   [4 bytes BE: index]
//!   [4 bytes BE: size]
//!   [8 bytes: SHA-256 prefix of the chunk bytes]
//!   [size bytes: chunk bytes]
//! ```

use sha2::{Digest, Sha256};

use crate::constants::{CHUNK_CHECKSUM_LEN, CHUNK_HEADER_LEN, FILE_CHECKSUM_LEN};

/// Truncated SHA-256 digest carried in a chunk header.
pub type ChunkDigest = [u8; CHUNK_CHECKSUM_LEN];

/// Full SHA-256 digest of a file.
pub type FileDigest = [u8; FILE_CHECKSUM_LEN];

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes the truncated digest of exactly `data`.
pub fn compute_checksum(data: &[u8]) -> ChunkDigest {
    let full = Sha256::digest(data);
    let mut out = [0u8; CHUNK_CHECKSUM_LEN];
    out.copy_from_slice(&full[..CHUNK_CHECKSUM_LEN]);
    out
}

/// Returns `true` if `data` hashes to `expected`.
pub fn verify_checksum(data: &[u8], expected: &ChunkDigest) -> bool {
    compute_checksum(data) == *expected
}

/// Computes the whole-file SHA-256 of an in-memory buffer.
pub fn file_checksum(data: &[u8]) -> FileDigest {
    Sha256::digest(data).into()
}

/// Incremental whole-file hasher for sources read piecewise.
#[derive(Default, Clone)]
pub struct FileHasher(Sha256);

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> FileDigest {
        self.0.finalize().into()
    }
}

// ---------------------------------------------------------------------------
// ChunkHeader
// ---------------------------------------------------------------------------

/// Fixed-width header preceding every chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub index: u32,
    pub size: u32,
    pub checksum: ChunkDigest,
}

impl ChunkHeader {
    /// Builds the header for `data` at `index`.
    pub fn for_payload(index: u32, data: &[u8]) -> Self {
        Self {
            index,
            size: data.len() as u32,
            checksum: compute_checksum(data),
        }
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut buf = [0u8; CHUNK_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.index.to_be_bytes());
        buf[4..8].copy_from_slice(&self.size.to_be_bytes());
        buf[8..16].copy_from_slice(&self.checksum);
        buf
    }

    /// Parses the first [`CHUNK_HEADER_LEN`] bytes of `data`.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let header = data.get(..CHUNK_HEADER_LEN)?;
        Some(Self {
            index: u32::from_be_bytes(header[0..4].try_into().ok()?),
            size: u32::from_be_bytes(header[4..8].try_into().ok()?),
            checksum: header[8..16].try_into().ok()?,
        })
    }
}

/// Builds a CHUNK payload: header followed by `data`.
pub fn encode_chunk(index: u32, data: &[u8]) -> Vec<u8> {
    let header = ChunkHeader::for_payload(index, data);
    let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + data.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(data);
    buf
}

/// Splits a CHUNK payload into header and bytes.
///
/// Returns `None` unless exactly `header.size` bytes follow the header.
/// The checksum is not checked here.
pub fn decode_chunk(data: &[u8]) -> Option<(ChunkHeader, &[u8])> {
    let header = ChunkHeader::decode(data)?;
    let body = &data[CHUNK_HEADER_LEN..];
    if body.len() != header.size as usize {
        return None;
    }
    Some((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_deterministic() {
        assert_eq!(compute_checksum(b"hello world"), compute_checksum(b"hello world"));
        assert_ne!(compute_checksum(b"hello"), compute_checksum(b"world"));
    }

    #[test]
    fn checksum_is_sha256_prefix() {
        // SHA-256("abc") = ba7816bf8f01cfea...
        assert_eq!(
            compute_checksum(b"abc"),
            [0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea]
        );
    }

    #[test]
    fn verify_accepts_own_digest() {
        let data = vec![7u8; 4096];
        assert!(verify_checksum(&data, &compute_checksum(&data)));
    }

    #[test]
    fn single_byte_flip_fails_verification() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let digest = compute_checksum(&data);
        for pos in [0usize, 1, 499, 998, 999] {
            let mut corrupt = data.clone();
            corrupt[pos] ^= 0x01;
            assert!(!verify_checksum(&corrupt, &digest), "flip at {pos}");
        }
    }

    #[test]
    fn header_layout() {
        let header = ChunkHeader {
            index: 2,
            size: 18928,
            checksum: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 2]);
        assert_eq!(&bytes[4..8], &18928u32.to_be_bytes());
        assert_eq!(&bytes[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ChunkHeader::decode(&bytes), Some(header));
    }

    #[test]
    fn header_decode_short_input_is_none() {
        let bytes = ChunkHeader::for_payload(9, b"xyz").encode();
        for len in 0..CHUNK_HEADER_LEN {
            assert!(ChunkHeader::decode(&bytes[..len]).is_none(), "len {len}");
        }
    }

    #[test]
    fn header_decode_random_short_input_is_none() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let len = rng.gen_range(0..CHUNK_HEADER_LEN);
            let buf: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            assert!(ChunkHeader::decode(&buf).is_none());
            assert!(decode_chunk(&buf).is_none());
        }
    }

    #[test]
    fn chunk_roundtrip_verifies() {
        let data = b"payload bytes".to_vec();
        let encoded = encode_chunk(5, &data);
        let (header, body) = decode_chunk(&encoded).unwrap();
        assert_eq!(header.index, 5);
        assert_eq!(header.size as usize, data.len());
        assert_eq!(body, &data[..]);
        assert!(verify_checksum(body, &header.checksum));
    }

    #[test]
    fn decode_chunk_rejects_size_mismatch() {
        let mut encoded = encode_chunk(0, b"abcd");
        encoded.push(0);
        assert!(decode_chunk(&encoded).is_none());
        encoded.truncate(encoded.len() - 2);
        assert!(decode_chunk(&encoded).is_none());
    }

    #[test]
    fn empty_chunk_is_valid() {
        let encoded = encode_chunk(0, &[]);
        assert_eq!(encoded.len(), CHUNK_HEADER_LEN);
        let (header, body) = decode_chunk(&encoded).unwrap();
        assert_eq!(header.size, 0);
        assert!(body.is_empty());
        assert!(verify_checksum(body, &header.checksum));
    }

    #[test]
    fn streaming_hasher_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut hasher = FileHasher::new();
        for piece in data.chunks(333) {
            hasher.update(piece);
        }
        assert_eq!(hasher.finalize(), file_checksum(&data));
    }
}
