//! Transfer descriptor sent before the first chunk.
//!
//! # Wire format
//!
//! ```text
//! [2 bytes BE: name_len]
//! [name_len bytes: file name UTF-8]
//! [8 bytes BE: size]
//! [32 bytes: SHA-256 of the file]
//! [4 bytes BE: total_chunks]
//! [4 bytes BE: chunk_size]
//! [1 byte: flags, bit 0 = compressed]
//! [8 bytes BE: compressed_size]   (only when compressed)
//! ```
//!
//! A zero-byte file is sent as one chunk of size 0, so `total_chunks` is
//! never 0. With the compressed flag, chunk bodies may be gzip (see
//! [`compression`](crate::compression)); `compressed_size` is 0 when the
//! sender does not know the total up front.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::chunk::FileDigest;
use crate::constants::{FILE_CHECKSUM_LEN, MAX_CHUNK_SIZE};

const FLAG_COMPRESSED: u8 = 0x01;

/// Immutable description of a file being transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    #[serde(with = "hex_digest")]
    pub checksum: FileDigest,
    pub total_chunks: u32,
    pub chunk_size: u32,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub compressed_size: u64,
}

/// Number of chunks for a file of `size` bytes.
///
/// Always at least 1: an empty file is one empty chunk.
pub fn expected_chunk_count(size: u64, chunk_size: u32) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64).max(1)
}

impl FileInfo {
    /// Builds an uncompressed descriptor, deriving the chunk count.
    ///
    /// Fails if the file needs more than `u32::MAX` chunks.
    pub fn new(
        name: impl Into<String>,
        size: u64,
        checksum: FileDigest,
        chunk_size: u32,
    ) -> Result<Self, ProtocolError> {
        let total = expected_chunk_count(size, chunk_size);
        let total_chunks =
            u32::try_from(total).map_err(|_| ProtocolError::FieldTooLong("total_chunks"))?;
        Ok(Self {
            name: name.into(),
            size,
            checksum,
            total_chunks,
            chunk_size,
            compressed: false,
            compressed_size: 0,
        })
    }

    /// Byte offset of chunk `index` within the file.
    pub fn chunk_offset(&self, index: u32) -> u64 {
        index as u64 * self.chunk_size as u64
    }

    /// Exact length of chunk `index`; the last chunk may be shorter.
    pub fn chunk_len(&self, index: u32) -> u32 {
        if index >= self.total_chunks {
            return 0;
        }
        let remaining = self.size.saturating_sub(self.chunk_offset(index));
        remaining.min(self.chunk_size as u64) as u32
    }

    /// Checks that the chunk math agrees with the declared size.
    pub fn is_consistent(&self) -> bool {
        self.chunk_size > 0
            && self.chunk_size <= MAX_CHUNK_SIZE
            && expected_chunk_count(self.size, self.chunk_size) == self.total_chunks as u64
            && (self.compressed || self.compressed_size == 0)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let name = self.name.as_bytes();
        if name.len() > u16::MAX as usize {
            return Err(ProtocolError::FieldTooLong("name"));
        }

        let mut buf = Vec::with_capacity(2 + name.len() + 8 + FILE_CHECKSUM_LEN + 4 + 4 + 1 + 8);
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.checksum);
        buf.extend_from_slice(&self.total_chunks.to_be_bytes());
        buf.extend_from_slice(&self.chunk_size.to_be_bytes());
        if self.compressed {
            buf.push(FLAG_COMPRESSED);
            buf.extend_from_slice(&self.compressed_size.to_be_bytes());
        } else {
            buf.push(0);
        }
        Ok(buf)
    }

    /// Parses an encoded descriptor.
    ///
    /// Returns `None` on truncation, invalid UTF-8, unknown flags or
    /// trailing bytes.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut r = Reader { data, pos: 0 };

        let name_len = u16::from_be_bytes(r.take()?) as usize;
        let name = std::str::from_utf8(r.bytes(name_len)?).ok()?.to_string();
        let size = u64::from_be_bytes(r.take()?);
        let checksum: FileDigest = r.take()?;
        let total_chunks = u32::from_be_bytes(r.take()?);
        let chunk_size = u32::from_be_bytes(r.take()?);
        let [flags] = r.take::<1>()?;

        let (compressed, compressed_size) = match flags {
            0 => (false, 0),
            FLAG_COMPRESSED => (true, u64::from_be_bytes(r.take()?)),
            _ => return None,
        };

        if r.pos != data.len() {
            return None;
        }

        Some(Self {
            name,
            size,
            checksum,
            total_chunks,
            chunk_size,
            compressed,
            compressed_size,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.bytes(N)?.try_into().ok()
    }
}

mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer, de};

    use crate::chunk::FileDigest;

    pub fn serialize<S: Serializer>(digest: &FileDigest, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<FileDigest, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| de::Error::custom("digest must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::file_checksum;
    use crate::constants::DEFAULT_CHUNK_SIZE;

    fn sample() -> FileInfo {
        FileInfo::new("report.pdf", 150_000, file_checksum(b"x"), DEFAULT_CHUNK_SIZE).unwrap()
    }

    #[test]
    fn chunk_math_150000() {
        let info = sample();
        assert_eq!(info.total_chunks, 3);
        assert_eq!(info.chunk_len(0), 65536);
        assert_eq!(info.chunk_len(1), 65536);
        assert_eq!(info.chunk_len(2), 18928);
        assert_eq!(info.chunk_len(3), 0);
        assert_eq!(info.chunk_offset(2), 131072);
        assert!(info.is_consistent());
    }

    #[test]
    fn exact_multiple_has_no_trailing_chunk() {
        let info = FileInfo::new("a", 4 * 65536, [0; 32], 65536).unwrap();
        assert_eq!(info.total_chunks, 4);
        assert_eq!(info.chunk_len(3), 65536);
    }

    #[test]
    fn zero_byte_file_is_one_empty_chunk() {
        let info = FileInfo::new("empty", 0, file_checksum(&[]), 65536).unwrap();
        assert_eq!(info.total_chunks, 1);
        assert_eq!(info.chunk_len(0), 0);
        assert!(info.is_consistent());

        let decoded = FileInfo::decode(&info.encode().unwrap()).unwrap();
        assert_eq!(decoded.total_chunks, 1);
    }

    #[test]
    fn inconsistent_counts_detected() {
        let mut info = sample();
        info.total_chunks = 4;
        assert!(!info.is_consistent());

        let mut zero = FileInfo::new("e", 0, [0; 32], 1024).unwrap();
        zero.total_chunks = 0;
        assert!(!zero.is_consistent());

        let mut bad_size = sample();
        bad_size.chunk_size = 0;
        assert!(!bad_size.is_consistent());
    }

    #[test]
    fn roundtrip_uncompressed() {
        let info = sample();
        let bytes = info.encode().unwrap();
        assert_eq!(bytes.len(), 2 + 10 + 8 + 32 + 4 + 4 + 1);
        assert_eq!(FileInfo::decode(&bytes), Some(info));
    }

    #[test]
    fn roundtrip_compressed() {
        let mut info = sample();
        info.compressed = true;
        info.compressed_size = 42_000;
        let bytes = info.encode().unwrap();
        assert_eq!(*bytes.last().unwrap(), 0x10); // 42000 = 0xA410
        assert_eq!(FileInfo::decode(&bytes), Some(info));
    }

    #[test]
    fn unicode_name_roundtrip() {
        let info = FileInfo::new("фото_😀.jpg", 10, [3; 32], 4).unwrap();
        assert_eq!(FileInfo::decode(&info.encode().unwrap()), Some(info));
    }

    #[test]
    fn every_truncation_is_none() {
        let mut info = sample();
        info.compressed = true;
        info.compressed_size = 1;
        let bytes = info.encode().unwrap();
        for len in 0..bytes.len() {
            assert!(FileInfo::decode(&bytes[..len]).is_none(), "len {len}");
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes.push(0);
        assert!(FileInfo::decode(&bytes).is_none());
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes[2] = 0xFF;
        assert!(FileInfo::decode(&bytes).is_none());
    }

    #[test]
    fn unknown_flag_rejected() {
        let mut bytes = sample().encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] = 0x02;
        assert!(FileInfo::decode(&bytes).is_none());
    }

    #[test]
    fn random_garbage_never_panics() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let len = rng.gen_range(0..64);
            let buf: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            let _ = FileInfo::decode(&buf);
        }
    }

    #[test]
    fn json_uses_hex_digest() {
        let info = sample();
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains(&hex::encode(info.checksum)));
        let parsed: FileInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }
}
