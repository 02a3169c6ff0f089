//! Per-chunk gzip compression.
//!
//! A compressed transfer sets the `FileInfo` flag. Each chunk body is then
//! either gzip (strictly shorter than the raw chunk) or the raw bytes, so a
//! body as long as the chunk is never inflated. The chunk checksum always
//! covers the bytes on the wire.

use std::io::{self, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Extensions of formats that are already compressed.
const INCOMPRESSIBLE: &[&str] = &[
    "gz", "tgz", "zip", "7z", "rar", "bz2", "xz", "lz", "lzma", "zst", "jpg", "jpeg", "png",
    "gif", "webp", "heic", "avif", "mp3", "mp4", "m4a", "m4v", "mov", "avi", "mkv", "webm",
    "flac", "aac", "ogg", "opus",
];

/// Whether a file called `name` is worth compressing.
pub fn should_compress(name: &str) -> bool {
    let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) else {
        return true;
    };
    let ext = ext.to_ascii_lowercase();
    !INCOMPRESSIBLE.contains(&ext.as_str())
}

/// Gzips `data` at the fastest level.
///
/// Returns `None` when the result would not be shorter than `data`.
pub fn compress_chunk(data: &[u8]) -> io::Result<Option<Vec<u8>>> {
    if data.is_empty() {
        return Ok(None);
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data)?;
    let out = encoder.finish()?;
    Ok((out.len() < data.len()).then_some(out))
}

/// Inflates a gzip chunk body that must expand to exactly `expected_len`
/// bytes. Output beyond that length is never buffered.
pub fn decompress_chunk(data: &[u8], expected_len: u32) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len as usize);
    GzDecoder::new(data)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .ok()?;
    (out.len() == expected_len as usize).then_some(out)
}
