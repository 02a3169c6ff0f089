use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use relaydrop_protocol::{FileDigest, FileHasher};

use crate::TransferError;

/// Read size used when hashing a whole source.
const HASH_BLOCK: u32 = 1024 * 1024;

/// Named bytes with random-access reads.
pub trait FileSource: Send + Sync {
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    /// Reads exactly `len` bytes at `offset`.
    fn read_range(&self, offset: u64, len: u32) -> Result<Vec<u8>, TransferError>;

    /// On-disk location, when there is one. Used to reopen the source on
    /// resume.
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Computes the SHA-256 of an entire source.
pub fn checksum_source(source: &dyn FileSource) -> Result<FileDigest, TransferError> {
    let mut hasher = FileHasher::new();
    let size = source.size();
    let mut offset = 0u64;
    while offset < size {
        let len = (size - offset).min(HASH_BLOCK as u64) as u32;
        hasher.update(&source.read_range(offset, len)?);
        offset += len as u64;
    }
    Ok(hasher.finalize())
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: Arc::new(data.into()),
        }
    }
}

impl FileSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, offset: u64, len: u32) -> Result<Vec<u8>, TransferError> {
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset, len))?;
        let end = start
            .checked_add(len as usize)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| out_of_range(offset, len))?;
        Ok(self.data[start..end].to_vec())
    }
}

// ---------------------------------------------------------------------------
// PathSource
// ---------------------------------------------------------------------------

/// A file on disk, read with seek + read.
pub struct PathSource {
    name: String,
    path: PathBuf,
    size: u64,
    file: Mutex<std::fs::File>,
}

impl PathSource {
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::Storage(format!("not a file: {}", path.display())))?;
        Ok(Self {
            name,
            path: path.to_path_buf(),
            size,
            file: Mutex::new(file),
        })
    }
}

impl FileSource for PathSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&self, offset: u64, len: u32) -> Result<Vec<u8>, TransferError> {
        if offset.saturating_add(len as u64) > self.size {
            return Err(out_of_range(offset, len));
        }
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

fn out_of_range(offset: u64, len: u32) -> TransferError {
    TransferError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("read of {len} bytes at {offset} is past the end of the source"),
    ))
}
