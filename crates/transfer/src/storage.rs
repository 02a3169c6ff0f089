use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use relaydrop_protocol::{FileDigest, FileHasher, FileInfo};
use tracing::{debug, warn};

use crate::{Delivered, TransferError};

/// Where a receiver puts verified chunks.
///
/// Chunks arrive already checksummed and sized; the store only places
/// them. `prepare` is called once per session, including resumed ones,
/// and must keep previously written bytes.
pub trait ChunkStore: Send {
    fn prepare(&mut self, info: &FileInfo) -> Result<(), TransferError>;

    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError>;

    /// SHA-256 of the first `info.size` stored bytes.
    fn digest(&mut self, info: &FileInfo) -> Result<FileDigest, TransferError>;

    /// Hands over the verified file.
    fn finish(&mut self, info: &FileInfo) -> Result<Delivered, TransferError>;

    /// Drops any partial data.
    fn discard(&mut self) -> Result<(), TransferError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Buffers the whole file in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for MemoryStore {
    fn prepare(&mut self, info: &FileInfo) -> Result<(), TransferError> {
        let size = usize::try_from(info.size)
            .map_err(|_| TransferError::Storage(format!("{} bytes do not fit in memory", info.size)))?;
        self.data.resize(size, 0);
        Ok(())
    }

    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let start = offset as usize;
        let end = start + data.len();
        let slot = self
            .data
            .get_mut(start..end)
            .ok_or_else(|| TransferError::Storage(format!("write past end at {offset}")))?;
        slot.copy_from_slice(data);
        Ok(())
    }

    fn digest(&mut self, _info: &FileInfo) -> Result<FileDigest, TransferError> {
        let mut hasher = FileHasher::new();
        hasher.update(&self.data);
        Ok(hasher.finalize())
    }

    fn finish(&mut self, _info: &FileInfo) -> Result<Delivered, TransferError> {
        Ok(Delivered::Bytes(Arc::new(std::mem::take(&mut self.data))))
    }

    fn discard(&mut self) -> Result<(), TransferError> {
        self.data = Vec::new();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PartialFile
// ---------------------------------------------------------------------------

/// Writes chunks to `<partial_dir>/<transfer_id>.part` at their exact
/// offsets, then moves the finished file into `download_dir`.
///
/// The partial file outlives the process so an interrupted receive can
/// continue from it.
pub struct PartialFile {
    partial_path: PathBuf,
    download_dir: PathBuf,
    file: Option<std::fs::File>,
}

impl PartialFile {
    pub fn new(partial_dir: &Path, download_dir: &Path, transfer_id: &str) -> Self {
        Self {
            partial_path: partial_dir.join(format!("{transfer_id}.part")),
            download_dir: download_dir.to_path_buf(),
            file: None,
        }
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    /// Whether partial data from an earlier session is on disk.
    pub fn exists(&self) -> bool {
        self.partial_path.is_file()
    }

    fn file(&mut self) -> Result<&mut std::fs::File, TransferError> {
        self.file
            .as_mut()
            .ok_or_else(|| TransferError::Storage("partial file not prepared".into()))
    }
}

impl ChunkStore for PartialFile {
    fn prepare(&mut self, info: &FileInfo) -> Result<(), TransferError> {
        if let Some(parent) = self.partial_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.partial_path)?;
        file.set_len(info.size)?;
        debug!(path = %self.partial_path.display(), size = info.size, "partial file ready");
        self.file = Some(file);
        Ok(())
    }

    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn digest(&mut self, info: &FileInfo) -> Result<FileDigest, TransferError> {
        let file = self.file()?;
        file.flush()?;
        file.seek(SeekFrom::Start(0))?;

        let mut hasher = FileHasher::new();
        let mut reader = Read::by_ref(file).take(info.size);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }

    fn finish(&mut self, info: &FileInfo) -> Result<Delivered, TransferError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        std::fs::create_dir_all(&self.download_dir)?;
        let target = unique_target(&self.download_dir, &sanitize_file_name(&info.name));

        if std::fs::rename(&self.partial_path, &target).is_err() {
            // Cross-device move.
            std::fs::copy(&self.partial_path, &target)?;
            std::fs::remove_file(&self.partial_path)?;
        }
        debug!(path = %target.display(), "file delivered");
        Ok(Delivered::File(target))
    }

    fn discard(&mut self) -> Result<(), TransferError> {
        self.file = None;
        match std::fs::remove_file(&self.partial_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %self.partial_path.display(), error = %e, "failed to remove partial file");
                Err(e.into())
            }
        }
    }
}

/// Reduces a peer-supplied name to a single plain file name.
///
/// Directory parts, `..` and roots are dropped; an empty result becomes
/// `download`.
pub fn sanitize_file_name(name: &str) -> String {
    let unified = name.replace('\\', "/");
    Path::new(&unified)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .next_back()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "download".to_string())
}

/// First free path among `name`, `stem (1).ext`, `stem (2).ext`, ...
fn unique_target(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    (1u32..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
