use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{MeshError, Result};
use crate::protocol::{Category, ControlSignal, FileDescriptor, Rank, TransferMetadata};
use crate::transport::GroupTransport;

/// Fixed chunk size shared by every member. Not carried in the descriptor,
/// so both sides must agree on it out of band.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of the full file content, one sequential read.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Chunk math for a file of `size` bytes: (chunk_count, last_chunk_size).
/// The last chunk is a full CHUNK_SIZE when the size is a nonzero exact
/// multiple; an empty file has no chunks at all.
pub fn chunk_layout(size: u64) -> (u32, u32) {
    if size == 0 {
        return (0, 0);
    }
    let full = (size / CHUNK_SIZE as u64) as u32;
    let rem = (size % CHUNK_SIZE as u64) as u32;
    if rem > 0 {
        (full + 1, rem)
    } else {
        (full, CHUNK_SIZE as u32)
    }
}

/// Build the descriptor for a local file. Costs one full read for the
/// checksum.
pub fn describe_file(path: &Path) -> Result<FileDescriptor> {
    if !path.is_file() {
        return Err(MeshError::FileNotFound(path.to_path_buf()));
    }
    let name = path
        .file_name()
        .ok_or_else(|| MeshError::FileNotFound(path.to_path_buf()))?
        .to_string_lossy()
        .to_string();
    let size = std::fs::metadata(path)?.len();
    let (chunk_count, last_chunk_size) = chunk_layout(size);
    Ok(FileDescriptor {
        name,
        size,
        checksum: file_checksum(path)?,
        chunk_count,
        last_chunk_size,
    })
}

/// Deterministic name for a received file, prefixed by its origin so it
/// never collides with a local original.
pub fn incoming_name(source: Rank, name: &str) -> String {
    if source == 0 {
        format!("from_master_{name}")
    } else {
        format!("from_rank{source}_{name}")
    }
}

/// Sequential fixed-size chunk reader; never buffers the whole file.
pub struct FileChunker {
    file: File,
    total_size: u64,
    bytes_read: u64,
}

impl FileChunker {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let total_size = file.metadata()?.len();
        Ok(Self {
            file,
            total_size,
            bytes_read: 0,
        })
    }

    /// Read the next chunk, or None once the file is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.bytes_read >= self.total_size {
            return Ok(None);
        }
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let n = self.file.read(&mut buffer)?;
        if n == 0 {
            return Ok(None);
        }
        buffer.truncate(n);
        self.bytes_read += n as u64;
        Ok(Some(buffer))
    }
}

/// Appends received chunks to the destination file.
pub struct FileWriter {
    file: File,
    bytes_written: u64,
}

impl FileWriter {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file,
            bytes_written: 0,
        })
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn finalize(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// How a completed transfer checked out. Size mismatches are fatal to the
/// transfer; checksum mismatches are warnings. The file stays on disk either
/// way for operator inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Verified,
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch { expected: String, actual: String },
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Verified => write!(f, "verified"),
            TransferOutcome::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {expected} bytes, wrote {actual}")
            }
            TransferOutcome::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, computed {actual}")
            }
        }
    }
}

/// Push a file to `dest`: Transfer signal, push metadata, the chunks on the
/// Data category, then Complete.
pub async fn send_file(
    transport: &dyn GroupTransport,
    dest: Rank,
    path: &Path,
) -> Result<FileDescriptor> {
    let descriptor = describe_file(path)?;
    transport
        .send(dest, Category::Control, ControlSignal::Transfer.to_bytes()?)
        .await?;
    let metadata = TransferMetadata::Push {
        from: transport.rank(),
        descriptor: descriptor.clone(),
    };
    transport
        .send(dest, Category::Metadata, metadata.to_bytes()?)
        .await?;

    let mut chunker = FileChunker::new(path)?;
    let mut sent = 0u32;
    while let Some(chunk) = chunker.next_chunk()? {
        transport.send(dest, Category::Data, chunk).await?;
        sent += 1;
        if sent % 16 == 0 {
            tracing::debug!(sent, total = descriptor.chunk_count, dest, "transfer progress");
        }
    }
    transport
        .send(dest, Category::Control, ControlSignal::Complete.to_bytes()?)
        .await?;
    Ok(descriptor)
}

/// Receive the Data phase of a push from `source` into `dest`, alternating
/// between the Control probe (for Complete) and the Data probe, servicing
/// whichever is ready in arrival order. Returns the byte count written.
pub async fn receive_data(
    transport: &dyn GroupTransport,
    source: Rank,
    dest: &Path,
    poll: Duration,
) -> Result<u64> {
    let mut writer = FileWriter::new(dest)?;
    loop {
        if transport.probe(source, Category::Control) {
            let sig =
                ControlSignal::from_bytes(&transport.receive(source, Category::Control).await?)?;
            match sig {
                ControlSignal::Complete => break,
                other => tracing::warn!(?other, source, "unexpected signal mid-transfer"),
            }
        } else if transport.probe(source, Category::Data) {
            let chunk = transport.receive(source, Category::Data).await?;
            writer.write_chunk(&chunk)?;
        } else {
            tokio::time::sleep(poll).await;
        }
    }
    // Ordering holds only within a (source, category) pair, so Complete can
    // be observed while chunks are still queued; drain them before closing.
    while transport.probe(source, Category::Data) {
        let chunk = transport.receive(source, Category::Data).await?;
        writer.write_chunk(&chunk)?;
    }
    let written = writer.bytes_written();
    writer.finalize()?;
    Ok(written)
}

/// Check a completed transfer against its descriptor. Never deletes the
/// file.
pub fn verify(path: &Path, descriptor: &FileDescriptor, written: u64) -> Result<TransferOutcome> {
    if written != descriptor.size {
        return Ok(TransferOutcome::SizeMismatch {
            expected: descriptor.size,
            actual: written,
        });
    }
    let actual = file_checksum(path)?;
    if actual != descriptor.checksum {
        return Ok(TransferOutcome::ChecksumMismatch {
            expected: descriptor.checksum.clone(),
            actual,
        });
    }
    Ok(TransferOutcome::Verified)
}
