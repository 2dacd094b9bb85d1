//! Chunk stores: where the (possibly compressed) bytes of unique chunks live.
//!
//! Three placements share one capability trait:
//! - [`EmbeddedStore`]: ranges inside the archive, after its header
//! - [`ExternalStore`]: ranges inside one external blob file
//! - [`PerChunkStore`]: one file per chunk, named by hex checksum

use crate::compression::decompress;
use crate::dictionary::{ChunkDescriptor, DataLocation};
use crate::error::{ArchiveError, Result};
use crate::fingerprint::Checksum;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::debug;

/// Where a chunk was put. Offset/size are zero for per-chunk stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    /// Byte offset of the stored bytes
    pub archive_offset: u64,
    /// Length of the stored bytes
    pub archive_size: u64,
}

/// Physical placement of chunk bytes.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store the encoded bytes of a new unique chunk.
    async fn put(&self, checksum: &Checksum, data: Bytes) -> Result<Placement>;

    /// Read back the encoded bytes a descriptor refers to.
    async fn get(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>>;

    /// Make every put durable on the underlying file(s).
    async fn flush(&self) -> Result<()>;

    /// Location to record in the dictionary.
    fn location(&self) -> DataLocation;

    /// Read and decode a chunk using the descriptor's codec and declared size.
    async fn fetch(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        let stored = self.get(descriptor).await?;
        let algo = descriptor.algorithm()?;
        let size = descriptor.source_size as usize;
        tokio::task::spawn_blocking(move || decompress(&stored, algo, size)).await?
    }
}

fn not_found(descriptor_hex: String, reason: impl Into<String>) -> ArchiveError {
    ArchiveError::StoreNotFound {
        checksum: descriptor_hex,
        reason: reason.into(),
    }
}

/// Append-only blob of chunks addressed by (offset, size), relative to `base`.
struct BlobFile {
    path: PathBuf,
    base: u64,
    writer: Mutex<Option<(BufWriter<File>, u64)>>,
}

impl BlobFile {
    async fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            base: 0,
            writer: Mutex::new(Some((BufWriter::new(file), 0))),
        })
    }

    fn open(path: &Path, base: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            base,
            writer: Mutex::new(None),
        }
    }

    async fn append(&self, data: &[u8]) -> Result<Placement> {
        let mut guard = self.writer.lock().await;
        let (writer, cursor) = guard.as_mut().ok_or_else(|| {
            ArchiveError::Io(std::io::Error::new(
                ErrorKind::PermissionDenied,
                format!("{} is opened read-only", self.path.display()),
            ))
        })?;
        writer.write_all(data).await?;
        let placement = Placement {
            archive_offset: *cursor,
            archive_size: data.len() as u64,
        };
        *cursor += data.len() as u64;
        Ok(placement)
    }

    async fn read(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        let mut file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(not_found(
                    descriptor.checksum_hex(),
                    format!("{} does not exist", self.path.display()),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        let out_of_range = || {
            not_found(
                descriptor.checksum_hex(),
                format!(
                    "range {}+{} beyond end of {}",
                    descriptor.archive_offset,
                    descriptor.archive_size,
                    self.path.display()
                ),
            )
        };
        let start = self
            .base
            .checked_add(descriptor.archive_offset)
            .ok_or_else(out_of_range)?;
        let end = start
            .checked_add(descriptor.archive_size)
            .ok_or_else(out_of_range)?;
        if end > file.metadata().await?.len() {
            return Err(out_of_range());
        }
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; descriptor.archive_size as usize];
        match file.read_exact(&mut buf).await {
            Ok(_) => Ok(buf),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(out_of_range()),
            Err(e) => Err(e.into()),
        }
    }

    async fn flush(&self) -> Result<()> {
        if let Some((writer, _)) = self.writer.lock().await.as_mut() {
            writer.flush().await?;
            writer.get_ref().sync_data().await?;
        }
        Ok(())
    }
}

/// Chunk data embedded in the archive.
///
/// While packing, chunk bytes are spooled to a side file and copied behind the
/// archive header once the dictionary is known. While unpacking, ranges are read
/// from the archive itself, offset by the header length.
pub struct EmbeddedStore {
    blob: BlobFile,
}

impl EmbeddedStore {
    /// Spool chunk bytes to `spool_path` during packing
    pub async fn spool(spool_path: &Path) -> Result<Self> {
        Ok(Self {
            blob: BlobFile::create(spool_path).await?,
        })
    }

    /// Read chunk bytes from an archive whose chunk data starts at `data_offset`
    pub fn open(archive_path: &Path, data_offset: u64) -> Self {
        Self {
            blob: BlobFile::open(archive_path, data_offset),
        }
    }

    /// File backing this store
    pub fn path(&self) -> &Path {
        &self.blob.path
    }
}

#[async_trait]
impl ChunkStore for EmbeddedStore {
    async fn put(&self, checksum: &Checksum, data: Bytes) -> Result<Placement> {
        let placement = self.blob.append(&data).await?;
        debug!(%checksum, offset = placement.archive_offset, size = placement.archive_size, "spooled embedded chunk");
        Ok(placement)
    }

    async fn get(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        self.blob.read(descriptor).await
    }

    async fn flush(&self) -> Result<()> {
        self.blob.flush().await
    }

    fn location(&self) -> DataLocation {
        DataLocation::Embedded
    }
}

/// All chunk bytes back to back in one external file.
pub struct ExternalStore {
    blob: BlobFile,
    recorded: PathBuf,
}

impl ExternalStore {
    /// Create (truncate) `path`; the dictionary records `recorded`
    pub async fn create(path: &Path, recorded: PathBuf) -> Result<Self> {
        Ok(Self {
            blob: BlobFile::create(path).await?,
            recorded,
        })
    }

    /// Read chunks from an existing blob file
    pub fn open(path: &Path) -> Self {
        Self {
            blob: BlobFile::open(path, 0),
            recorded: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl ChunkStore for ExternalStore {
    async fn put(&self, checksum: &Checksum, data: Bytes) -> Result<Placement> {
        let placement = self.blob.append(&data).await?;
        debug!(%checksum, offset = placement.archive_offset, size = placement.archive_size, "wrote external chunk");
        Ok(placement)
    }

    async fn get(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        self.blob.read(descriptor).await
    }

    async fn flush(&self) -> Result<()> {
        self.blob.flush().await
    }

    fn location(&self) -> DataLocation {
        DataLocation::External(self.recorded.clone())
    }
}

/// One file per chunk inside a directory.
pub struct PerChunkStore {
    dir: PathBuf,
    recorded: PathBuf,
}

impl PerChunkStore {
    /// Create the directory if needed; the dictionary records `recorded`
    pub async fn create(dir: &Path, recorded: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            recorded,
        })
    }

    /// Read chunks from an existing directory
    pub fn open(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            recorded: dir.to_path_buf(),
        }
    }

    /// File holding the chunk with this hex checksum
    pub fn chunk_path(&self, checksum_hex: &str) -> PathBuf {
        self.dir.join(checksum_hex)
    }
}

#[async_trait]
impl ChunkStore for PerChunkStore {
    async fn put(&self, checksum: &Checksum, data: Bytes) -> Result<Placement> {
        let path = self.chunk_path(&checksum.to_hex());
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        debug!(%checksum, size = data.len(), "wrote chunk file");
        Ok(Placement::default())
    }

    async fn get(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        let hex = descriptor.checksum_hex();
        let path = self.chunk_path(&hex);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(not_found(hex, format!("{} does not exist", path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn location(&self) -> DataLocation {
        DataLocation::PerChunk(self.recorded.clone())
    }
}

/// Open a store for reading the chunks of a dictionary.
/// Relative locations resolve against `archive_dir`.
pub fn open_store(
    location: &DataLocation,
    archive_path: &Path,
    data_offset: u64,
) -> Arc<dyn ChunkStore> {
    let archive_dir = archive_path.parent().unwrap_or_else(|| Path::new("."));
    match location {
        DataLocation::Embedded => Arc::new(EmbeddedStore::open(archive_path, data_offset)),
        DataLocation::External(p) => Arc::new(ExternalStore::open(&archive_dir.join(p))),
        DataLocation::PerChunk(p) => Arc::new(PerChunkStore::open(&archive_dir.join(p))),
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory store for pipeline tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct MemoryStore {
        pub chunks: StdMutex<HashMap<Vec<u8>, Vec<u8>>>,
        pub puts: StdMutex<Vec<Checksum>>,
    }

    #[async_trait]
    impl ChunkStore for MemoryStore {
        async fn put(&self, checksum: &Checksum, data: Bytes) -> Result<Placement> {
            self.puts.lock().unwrap().push(checksum.clone());
            self.chunks
                .lock()
                .unwrap()
                .insert(checksum.as_bytes().to_vec(), data.to_vec());
            Ok(Placement {
                archive_offset: 0,
                archive_size: data.len() as u64,
            })
        }

        async fn get(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
            self.chunks
                .lock()
                .unwrap()
                .get(&descriptor.checksum)
                .cloned()
                .ok_or_else(|| not_found(descriptor.checksum_hex(), "not in memory"))
        }

        async fn flush(&self) -> Result<()> {
            Ok(())
        }

        fn location(&self) -> DataLocation {
            DataLocation::Embedded
        }
    }
}
