//! Archive files: framing of the dictionary and, when embedded, the chunk data.
//!
//! ```text
//! magic "CDAR\0\0\0\x01" (8) | dictionary length u64 LE (8) | dictionary
//! | BLAKE3 of everything before it (32) | chunk data ...
//! ```
//!
//! Embedded `archive_offset`s count from the first byte of chunk data.

use crate::dictionary::{ChunkDictionary, DataLocation, DictionarySummary};
use crate::error::{ArchiveError, Result};
use crate::pack::{PackOutcome, Packer};
use crate::store::{open_store, ChunkStore, EmbeddedStore, ExternalStore, PerChunkStore};
use crate::unpack::{Destination, FileDestination, UnpackStats, Unpacker};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument};

/// File signature, including a format version in the last byte
pub const MAGIC: [u8; 8] = *b"CDAR\0\0\0\x01";

const HEADER_CHECKSUM_LEN: usize = 32;

/// Where `create` puts chunk data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Inside the archive file
    #[default]
    Embedded,
    /// In one external blob file
    External(PathBuf),
    /// One file per chunk in a directory
    PerChunk(PathBuf),
}

/// Serialize the archive header for `dictionary`.
pub fn encode_header(dictionary: &ChunkDictionary) -> Vec<u8> {
    let dict = dictionary.to_bytes();
    let mut header = Vec::with_capacity(MAGIC.len() + 8 + dict.len() + HEADER_CHECKSUM_LEN);
    header.extend_from_slice(&MAGIC);
    header.extend_from_slice(&(dict.len() as u64).to_le_bytes());
    header.extend_from_slice(&dict);
    let checksum = blake3::hash(&header);
    header.extend_from_slice(checksum.as_bytes());
    header
}

/// An opened archive: its dictionary and where its chunk data starts.
#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
    dictionary: ChunkDictionary,
    data_offset: u64,
}

impl Archive {
    /// Archive file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decoded dictionary
    pub fn dictionary(&self) -> &ChunkDictionary {
        &self.dictionary
    }

    /// Byte offset of the first chunk-data byte
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Dictionary summary for display
    pub fn summary(&self) -> DictionarySummary {
        self.dictionary.summary()
    }

    /// Store holding this archive's chunks. `location_override` replaces the
    /// recorded external file or chunk directory.
    pub fn store(&self, location_override: Option<&Path>) -> Result<Arc<dyn ChunkStore>> {
        let location = self.dictionary.data_location();
        match (location_override, &location) {
            (None, _) => Ok(open_store(&location, &self.path, self.data_offset)),
            (Some(_), DataLocation::Embedded) => Err(ArchiveError::InvalidParameters(
                "chunk data is embedded; a chunk location cannot be given".into(),
            )),
            (Some(p), DataLocation::External(_)) => Ok(Arc::new(ExternalStore::open(p))),
            (Some(p), DataLocation::PerChunk(_)) => Ok(Arc::new(PerChunkStore::open(p))),
        }
    }
}

/// Read and check the header of the archive at `path`.
pub async fn open(path: &Path) -> Result<Archive> {
    let mut file = File::open(path).await?;
    let file_len = file.metadata().await?.len();

    let mut fixed = [0u8; 16];
    read_header_part(&mut file, &mut fixed, "header").await?;
    if fixed[..8] != MAGIC {
        return Err(ArchiveError::ArchiveFormat(format!(
            "{} is not a cdar archive",
            path.display()
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&fixed[8..]);
    let dict_len = u64::from_le_bytes(len_bytes);
    let data_offset = 16u64
        .checked_add(dict_len)
        .and_then(|n| n.checked_add(HEADER_CHECKSUM_LEN as u64))
        .filter(|&n| n <= file_len)
        .ok_or_else(|| {
            ArchiveError::ArchiveFormat(format!(
                "dictionary length {dict_len} exceeds archive size {file_len}"
            ))
        })?;

    let mut dict = vec![0u8; dict_len as usize];
    read_header_part(&mut file, &mut dict, "dictionary").await?;
    let mut recorded = [0u8; HEADER_CHECKSUM_LEN];
    read_header_part(&mut file, &mut recorded, "header checksum").await?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(&fixed);
    hasher.update(&dict);
    if hasher.finalize().as_bytes() != &recorded {
        return Err(ArchiveError::ArchiveFormat("header checksum mismatch".into()));
    }

    let dictionary = ChunkDictionary::from_bytes(&dict)?;
    debug!(path = %path.display(), dict_len, data_offset, "opened archive");
    Ok(Archive {
        path: path.to_path_buf(),
        dictionary,
        data_offset,
    })
}

async fn read_header_part(file: &mut File, buf: &mut [u8], what: &str) -> Result<()> {
    match file.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            ArchiveError::ArchiveFormat(format!("archive truncated in {what}")),
        ),
        Err(e) => Err(e.into()),
    }
}

/// Path recorded in the dictionary for a side store: a bare name when it sits
/// next to the archive (so both can move together), otherwise absolute.
fn recorded_path(archive_path: &Path, target: &Path) -> PathBuf {
    match target.file_name() {
        Some(name) if target.parent() == archive_path.parent() => PathBuf::from(name),
        _ => std::path::absolute(target).unwrap_or_else(|_| target.to_path_buf()),
    }
}

fn spool_path(archive_path: &Path) -> PathBuf {
    let mut name = archive_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".chunks.tmp");
    archive_path.with_file_name(name)
}

/// Pack `source` into a new archive at `archive_path`.
///
/// Fails with `Io(AlreadyExists)` if the archive exists and `force` is not set.
#[instrument(skip(source, packer), fields(archive = %archive_path.display()))]
pub async fn create<R>(
    source: R,
    archive_path: &Path,
    store: &StoreConfig,
    packer: &Packer,
    force: bool,
) -> Result<PackOutcome>
where
    R: Read + Send + 'static,
{
    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let mut archive = options.open(archive_path).await?;

    let outcome = match store {
        StoreConfig::Embedded => {
            let spool = spool_path(archive_path);
            let result = pack_embedded(source, &spool, packer, &mut archive).await;
            if let Err(e) = tokio::fs::remove_file(&spool).await {
                debug!(spool = %spool.display(), error = %e, "spool not removed");
            }
            result?
        }
        StoreConfig::External(path) => {
            let chunks = ExternalStore::create(path, recorded_path(archive_path, path)).await?;
            let outcome = packer.pack(source, &chunks).await?;
            archive.write_all(&encode_header(&outcome.dictionary)).await?;
            outcome
        }
        StoreConfig::PerChunk(dir) => {
            let chunks = PerChunkStore::create(dir, recorded_path(archive_path, dir)).await?;
            let outcome = packer.pack(source, &chunks).await?;
            archive.write_all(&encode_header(&outcome.dictionary)).await?;
            outcome
        }
    };
    archive.flush().await?;
    archive.sync_all().await?;

    info!(
        chunks = outcome.stats.chunks,
        unique = outcome.stats.unique_chunks,
        location = %outcome.dictionary.data_location(),
        "archive created"
    );
    Ok(outcome)
}

async fn pack_embedded<R>(
    source: R,
    spool: &Path,
    packer: &Packer,
    archive: &mut File,
) -> Result<PackOutcome>
where
    R: Read + Send + 'static,
{
    let chunks = EmbeddedStore::spool(spool).await?;
    let outcome = packer.pack(source, &chunks).await?;
    archive.write_all(&encode_header(&outcome.dictionary)).await?;
    let mut data = File::open(spool).await?;
    let copied = tokio::io::copy(&mut data, archive).await?;
    debug!(copied, "embedded chunk data");
    Ok(outcome)
}

/// Rebuild the source of the archive at `archive_path` into `output_path`.
///
/// The dictionary is validated before the output file is created.
#[instrument(skip(unpacker), fields(archive = %archive_path.display()))]
pub async fn extract(
    archive_path: &Path,
    output_path: &Path,
    unpacker: &Unpacker,
    location_override: Option<&Path>,
) -> Result<UnpackStats> {
    let archive = open(archive_path).await?;
    archive.dictionary().validate()?;
    let store = archive.store(location_override)?;
    let dest: Arc<dyn Destination> = Arc::new(FileDestination::create(output_path).await?);
    unpacker.unpack(archive.dictionary(), store, dest).await
}
