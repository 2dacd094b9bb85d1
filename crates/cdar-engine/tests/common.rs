//! Common fixtures for archive integration tests.

#![allow(dead_code)]

use cdar_engine::archive::{self, StoreConfig};
use cdar_engine::{
    ChunkerConfig, CompressionAlgorithm, PackConfig, PackOutcome, Packer, UnpackConfig, UnpackStats,
    Unpacker,
};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Deterministic incompressible bytes
pub fn noise(len: usize, mut seed: u32) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed as u8
        })
        .collect()
}

/// Deterministic compressible text that still chunks on content
pub fn prose(len: usize, mut seed: u32) -> Vec<u8> {
    const WORDS: &[&str] = &[
        "chunk", "archive", "rolling", "window", "dictionary", "offset", "store", "codec",
        "boundary", "source", "checksum", "placement", "the", "of", "and", "a",
    ];
    let mut out = Vec::with_capacity(len + 16);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        out.extend_from_slice(WORDS[(seed % WORDS.len() as u32) as usize].as_bytes());
        out.push(if seed % 11 == 0 { b'\n' } else { b' ' });
    }
    out.truncate(len);
    out
}

/// Small chunks so modest inputs produce many of them (average 4 KiB)
pub fn small_chunks() -> ChunkerConfig {
    ChunkerConfig {
        filter_bits: 12,
        min_size: 1024,
        max_size: 64 * 1024,
        window_size: 16,
        hash_length: 32,
    }
}

pub fn pack_config(compression: CompressionAlgorithm) -> PackConfig {
    PackConfig {
        chunker: small_chunks(),
        compression,
        workers: 4,
        queue_depth: 8,
    }
}

pub fn unpacker() -> Unpacker {
    Unpacker::new(UnpackConfig {
        workers: 4,
        ..Default::default()
    })
    .unwrap()
}

/// A scratch directory holding one archive, its side stores and outputs.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn archive(&self) -> PathBuf {
        self.path("source.cdar")
    }

    /// All three placements, side stores next to the archive
    pub fn store_configs(&self) -> Vec<StoreConfig> {
        vec![
            StoreConfig::Embedded,
            StoreConfig::External(self.path("source.chunks")),
            StoreConfig::PerChunk(self.path("source.store")),
        ]
    }

    pub async fn pack(&self, data: &[u8], store: &StoreConfig, config: PackConfig) -> PackOutcome {
        let packer = Packer::new(config).unwrap();
        archive::create(Cursor::new(data.to_vec()), &self.archive(), store, &packer, true)
            .await
            .unwrap()
    }

    pub async fn unpack(&self, output: &Path) -> cdar_engine::Result<UnpackStats> {
        archive::extract(&self.archive(), output, &unpacker(), None).await
    }
}
