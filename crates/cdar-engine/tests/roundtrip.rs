//! End-to-end archive tests: pack to every store placement and unpack again.

mod common;

use cdar_engine::archive::{self, encode_header, StoreConfig};
use cdar_engine::{
    new_cancel_pair, ArchiveError, ChunkerConfig, CompressionAlgorithm, PackConfig,
};
use common::{noise, pack_config, prose, unpacker, Workspace};
use std::collections::HashSet;

#[tokio::test]
async fn test_roundtrip_every_store_and_codec() {
    let inputs = [Vec::new(), b"tiny".to_vec(), prose(300_000, 1), noise(200_000, 2)];
    let codecs = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd { level: 3 },
        CompressionAlgorithm::Lzma { level: 1 },
    ];
    for data in &inputs {
        for codec in codecs {
            let ws = Workspace::new();
            for store in ws.store_configs() {
                let outcome = ws.pack(data, &store, pack_config(codec)).await;
                assert_eq!(outcome.dictionary.source_total_size, data.len() as u64);

                let output = ws.path("restored");
                let stats = ws.unpack(&output).await.unwrap();
                assert_eq!(stats.bytes_written, data.len() as u64);
                assert_eq!(&std::fs::read(&output).unwrap(), data, "{store:?} {codec}");
            }
        }
    }
}

#[tokio::test]
async fn test_default_parameters_roundtrip() {
    let ws = Workspace::new();
    let data = prose(1_500_000, 5);
    ws.pack(&data, &StoreConfig::Embedded, PackConfig::default()).await;
    let output = ws.path("out");
    ws.unpack(&output).await.unwrap();
    assert_eq!(std::fs::read(&output).unwrap(), data);
}

#[tokio::test]
async fn test_packing_is_deterministic() {
    let data = prose(400_000, 9);
    let first = Workspace::new();
    let second = Workspace::new();
    let a = first
        .pack(&data, &StoreConfig::Embedded, pack_config(CompressionAlgorithm::Lz4))
        .await;
    let b = second
        .pack(&data, &StoreConfig::Embedded, pack_config(CompressionAlgorithm::Lz4))
        .await;
    assert_eq!(a.dictionary.chunk_descriptors, b.dictionary.chunk_descriptors);
    assert_eq!(
        std::fs::read(first.archive()).unwrap(),
        std::fs::read(second.archive()).unwrap()
    );
}

#[tokio::test]
async fn test_identical_regions_stored_once() {
    let config = PackConfig {
        chunker: ChunkerConfig {
            filter_bits: 12,
            min_size: 4096,
            max_size: 4096,
            window_size: 16,
            hash_length: 32,
        },
        ..pack_config(CompressionAlgorithm::Zstd { level: 3 })
    };
    let region = noise(4096, 77);
    let data = [region.clone(), region].concat();

    let ws = Workspace::new();
    let store = StoreConfig::PerChunk(ws.path("chunks"));
    let outcome = ws.pack(&data, &store, config).await;
    let descriptors = &outcome.dictionary.chunk_descriptors;
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].source_offsets, vec![0, 4096]);
    assert_eq!(std::fs::read_dir(ws.path("chunks")).unwrap().count(), 1);

    let output = ws.path("out");
    let stats = ws.unpack(&output).await.unwrap();
    assert_eq!(stats.placements, 2);
    assert_eq!(std::fs::read(&output).unwrap(), data);
}

#[tokio::test]
async fn test_single_byte_edit_keeps_most_chunks() {
    let original = noise(1_000_000, 21);
    let mut edited = original.clone();
    edited[500_000] ^= 0x5a;

    let ws = Workspace::new();
    let config = pack_config(CompressionAlgorithm::None);
    let before = ws.pack(&original, &StoreConfig::Embedded, config.clone()).await;
    let after = ws.pack(&edited, &StoreConfig::Embedded, config).await;

    let old: HashSet<Vec<u8>> = before
        .dictionary
        .chunk_descriptors
        .iter()
        .map(|d| d.checksum.clone())
        .collect();
    let changed = after
        .dictionary
        .chunk_descriptors
        .iter()
        .filter(|d| !old.contains(&d.checksum))
        .count();
    assert!(before.dictionary.chunk_descriptors.len() > 50);
    assert!(changed <= 3, "{changed} chunks changed");
}

#[tokio::test]
async fn test_prefix_insert_resynchronizes() {
    let original = noise(600_000, 4);
    let shifted = [b"inserted prefix bytes".to_vec(), original.clone()].concat();
    let ws = Workspace::new();
    let config = pack_config(CompressionAlgorithm::None);
    let before = ws.pack(&original, &StoreConfig::Embedded, config.clone()).await;
    let after = ws.pack(&shifted, &StoreConfig::Embedded, config).await;

    let new: HashSet<Vec<u8>> = after
        .dictionary
        .chunk_descriptors
        .iter()
        .map(|d| d.checksum.clone())
        .collect();
    let total = before.dictionary.chunk_descriptors.len();
    let shared = before
        .dictionary
        .chunk_descriptors
        .iter()
        .filter(|d| new.contains(&d.checksum))
        .count();
    assert!(shared * 10 >= total * 9, "{shared} of {total} shared");
}

#[tokio::test]
async fn test_corrupt_chunk_fails_only_that_chunk() {
    let ws = Workspace::new();
    let data = prose(200_000, 13);
    let store = StoreConfig::PerChunk(ws.path("chunks"));
    let outcome = ws
        .pack(&data, &store, pack_config(CompressionAlgorithm::Zstd { level: 3 }))
        .await;
    let descriptors = &outcome.dictionary.chunk_descriptors;
    assert!(descriptors.len() > 4);
    let victim = descriptors
        .iter()
        .position(|d| d.compression.is_some())
        .unwrap();
    let victim_path = ws.path("chunks").join(descriptors[victim].checksum_hex());
    let mut stored = std::fs::read(&victim_path).unwrap();
    stored[0] ^= 0xff;
    std::fs::write(&victim_path, stored).unwrap();

    let output = ws.path("out");
    let result = ws.unpack(&output).await;
    assert!(matches!(result, Err(ArchiveError::Codec(_))));

    let restored = std::fs::read(&output).unwrap();
    assert_eq!(restored.len(), data.len());
    for (i, d) in descriptors.iter().enumerate() {
        if i == victim {
            continue;
        }
        for &offset in &d.source_offsets {
            let range = offset as usize..(offset + d.source_size) as usize;
            assert_eq!(restored[range.clone()], data[range]);
        }
    }
}

#[tokio::test]
async fn test_missing_chunk_file_is_store_not_found() {
    let ws = Workspace::new();
    let store = StoreConfig::PerChunk(ws.path("chunks"));
    let outcome = ws
        .pack(&prose(50_000, 3), &store, pack_config(CompressionAlgorithm::Lz4))
        .await;
    let gone = &outcome.dictionary.chunk_descriptors[0];
    std::fs::remove_file(ws.path("chunks").join(gone.checksum_hex())).unwrap();
    assert!(matches!(
        ws.unpack(&ws.path("out")).await,
        Err(ArchiveError::StoreNotFound { .. })
    ));
}

#[tokio::test]
async fn test_truncated_external_file_is_store_not_found() {
    let ws = Workspace::new();
    let store = StoreConfig::External(ws.path("source.chunks"));
    ws.pack(&noise(80_000, 8), &store, pack_config(CompressionAlgorithm::None))
        .await;
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(ws.path("source.chunks"))
        .unwrap();
    file.set_len(1000).unwrap();
    assert!(matches!(
        ws.unpack(&ws.path("out")).await,
        Err(ArchiveError::StoreNotFound { .. })
    ));
}

#[tokio::test]
async fn test_tampered_raw_chunk_fails_verification() {
    let ws = Workspace::new();
    let store = StoreConfig::External(ws.path("source.chunks"));
    let outcome = ws
        .pack(&noise(60_000, 31), &store, pack_config(CompressionAlgorithm::Zstd { level: 3 }))
        .await;
    let raw = &outcome.dictionary.chunk_descriptors[0];
    assert!(raw.compression.is_none());
    let mut blob = std::fs::read(ws.path("source.chunks")).unwrap();
    blob[raw.archive_offset as usize] ^= 0x01;
    std::fs::write(ws.path("source.chunks"), blob).unwrap();

    assert!(matches!(
        ws.unpack(&ws.path("out")).await,
        Err(ArchiveError::Verification { .. })
    ));
}

#[tokio::test]
async fn test_non_tiling_dictionary_rejected_before_output_exists() {
    let ws = Workspace::new();
    let outcome = ws
        .pack(&prose(40_000, 6), &StoreConfig::Embedded, pack_config(CompressionAlgorithm::Lz4))
        .await;
    let mut dictionary = outcome.dictionary;
    dictionary.source_total_size = 100;
    std::fs::write(ws.archive(), encode_header(&dictionary)).unwrap();

    let output = ws.path("out");
    assert!(matches!(
        ws.unpack(&output).await,
        Err(ArchiveError::DictionaryInvalid(_))
    ));
    assert!(!output.exists());
}

#[tokio::test]
async fn test_side_stores_move_with_archive() {
    let ws = Workspace::new();
    let data = prose(120_000, 17);
    let store = StoreConfig::PerChunk(ws.path("source.store"));
    ws.pack(&data, &store, pack_config(CompressionAlgorithm::Lz4)).await;

    let moved = ws.path("moved");
    std::fs::create_dir(&moved).unwrap();
    std::fs::rename(ws.archive(), moved.join("source.cdar")).unwrap();
    std::fs::rename(ws.path("source.store"), moved.join("source.store")).unwrap();

    let output = ws.path("out");
    archive::extract(&moved.join("source.cdar"), &output, &unpacker(), None)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&output).unwrap(), data);
}

#[tokio::test]
async fn test_location_override() {
    let ws = Workspace::new();
    let data = prose(90_000, 19);
    let store = StoreConfig::External(ws.path("source.chunks"));
    ws.pack(&data, &store, pack_config(CompressionAlgorithm::Zstd { level: 1 }))
        .await;
    std::fs::rename(ws.path("source.chunks"), ws.path("relocated.bin")).unwrap();

    let output = ws.path("out");
    assert!(ws.unpack(&output).await.is_err());
    archive::extract(&ws.archive(), &output, &unpacker(), Some(&ws.path("relocated.bin")))
        .await
        .unwrap();
    assert_eq!(std::fs::read(&output).unwrap(), data);
}

#[tokio::test]
async fn test_cancelled_unpack() {
    let ws = Workspace::new();
    ws.pack(&prose(64_000, 2), &StoreConfig::Embedded, pack_config(CompressionAlgorithm::Lz4))
        .await;
    let (token, handle) = new_cancel_pair();
    handle.cancel();
    let result = archive::extract(
        &ws.archive(),
        &ws.path("out"),
        &unpacker().with_cancel(token),
        None,
    )
    .await;
    assert!(matches!(result, Err(ArchiveError::Cancelled)));
}

#[tokio::test]
async fn test_info_summary_matches_pack_stats() {
    let ws = Workspace::new();
    let data = [prose(50_000, 1), prose(50_000, 1)].concat();
    let outcome = ws
        .pack(&data, &StoreConfig::Embedded, pack_config(CompressionAlgorithm::Zstd { level: 3 }))
        .await;
    let summary = archive::open(&ws.archive()).await.unwrap().summary();
    assert_eq!(summary.total_chunks, outcome.stats.chunks);
    assert_eq!(summary.unique_chunks, outcome.stats.unique_chunks);
    assert_eq!(summary.stored_bytes, outcome.stats.stored_bytes);
    assert_eq!(summary.source_total_size, 100_000);
    assert!(outcome.stats.deduplicated_chunks > 0);
}
