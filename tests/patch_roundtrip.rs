use std::fs;
use std::path::{Path, PathBuf};

use proptest::prelude::*;
use tempfile::{tempdir, TempDir};

use hexpatch::patch_format::{self, Serializer};
use hexpatch::util::sha256_bytes;
use hexpatch::{
    apply_patch, generate_patch, ApplyConfig, Applier, Compression, Delta, DeltaConfig,
    DeltaEngine, Error, Op, Optimizer, OptimizerConfig,
};

const BLOCK: usize = 64;

fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    path
}

fn test_config() -> DeltaConfig {
    DeltaConfig {
        block_size: BLOCK,
        window_size: 8,
        ..DeltaConfig::default()
    }
}

fn engine() -> DeltaEngine {
    DeltaEngine::new(test_config()).unwrap()
}

/// generate → optimize → serialize → deserialize → apply, returning the
/// reconstructed bytes.
fn round_trip(dir: &TempDir, source: &[u8], target: &[u8]) -> Vec<u8> {
    let src = write_file(dir, "source.bin", source);
    let tgt = write_file(dir, "target.bin", target);
    let patch = dir.path().join("delta.hexpatch");

    generate_patch(&src, &tgt, &patch, &test_config(), Compression::Gzip).unwrap();

    let out = dir.path().join("restored.bin");
    apply_patch(&src, &patch, &out, &ApplyConfig::default()).unwrap();
    fs::read(&out).unwrap()
}

fn coverage_is_exact(delta: &Delta) {
    let mut ranges: Vec<(u64, u64)> = delta
        .ops
        .iter()
        .filter(|op| !matches!(op, Op::Delete { .. }))
        .map(|op| (op.offset(), op.offset() + u64::from(op.len())))
        .collect();
    ranges.sort();
    let mut cursor = 0u64;
    for (start, end) in ranges {
        assert_eq!(start, cursor, "coverage gap or overlap at {start}");
        cursor = end;
    }
    assert_eq!(cursor, delta.target_size);
}

#[test]
fn identity_patch_is_all_copies() {
    let dir = tempdir().unwrap();
    let data: Vec<u8> = (0..BLOCK as u32 * 3 + 11).map(|i| (i % 256) as u8).collect();

    let src = write_file(&dir, "source.bin", &data);
    let tgt = write_file(&dir, "target.bin", &data);
    let delta = engine().generate(&src, &tgt).unwrap();

    assert!(delta.ops.iter().all(|op| matches!(op, Op::Copy { .. })));
    assert_eq!(delta.copy_len(), data.len() as u64);
    assert_eq!(delta.insert_len(), 0);
    coverage_is_exact(&delta);

    assert_eq!(round_trip(&dir, &data, &data), data);
}

#[test]
fn pure_insert_from_empty_source() {
    let dir = tempdir().unwrap();
    let src = write_file(&dir, "source.bin", b"");
    let tgt = write_file(&dir, "target.bin", b"abc");

    let delta = engine().generate(&src, &tgt).unwrap();
    assert_eq!(delta.ops.len(), 1);
    match &delta.ops[0] {
        Op::Insert { offset, data } => {
            assert_eq!(*offset, 0);
            assert_eq!(data, b"abc");
        }
        other => panic!("expected a single insert, got {other:?}"),
    }
    assert_eq!(delta.checksum, sha256_bytes(b"abc"));

    assert_eq!(round_trip(&dir, b"", b"abc"), b"abc");
}

#[test]
fn pure_delete_to_empty_target() {
    let dir = tempdir().unwrap();
    let src = write_file(&dir, "source.bin", b"abcdefgh");
    let tgt = write_file(&dir, "target.bin", b"");

    let delta = engine().generate(&src, &tgt).unwrap();
    assert!(delta.ops.is_empty());
    assert_eq!(delta.target_size, 0);
    assert_eq!(delta.checksum, sha256_bytes(b""));

    assert_eq!(round_trip(&dir, b"abcdefgh", b""), b"");
}

#[test]
fn preserved_prefix_becomes_copy_then_insert() {
    let dir = tempdir().unwrap();
    let mut source = vec![b'A'; BLOCK];
    source.extend_from_slice(&vec![b'B'; BLOCK]);
    let mut target = vec![b'A'; BLOCK];
    target.extend_from_slice(&vec![b'C'; BLOCK]);

    let src = write_file(&dir, "source.bin", &source);
    let tgt = write_file(&dir, "target.bin", &target);
    let delta = engine().generate(&src, &tgt).unwrap();

    assert_eq!(delta.ops.len(), 2);
    assert_eq!(
        delta.ops[0],
        Op::Copy {
            offset: 0,
            src_offset: 0,
            len: BLOCK as u32
        }
    );
    match &delta.ops[1] {
        Op::Insert { offset, data } => {
            assert_eq!(*offset, BLOCK as u64);
            assert_eq!(data, &vec![b'C'; BLOCK]);
        }
        other => panic!("expected insert, got {other:?}"),
    }

    assert_eq!(round_trip(&dir, &source, &target), target);
}

#[test]
fn colliding_block_is_inserted_not_copied() {
    // fast_hash([0,0,0,0]) == fast_hash([58,234,70,157]); CRC32 must veto the
    // bogus match and the differing block must travel as a literal.
    let dir = tempdir().unwrap();
    let source = [0u8, 0, 0, 0];
    let target = [58u8, 234, 70, 157];

    let src = write_file(&dir, "source.bin", &source);
    let tgt = write_file(&dir, "target.bin", &target);
    let delta = engine().generate(&src, &tgt).unwrap();

    assert_eq!(delta.ops.len(), 1);
    assert!(matches!(delta.ops[0], Op::Insert { .. }));

    assert_eq!(round_trip(&dir, &source, &target), target);
}

#[test]
fn shifted_content_still_round_trips() {
    // A non-block-multiple shift defeats the block-aligned matcher; the
    // result is a bigger patch, never a wrong one.
    let dir = tempdir().unwrap();
    let source: Vec<u8> = (0..BLOCK as u32 * 8).map(|i| (i % 251) as u8).collect();
    let mut target = vec![0xEE; 7];
    target.extend_from_slice(&source);

    assert_eq!(round_trip(&dir, &source, &target), target);
}

#[test]
fn generated_patches_are_deterministic() {
    let dir = tempdir().unwrap();
    let source: Vec<u8> = (0..BLOCK as u32 * 5).map(|i| (i % 241) as u8).collect();
    let mut target = source.clone();
    target[BLOCK + 3] ^= 0x42;
    target.extend_from_slice(b"appended");

    let src = write_file(&dir, "source.bin", &source);
    let tgt = write_file(&dir, "target.bin", &target);

    let make = |out: &Path| {
        generate_patch(&src, &tgt, out, &test_config(), Compression::Gzip).unwrap();
        let mut bytes = fs::read(out).unwrap();
        // the creation timestamp is the only run-dependent field
        bytes[8..16].fill(0);
        bytes
    };

    let first = make(&dir.path().join("a.hexpatch"));
    let second = make(&dir.path().join("b.hexpatch"));
    assert_eq!(first, second);
}

#[test]
fn optimizer_is_sound_under_apply() {
    let dir = tempdir().unwrap();
    let source: Vec<u8> = (0..BLOCK as u32 * 6).map(|i| (i / 3 % 256) as u8).collect();
    let mut target = source.clone();
    target[2 * BLOCK] ^= 1;
    target.truncate(5 * BLOCK + 17);

    let src = write_file(&dir, "source.bin", &source);
    let tgt = write_file(&dir, "target.bin", &target);

    let e = engine();
    let sig = e.generate_signature(&src).unwrap();
    let raw = e.generate_with_signature(&sig, &tgt).unwrap();
    let optimized = Optimizer::new(OptimizerConfig::default()).optimize(raw.clone());
    assert!(optimized.ops.len() <= raw.ops.len());
    coverage_is_exact(&optimized);

    let apply_delta = |delta: &Delta, name: &str| {
        let patch = dir.path().join(name);
        Serializer::new(Compression::None)
            .serialize_to_path(delta, sig.checksum, &patch)
            .unwrap();
        let out = dir.path().join(format!("{name}.out"));
        apply_patch(&src, &patch, &out, &ApplyConfig::default()).unwrap();
        fs::read(&out).unwrap()
    };

    let from_raw = apply_delta(&raw, "raw.hexpatch");
    let from_optimized = apply_delta(&optimized, "optimized.hexpatch");
    assert_eq!(from_raw, from_optimized);
    assert_eq!(from_raw, target);
}

#[test]
fn apply_aborts_on_mutated_source() {
    let dir = tempdir().unwrap();
    let source: Vec<u8> = vec![0x10; 4 * BLOCK];
    let target: Vec<u8> = vec![0x20; 4 * BLOCK];

    let src = write_file(&dir, "source.bin", &source);
    let tgt = write_file(&dir, "target.bin", &target);
    let patch = dir.path().join("delta.hexpatch");
    generate_patch(&src, &tgt, &patch, &test_config(), Compression::Gzip).unwrap();

    let mut mutated = source.clone();
    mutated[100] ^= 0x01;
    fs::write(&src, &mutated).unwrap();

    let out = dir.path().join("restored.bin");
    fs::write(&out, b"untouchable").unwrap();

    let err = apply_patch(&src, &patch, &out, &ApplyConfig::default()).unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }));
    assert_eq!(fs::read(&out).unwrap(), b"untouchable");
}

#[test]
fn unchecked_source_digest_skips_preverify() {
    let dir = tempdir().unwrap();
    let src = write_file(&dir, "source.bin", b"");
    let tgt = write_file(&dir, "target.bin", b"literal payload");

    let e = engine();
    let delta = e.generate(&src, &tgt).unwrap();
    let patch_path = dir.path().join("delta.hexpatch");
    Serializer::new(Compression::None)
        .serialize_to_path(&delta, hexpatch::util::ZERO_DIGEST, &patch_path)
        .unwrap();

    // mutate the source; the all-zero recorded digest means nobody checks it
    fs::write(&src, b"different now").unwrap();

    let out = dir.path().join("restored.bin");
    apply_patch(&src, &patch_path, &out, &ApplyConfig::default()).unwrap();
    assert_eq!(fs::read(&out).unwrap(), b"literal payload");
}

#[test]
fn every_codec_round_trips_the_same_delta() {
    let dir = tempdir().unwrap();
    let source: Vec<u8> = (0..BLOCK as u32 * 4).map(|i| (i % 199) as u8).collect();
    let mut target = source.clone();
    target.extend_from_slice(&vec![0xAB; 150]);

    let src = write_file(&dir, "source.bin", &source);
    let tgt = write_file(&dir, "target.bin", &target);

    let e = engine();
    let sig = e.generate_signature(&src).unwrap();
    let delta = e.generate_with_signature(&sig, &tgt).unwrap();

    for codec in [
        Compression::None,
        Compression::Gzip,
        Compression::Lz4,
        Compression::Zstd,
    ] {
        let patch = dir.path().join(format!("delta.{}.hexpatch", codec.name()));
        Serializer::new(codec)
            .serialize_to_path(&delta, sig.checksum, &patch)
            .unwrap();

        let header = patch_format::read_header(&patch).unwrap();
        assert_eq!(header.compression, codec);

        let out = dir.path().join(format!("restored.{}", codec.name()));
        apply_patch(&src, &patch, &out, &ApplyConfig::default()).unwrap();
        assert_eq!(fs::read(&out).unwrap(), target, "codec {}", codec.name());
    }
}

#[test]
fn truncated_patch_file_is_rejected() {
    let dir = tempdir().unwrap();
    let src = write_file(&dir, "source.bin", &vec![1u8; 256]);
    let tgt = write_file(&dir, "target.bin", &vec![2u8; 256]);
    let patch = dir.path().join("delta.hexpatch");
    generate_patch(&src, &tgt, &patch, &test_config(), Compression::None).unwrap();

    let bytes = fs::read(&patch).unwrap();
    fs::write(&patch, &bytes[..bytes.len() / 2]).unwrap();

    let out = dir.path().join("restored.bin");
    let err = apply_patch(&src, &patch, &out, &ApplyConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::PatchCorrupted { .. } | Error::CorruptedData { .. }
    ));
    assert!(!out.exists());
}

#[test]
fn delete_records_are_ignored_by_the_applier() {
    let dir = tempdir().unwrap();
    let source = vec![0x77u8; BLOCK];
    let src = write_file(&dir, "source.bin", &source);

    // a hand-built delta with a DELETE the optimizer chose to keep
    let delta = Delta {
        source_size: BLOCK as u64,
        target_size: BLOCK as u64,
        ops: vec![
            Op::Delete {
                offset: 0,
                len: 16,
            },
            Op::Copy {
                offset: 0,
                src_offset: 0,
                len: BLOCK as u32,
            },
        ],
        checksum: sha256_bytes(&source),
    };

    let patch = dir.path().join("delta.hexpatch");
    Serializer::new(Compression::None)
        .serialize_to_path(&delta, hexpatch::util::ZERO_DIGEST, &patch)
        .unwrap();

    let out = dir.path().join("restored.bin");
    let report = apply_patch(&src, &patch, &out, &ApplyConfig::default()).unwrap();
    assert_eq!(report.operations_applied, 2);
    assert_eq!(fs::read(&out).unwrap(), source);
}

#[test]
fn applier_uses_signature_checksum_for_source_identity() {
    // Applying a self-patch reproduces the source exactly.
    let dir = tempdir().unwrap();
    let data: Vec<u8> = (0..BLOCK as u32 * 2).map(|i| (i % 256) as u8).collect();
    assert_eq!(round_trip(&dir, &data, &data), data);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_pairs_round_trip(
        source in proptest::collection::vec(any::<u8>(), 0..2048),
        target in proptest::collection::vec(any::<u8>(), 0..2048),
    ) {
        let dir = tempdir().unwrap();
        let restored = round_trip(&dir, &source, &target);
        prop_assert_eq!(restored, target);
    }

    #[test]
    fn random_edits_round_trip(
        base in proptest::collection::vec(any::<u8>(), 256..1024),
        flip in 0usize..256,
        tail in proptest::collection::vec(any::<u8>(), 0..128),
    ) {
        let dir = tempdir().unwrap();
        let mut target = base.clone();
        target[flip % base.len()] ^= 0xFF;
        target.extend_from_slice(&tail);

        let restored = round_trip(&dir, &base, &target);
        prop_assert_eq!(restored, target);
    }
}

// Applier reuse across files: one Applier, several patches.
#[test]
fn applier_is_reusable() {
    let dir = tempdir().unwrap();
    let applier = Applier::new(ApplyConfig::default()).unwrap();

    for i in 0..3u8 {
        let source = vec![i; 300];
        let target = vec![i ^ 0xFF; 300];
        let src = write_file(&dir, &format!("src{i}.bin"), &source);
        let tgt = write_file(&dir, &format!("tgt{i}.bin"), &target);
        let patch = dir.path().join(format!("p{i}.hexpatch"));
        generate_patch(&src, &tgt, &patch, &test_config(), Compression::Lz4).unwrap();

        let out = dir.path().join(format!("out{i}.bin"));
        applier.apply(&src, &patch, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), target);
    }
}
