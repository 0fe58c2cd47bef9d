use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::ApplyConfig;
use crate::error::{Error, Result};
use crate::integrity::{BackupManager, DEFAULT_MAX_BACKUPS};
use crate::patch_format::{
    self, PatchFile, OP_TYPE_COPY, OP_TYPE_DELETE, OP_TYPE_INSERT,
};
use crate::util::sha256_file;

const OP: &str = "apply patch";

/// What an apply run did.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyReport {
    pub operations_applied: usize,
    pub bytes_written: u64,
}

/// Executes a patch against a source file into a temp file, verifies digests
/// on both sides, and atomically publishes the result.
///
/// Any failure before the final rename removes the temp file and leaves the
/// target path untouched.
pub struct Applier {
    config: ApplyConfig,
}

impl Applier {
    pub fn new(config: ApplyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Apply the patch at `patch_path` to `source`, producing `target`.
    pub fn apply(&self, source: &Path, patch_path: &Path, target: &Path) -> Result<ApplyReport> {
        let patch = patch_format::read_patch(patch_path)?;
        self.apply_patch(source, &patch, target)
    }

    /// Apply an in-memory patch container (embedded tree-patch entries).
    pub fn apply_bytes(&self, source: &Path, patch: &[u8], target: &Path) -> Result<ApplyReport> {
        let patch = patch_format::deserialize_bytes(patch)?;
        self.apply_patch(source, &patch, target)
    }

    /// Apply an already-deserialized patch.
    pub fn apply_patch(
        &self,
        source: &Path,
        patch: &PatchFile,
        target: &Path,
    ) -> Result<ApplyReport> {
        // An all-zero recorded digest means the patch was produced without
        // recording it; skip the pre-check in that case.
        if patch.header.source_checked() {
            let actual = sha256_file(OP, source)?;
            if actual != patch.header.source_checksum {
                return Err(Error::ChecksumMismatch {
                    op: OP,
                    path: Some(source.to_path_buf()),
                });
            }
        }

        // The temp file must live in the target's directory so the final
        // rename stays on one filesystem.
        let target_dir = target.parent().filter(|p| !p.as_os_str().is_empty());
        let mut temp = NamedTempFile::new_in(target_dir.unwrap_or_else(|| Path::new(".")))
            .map_err(|e| Error::write(OP, target, e))?;

        let temp_path = temp.path().to_path_buf();
        let report = self.execute_operations(source, patch, temp.as_file_mut(), &temp_path)?;
        temp.as_file_mut()
            .flush()
            .map_err(|e| Error::write(OP, temp.path(), e))?;

        if self.config.verify && patch.header.target_checked() {
            let actual = sha256_file(OP, temp.path())?;
            if actual != patch.header.target_checksum {
                return Err(Error::ChecksumMismatch {
                    op: OP,
                    path: Some(target.to_path_buf()),
                });
            }
        }

        if self.config.backup && target.exists() {
            let backup_dir = self
                .config
                .backup_dir
                .clone()
                .unwrap_or_else(|| default_backup_dir(target));
            BackupManager::new(backup_dir, DEFAULT_MAX_BACKUPS).create_backup(target)?;
        }

        temp.persist(target)
            .map_err(|e| Error::write(OP, target, e.error))?;

        debug!(
            target = %target.display(),
            ops = report.operations_applied,
            bytes = report.bytes_written,
            "patch applied"
        );
        Ok(report)
    }

    /// Run the operation table in order against a fresh writer. The writer is
    /// seeked to each operation's target offset before dispatch.
    fn execute_operations(
        &self,
        source: &Path,
        patch: &PatchFile,
        out: &mut File,
        out_path: &Path,
    ) -> Result<ApplyReport> {
        // The source is only opened when the stream actually copies from it,
        // so insert-only patches apply against a missing source.
        let mut source_file: Option<File> = if patch
            .records
            .iter()
            .any(|r| r.op_type == OP_TYPE_COPY)
        {
            Some(File::open(source).map_err(|e| Error::read(OP, source, e))?)
        } else {
            None
        };
        let mut buf = vec![0u8; self.config.buffer_size];
        let mut report = ApplyReport::default();

        for record in &patch.records {
            match record.op_type {
                OP_TYPE_COPY => {
                    out.seek(SeekFrom::Start(record.offset))
                        .map_err(|e| Error::write(OP, out_path, e))?;

                    let reader = source_file.as_mut().ok_or_else(|| Error::InvalidOperation {
                        op: OP,
                        reason: "copy operation without an open source".into(),
                    })?;
                    reader
                        .seek(SeekFrom::Start(record.src_offset))
                        .map_err(|e| Error::read(OP, source, e))?;

                    let mut remaining = record.len as usize;
                    while remaining > 0 {
                        let take = remaining.min(buf.len());
                        let n = reader
                            .read(&mut buf[..take])
                            .map_err(|e| Error::read(OP, source, e))?;
                        if n == 0 {
                            return Err(Error::InvalidOperation {
                                op: OP,
                                reason: format!(
                                    "copy source range {}..{} past end of source",
                                    record.src_offset,
                                    record.src_offset + u64::from(record.len)
                                ),
                            });
                        }
                        out.write_all(&buf[..n])
                            .map_err(|e| Error::write(OP, out_path, e))?;
                        remaining -= n;
                        report.bytes_written += n as u64;
                    }
                }
                OP_TYPE_INSERT => {
                    out.seek(SeekFrom::Start(record.offset))
                        .map_err(|e| Error::write(OP, out_path, e))?;
                    let data = patch.insert_data(record)?;
                    out.write_all(data)
                        .map_err(|e| Error::write(OP, out_path, e))?;
                    report.bytes_written += data.len() as u64;
                }
                OP_TYPE_DELETE => {
                    // Deleted regions are never written; nothing to do.
                }
                other => {
                    return Err(Error::InvalidOperation {
                        op: OP,
                        reason: format!("unknown operation type {other}"),
                    });
                }
            }
            report.operations_applied += 1;
        }

        Ok(report)
    }
}

fn default_backup_dir(target: &Path) -> std::path::PathBuf {
    target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(".hexpatch_backups")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::Compression;
    use crate::config::DeltaConfig;
    use crate::delta::DeltaEngine;
    use crate::patch_format::Serializer;
    use std::fs;
    use tempfile::tempdir;

    fn engine() -> DeltaEngine {
        DeltaEngine::new(DeltaConfig {
            block_size: 64,
            window_size: 8,
            ..DeltaConfig::default()
        })
        .unwrap()
    }

    fn make_patch(dir: &Path, source: &[u8], target: &[u8]) -> std::path::PathBuf {
        let src = dir.join("src.bin");
        let tgt = dir.join("new.bin");
        fs::write(&src, source).unwrap();
        fs::write(&tgt, target).unwrap();

        let e = engine();
        let sig = e.generate_signature(&src).unwrap();
        let delta = e.generate_with_signature(&sig, &tgt).unwrap();

        let patch = dir.join("out.hexpatch");
        Serializer::new(Compression::Gzip)
            .serialize_to_path(&delta, sig.checksum, &patch)
            .unwrap();
        patch
    }

    #[test]
    fn reconstructs_target_bytes() {
        let dir = tempdir().unwrap();
        let source: Vec<u8> = (0..500u16).flat_map(|i| i.to_le_bytes()).collect();
        let mut target = source.clone();
        target.extend_from_slice(b"tail of new data");
        target[10] ^= 0xFF;

        let patch = make_patch(dir.path(), &source, &target);
        let out = dir.path().join("restored.bin");
        let applier = Applier::new(ApplyConfig::default()).unwrap();
        applier.apply(&dir.path().join("src.bin"), &patch, &out).unwrap();

        assert_eq!(fs::read(&out).unwrap(), target);
    }

    #[test]
    fn mutated_source_fails_preverify_and_leaves_target_alone() {
        let dir = tempdir().unwrap();
        let source = vec![0x11u8; 500];
        let target = vec![0x22u8; 500];
        let patch = make_patch(dir.path(), &source, &target);

        // corrupt one byte of the source after the patch was produced
        let src = dir.path().join("src.bin");
        let mut mutated = source.clone();
        mutated[250] ^= 0x01;
        fs::write(&src, &mutated).unwrap();

        let out = dir.path().join("restored.bin");
        fs::write(&out, b"precious").unwrap();

        let err = Applier::new(ApplyConfig::default())
            .unwrap()
            .apply(&src, &patch, &out)
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(fs::read(&out).unwrap(), b"precious");
    }

    #[test]
    fn tampered_literal_fails_postverify() {
        let dir = tempdir().unwrap();
        let source = b"".to_vec();
        let target = vec![0x33u8; 128];

        let src = dir.path().join("src.bin");
        let tgt = dir.path().join("new.bin");
        fs::write(&src, &source).unwrap();
        fs::write(&tgt, &target).unwrap();

        let e = engine();
        let sig = e.generate_signature(&src).unwrap();
        let delta = e.generate_with_signature(&sig, &tgt).unwrap();
        let mut bytes = Serializer::new(Compression::None)
            .serialize_to_vec(&delta, sig.checksum)
            .unwrap();
        // flip a literal byte past the header and single op record
        let literal_start = bytes.len() - 128;
        bytes[literal_start] ^= 0xFF;

        let out = dir.path().join("restored.bin");
        let err = Applier::new(ApplyConfig::default())
            .unwrap()
            .apply_bytes(&src, &bytes, &out)
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn backup_is_taken_before_replacement() {
        let dir = tempdir().unwrap();
        let source = vec![0x44u8; 300];
        let target = vec![0x55u8; 300];
        let patch = make_patch(dir.path(), &source, &target);

        let out = dir.path().join("restored.bin");
        fs::write(&out, b"previous contents").unwrap();

        let backup_dir = dir.path().join("backups");
        let cfg = ApplyConfig {
            backup: true,
            backup_dir: Some(backup_dir.clone()),
            ..ApplyConfig::default()
        };
        Applier::new(cfg)
            .unwrap()
            .apply(&dir.path().join("src.bin"), &patch, &out)
            .unwrap();

        assert_eq!(fs::read(&out).unwrap(), target);
        let backups: Vec<_> = fs::read_dir(&backup_dir).unwrap().collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn copy_past_source_end_is_rejected() {
        let dir = tempdir().unwrap();
        let source = vec![0x66u8; 64];
        let target = source.clone();
        let patch_path = make_patch(dir.path(), &source, &target);

        // shrink the source after patch creation; disable pre-verify to reach
        // the copy bounds check
        fs::write(dir.path().join("src.bin"), &source[..32]).unwrap();
        let mut patch = patch_format::read_patch(&patch_path).unwrap();
        patch.header.source_checksum = crate::util::ZERO_DIGEST;

        let out = dir.path().join("restored.bin");
        let err = Applier::new(ApplyConfig {
            verify: false,
            ..ApplyConfig::default()
        })
        .unwrap()
        .apply_patch(&dir.path().join("src.bin"), &patch, &out)
        .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation { .. }));
        assert!(!out.exists());
    }
}
