use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{Error, Result};
use crate::util::read_block;

/// Default verification block size (64 KiB); independent of the delta block
/// size.
pub const DEFAULT_CHECK_BLOCK_SIZE: usize = 64 * 1024;
/// Default number of backups retained per basename.
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Strong and fast checksums for one block of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChecksum {
    pub offset: u64,
    pub len: u32,
    pub sha256: [u8; 32],
    pub crc32: u32,
}

/// Block-level integrity map over a file: per-block SHA-256 plus CRC32,
/// generated up front and consulted during verification.
pub struct BlockChecker {
    block_size: usize,
    enable_sha256: bool,
    enable_crc32: bool,
    checksums: HashMap<u64, BlockChecksum>,
}

impl BlockChecker {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            enable_sha256: true,
            enable_crc32: true,
            checksums: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Populate the offset → checksum map from `path`, replacing any previous
    /// contents.
    pub fn generate(&mut self, path: &Path) -> Result<()> {
        const OP: &str = "generate block checksums";

        let file = File::open(path).map_err(|e| Error::read(OP, path, e))?;
        let mut reader = BufReader::with_capacity(256 * 1024, file);

        self.checksums.clear();
        let mut buf = vec![0u8; self.block_size];
        let mut offset = 0u64;

        loop {
            let n = read_block(&mut reader, &mut buf).map_err(|e| Error::read(OP, path, e))?;
            if n == 0 {
                break;
            }
            let block = &buf[..n];
            self.checksums.insert(
                offset,
                BlockChecksum {
                    offset,
                    len: n as u32,
                    sha256: if self.enable_sha256 {
                        Sha256::digest(block).into()
                    } else {
                        [0u8; 32]
                    },
                    crc32: if self.enable_crc32 {
                        crc32fast::hash(block)
                    } else {
                        0
                    },
                },
            );
            offset += n as u64;
        }
        Ok(())
    }

    /// Check one block against the precomputed map. Length is compared first,
    /// then CRC32, then the strong digest.
    pub fn verify_block(&self, offset: u64, data: &[u8]) -> Result<()> {
        const OP: &str = "verify block";

        let expected = self
            .checksums
            .get(&offset)
            .ok_or_else(|| Error::corrupted(OP, format!("no checksum for offset {offset}")))?;

        if data.len() != expected.len as usize {
            return Err(Error::corrupted(
                OP,
                format!(
                    "block at {offset}: length {} != expected {}",
                    data.len(),
                    expected.len
                ),
            ));
        }
        if self.enable_crc32 && crc32fast::hash(data) != expected.crc32 {
            return Err(Error::ChecksumMismatch { op: OP, path: None });
        }
        if self.enable_sha256 {
            let actual: [u8; 32] = Sha256::digest(data).into();
            if actual != expected.sha256 {
                return Err(Error::ChecksumMismatch { op: OP, path: None });
            }
        }
        Ok(())
    }

    /// Stream `path` block by block against the map.
    pub fn verify_file(&self, path: &Path) -> Result<()> {
        const OP: &str = "verify file";

        let file = File::open(path).map_err(|e| Error::read(OP, path, e))?;
        let mut reader = BufReader::with_capacity(256 * 1024, file);
        let mut buf = vec![0u8; self.block_size];
        let mut offset = 0u64;
        let mut seen = 0usize;

        loop {
            let n = read_block(&mut reader, &mut buf).map_err(|e| Error::read(OP, path, e))?;
            if n == 0 {
                break;
            }
            self.verify_block(offset, &buf[..n]).map_err(|e| match e {
                Error::ChecksumMismatch { op, .. } => Error::ChecksumMismatch {
                    op,
                    path: Some(path.to_path_buf()),
                },
                other => other,
            })?;
            offset += n as u64;
            seen += 1;
        }

        if seen != self.checksums.len() {
            return Err(Error::corrupted(
                OP,
                format!("{} blocks seen, {} expected", seen, self.checksums.len()),
            ));
        }
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        self.checksums.len()
    }
}

/// Write adapter that verifies each block against a [`BlockChecker`] before
/// forwarding it downstream. The first mismatch is sticky; writes after an
/// error are rejected.
pub struct StreamVerifier<'a, W: Write> {
    checker: &'a BlockChecker,
    inner: W,
    buffer: Vec<u8>,
    offset: u64,
    poisoned: bool,
}

impl<'a, W: Write> StreamVerifier<'a, W> {
    pub fn new(checker: &'a BlockChecker, inner: W) -> Self {
        Self {
            checker,
            inner,
            buffer: Vec::with_capacity(checker.block_size()),
            offset: 0,
            poisoned: false,
        }
    }

    fn verify_and_forward(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.checker.verify_block(self.offset, &self.buffer) {
            self.poisoned = true;
            return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
        }
        self.inner.write_all(&self.buffer)?;
        self.offset += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Verify and flush any buffered tail, returning the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.verify_and_forward()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for StreamVerifier<'_, W> {
    fn write(&mut self, mut data: &[u8]) -> io::Result<usize> {
        if self.poisoned {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stream verifier poisoned by earlier mismatch",
            ));
        }
        let total = data.len();
        while !data.is_empty() {
            let room = self.checker.block_size() - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == self.checker.block_size() {
                self.verify_and_forward()?;
            }
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.verify_and_forward()?;
        self.inner.flush()
    }
}

const BACKUP_STAMP: &[FormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");

/// Snapshots files into a backup directory before they are replaced, keeping
/// the N newest backups per basename.
pub struct BackupManager {
    backup_dir: PathBuf,
    max_backups: usize,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            max_backups: max_backups.max(1),
        }
    }

    /// Copy `path` to `<backup_dir>/<basename>.<UTC-stamp>.backup`, then prune
    /// backups of the same basename beyond the retention limit.
    pub fn create_backup(&self, path: &Path) -> Result<PathBuf> {
        const OP: &str = "create backup";

        fs::create_dir_all(&self.backup_dir)
            .map_err(|e| Error::write(OP, &self.backup_dir, e))?;

        let basename = file_name(path, OP)?;
        let stamp = OffsetDateTime::now_utc()
            .format(BACKUP_STAMP)
            .unwrap_or_else(|_| "00000000_000000".into());

        let mut backup_path = self.backup_dir.join(format!("{basename}.{stamp}.backup"));
        let mut n = 1;
        while backup_path.exists() {
            backup_path = self
                .backup_dir
                .join(format!("{basename}.{stamp}_{n}.backup"));
            n += 1;
        }

        fs::copy(path, &backup_path).map_err(|e| Error::write(OP, &backup_path, e))?;
        debug!(from = %path.display(), to = %backup_path.display(), "backup created");

        self.prune(&basename)?;
        Ok(backup_path)
    }

    /// Restore `dest` from `backup`, re-checking the backup's block digests
    /// before overwriting anything.
    pub fn restore(&self, backup: &Path, dest: &Path) -> Result<()> {
        const OP: &str = "restore backup";

        if !backup.exists() {
            return Err(Error::FileNotFound {
                op: OP,
                path: backup.to_path_buf(),
            });
        }

        let mut checker = BlockChecker::new(DEFAULT_CHECK_BLOCK_SIZE);
        checker.generate(backup)?;
        checker.verify_file(backup)?;

        fs::copy(backup, dest).map_err(|e| Error::write(OP, dest, e))?;
        Ok(())
    }

    /// Most recent backup of `basename`, by modification time.
    pub fn latest_backup(&self, basename: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .backups_of(basename)?
            .into_iter()
            .next()
            .map(|(path, _)| path))
    }

    fn prune(&self, basename: &str) -> Result<()> {
        const OP: &str = "prune backups";

        for (path, _) in self.backups_of(basename)?.into_iter().skip(self.max_backups) {
            fs::remove_file(&path).map_err(|e| Error::write(OP, &path, e))?;
        }
        Ok(())
    }

    /// Backups of `basename`, newest first.
    fn backups_of(&self, basename: &str) -> Result<Vec<(PathBuf, std::time::SystemTime)>> {
        const OP: &str = "list backups";

        let prefix = format!("{basename}.");
        let mut found = Vec::new();

        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::read(OP, &self.backup_dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| Error::read(OP, &self.backup_dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".backup") {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::UNIX_EPOCH);
                found.push((entry.path(), modified));
            }
        }

        found.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(found)
    }
}

fn file_name(path: &Path, op: &'static str) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::InvalidOperation {
            op,
            reason: format!("path {} has no basename", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn generate_and_verify_round_trip() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "data.bin", &vec![0x5Au8; 200_000]);

        let mut checker = BlockChecker::new(DEFAULT_CHECK_BLOCK_SIZE);
        checker.generate(&path).unwrap();
        assert_eq!(checker.block_count(), 4); // 3 full 64 KiB blocks + tail
        checker.verify_file(&path).unwrap();
    }

    #[test]
    fn verify_detects_flipped_byte() {
        let dir = tempdir().unwrap();
        let mut data = vec![0x5Au8; 100_000];
        let path = write_file(dir.path(), "data.bin", &data);

        let mut checker = BlockChecker::new(DEFAULT_CHECK_BLOCK_SIZE);
        checker.generate(&path).unwrap();

        data[70_000] ^= 0x01;
        fs::write(&path, &data).unwrap();
        assert!(matches!(
            checker.verify_file(&path),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn verify_block_rejects_wrong_length() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "data.bin", b"0123456789");

        let mut checker = BlockChecker::new(4);
        checker.generate(&path).unwrap();
        assert!(checker.verify_block(0, b"0123").is_ok());
        assert!(checker.verify_block(0, b"012").is_err());
    }

    #[test]
    fn stream_verifier_forwards_good_data() {
        let dir = tempdir().unwrap();
        let data = vec![7u8; 10_000];
        let path = write_file(dir.path(), "data.bin", &data);

        let mut checker = BlockChecker::new(4096);
        checker.generate(&path).unwrap();

        let mut verifier = StreamVerifier::new(&checker, Vec::new());
        verifier.write_all(&data).unwrap();
        let out = verifier.finish().unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn stream_verifier_stops_on_first_mismatch() {
        let dir = tempdir().unwrap();
        let data = vec![7u8; 10_000];
        let path = write_file(dir.path(), "data.bin", &data);

        let mut checker = BlockChecker::new(4096);
        checker.generate(&path).unwrap();

        let mut bad = data.clone();
        bad[0] = 8;
        let mut verifier = StreamVerifier::new(&checker, Vec::new());
        assert!(verifier.write_all(&bad).is_err());
        assert!(verifier.write_all(&data[..1]).is_err()); // poisoned
    }

    #[test]
    fn backup_create_and_restore() {
        let dir = tempdir().unwrap();
        let target = write_file(dir.path(), "app.cfg", b"version = 1");
        let manager = BackupManager::new(dir.path().join("backups"), 5);

        let backup = manager.create_backup(&target).unwrap();
        assert!(backup.exists());

        fs::write(&target, b"version = 2").unwrap();
        manager.restore(&backup, &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"version = 1");
    }

    #[test]
    fn retention_keeps_newest() {
        let dir = tempdir().unwrap();
        let target = write_file(dir.path(), "app.cfg", b"x");
        let manager = BackupManager::new(dir.path().join("backups"), 2);

        for i in 0..4u8 {
            fs::write(&target, [i]).unwrap();
            manager.create_backup(&target).unwrap();
        }

        let remaining = manager.backups_of("app.cfg").unwrap();
        assert_eq!(remaining.len(), 2);
        let latest = manager.latest_backup("app.cfg").unwrap().unwrap();
        assert_eq!(fs::read(latest).unwrap(), [3u8]);
    }
}
