use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use memmap2::Mmap;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// All-zero digest, meaning "unchecked" wherever a strong digest travels.
pub const ZERO_DIGEST: [u8; 32] = [0u8; 32];

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(op: &'static str, path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| Error::read(op, path, e))?;
    // SAFETY: read-only mapping; these files are not modified while mapped.
    unsafe { Mmap::map(&file).map_err(|e| Error::read(op, path, e)) }
}

/// Stream-hash a file with SHA-256.
/// Uses a 256 KiB BufReader to reduce syscall overhead vs the default 8 KiB.
pub fn sha256_file(op: &'static str, path: &Path) -> Result<[u8; 32]> {
    let file = File::open(path).map_err(|e| Error::read(op, path, e))?;
    let mut reader = BufReader::with_capacity(256 * 1024, file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::read(op, path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// SHA-256 of an in-memory slice.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Seconds since the Unix epoch, for container timestamps.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Fill `buf` from `reader`, short only at end of stream.
/// Returns the number of bytes read (0 at EOF).
pub fn read_block(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_block_fills_across_short_reads() {
        let mut cursor = Cursor::new(vec![7u8; 10]);
        let mut buf = [0u8; 4];
        assert_eq!(read_block(&mut cursor, &mut buf).unwrap(), 4);
        assert_eq!(read_block(&mut cursor, &mut buf).unwrap(), 4);
        assert_eq!(read_block(&mut cursor, &mut buf).unwrap(), 2);
        assert_eq!(read_block(&mut cursor, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sha256_bytes_matches_known_vector() {
        // SHA-256("abc")
        let digest = sha256_bytes(b"abc");
        assert_eq!(
            digest[..4],
            [0xba, 0x78, 0x16, 0xbf],
        );
    }
}
