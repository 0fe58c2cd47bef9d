use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};

/// Literal-blob codec, identified on the wire by a one-byte tag.
/// Compression applies to the literal region only; every other part of a
/// patch container is stored raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Lz4 => 2,
            Compression::Zstd => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Lz4),
            3 => Ok(Compression::Zstd),
            other => Err(Error::PatchIncompatible {
                reason: format!("unknown compression tag {other}"),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::InvalidConfig {
                reason: format!("unknown compression codec {other:?}"),
            }),
        }
    }
}

const OP: &str = "compress literal data";
const OP_DE: &str = "decompress literal data";

/// Compress a literal blob with the selected codec.
pub fn compress(codec: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| Error::corrupted(OP, e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| Error::corrupted(OP, e.to_string()))
        }
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Compression::Zstd => {
            zstd::bulk::compress(data, 3).map_err(|e| Error::corrupted(OP, e.to_string()))
        }
    }
}

/// Inverse of [`compress`]. `expected_len` bounds allocation and is known
/// from the operation table (sum of INSERT lengths).
pub fn decompress(codec: Compression, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let out = match codec {
        Compression::None => data.to_vec(),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::with_capacity(expected_len);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::corrupted(OP_DE, e.to_string()))?;
            out
        }
        Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::corrupted(OP_DE, e.to_string()))?,
        Compression::Zstd => zstd::bulk::decompress(data, expected_len)
            .map_err(|e| Error::corrupted(OP_DE, e.to_string()))?,
    };

    if out.len() != expected_len {
        return Err(Error::PatchCorrupted {
            reason: format!(
                "literal blob decompressed to {} bytes, expected {}",
                out.len(),
                expected_len
            ),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_codec() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
        for codec in [
            Compression::None,
            Compression::Gzip,
            Compression::Lz4,
            Compression::Zstd,
        ] {
            let packed = compress(codec, &data).unwrap();
            let unpacked = decompress(codec, &packed, data.len()).unwrap();
            assert_eq!(unpacked, data, "codec {}", codec.name());
        }
    }

    #[test]
    fn empty_blob_round_trips() {
        for codec in [Compression::Gzip, Compression::Lz4, Compression::Zstd] {
            let packed = compress(codec, b"").unwrap();
            assert_eq!(decompress(codec, &packed, 0).unwrap(), b"");
        }
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(matches!(
            Compression::from_tag(9),
            Err(Error::PatchIncompatible { .. })
        ));
    }

    #[test]
    fn wrong_expected_len_is_corruption() {
        let packed = compress(Compression::Gzip, b"hello").unwrap();
        assert!(matches!(
            decompress(Compression::Gzip, &packed, 3),
            Err(Error::PatchCorrupted { .. })
        ));
    }

    #[test]
    fn tags_are_stable() {
        assert_eq!(Compression::None.tag(), 0);
        assert_eq!(Compression::Gzip.tag(), 1);
        assert_eq!(Compression::Lz4.tag(), 2);
        assert_eq!(Compression::Zstd.tag(), 3);
    }
}
