use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::config::DeltaConfig;
use crate::error::{Error, Result};
use crate::rolling_hash::fast_hash;
use crate::util::{read_block, ZERO_DIGEST};

/// One indexed source block: where it lives, how long it is, and the two
/// hashes used to find and confirm it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: u64,
    pub len: u32,
    pub hash: u64,
    pub crc32: u32,
}

/// The source file's searchable index: a multimap from fast-hash values to
/// blocks, plus the source's whole-file digest. Built once, consulted
/// read-only by the delta engine, then discarded.
#[derive(Debug)]
pub struct Signature {
    pub block_size: usize,
    pub source_size: u64,
    /// SHA-256 of the whole source; all-zero when digests are disabled.
    pub checksum: [u8; 32],
    blocks: HashMap<u64, Vec<Block>>,
    confirm_crc: bool,
}

impl Signature {
    /// Index `source` in consecutive `block_size` slices (the final block may
    /// be shorter), streaming the whole file through SHA-256 as a side effect.
    pub fn generate(source: &Path, config: &DeltaConfig) -> Result<Self> {
        const OP: &str = "generate signature";

        let file = File::open(source).map_err(|e| Error::read(OP, source, e))?;
        let source_size = file
            .metadata()
            .map_err(|e| Error::read(OP, source, e))?
            .len();

        let mut signature = Signature {
            block_size: config.block_size,
            source_size,
            checksum: ZERO_DIGEST,
            blocks: HashMap::new(),
            confirm_crc: config.enable_crc32,
        };

        let mut reader = BufReader::with_capacity(256 * 1024, file);
        let mut hasher = config.enable_sha256.then(Sha256::new);
        let mut buf = vec![0u8; config.block_size];
        let mut offset = 0u64;

        loop {
            let n = read_block(&mut reader, &mut buf).map_err(|e| Error::read(OP, source, e))?;
            if n == 0 {
                break;
            }
            let block_data = &buf[..n];

            if let Some(h) = hasher.as_mut() {
                h.update(block_data);
            }

            let crc32 = if config.enable_crc32 {
                crc32fast::hash(block_data)
            } else {
                0
            };

            signature.insert(Block {
                offset,
                len: n as u32,
                hash: fast_hash(block_data),
                crc32,
            });
            offset += n as u64;
        }

        if let Some(h) = hasher {
            signature.checksum = h.finalize().into();
        }

        Ok(signature)
    }

    fn insert(&mut self, block: Block) {
        self.blocks.entry(block.hash).or_default().push(block);
    }

    /// Look up a candidate window. A bucket miss is a miss; within a bucket
    /// the first block (insertion order) whose length and CRC32 match the
    /// candidate wins. With CRC32 disabled, length alone confirms.
    pub fn find(&self, hash: u64, candidate: &[u8]) -> Option<&Block> {
        let bucket = self.blocks.get(&hash)?;
        let crc32 = self.confirm_crc.then(|| crc32fast::hash(candidate));

        bucket.iter().find(|block| {
            block.len as usize == candidate.len() && crc32.map_or(true, |c| c == block.crc32)
        })
    }

    pub fn block_count(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
