use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::DeltaConfig;
use crate::error::{Error, Result};
use crate::rolling_hash::fast_hash;
use crate::signature::Signature;
use crate::util::{read_block, ZERO_DIGEST};

/// A single reconstruction step.
///
/// COPY replays source bytes, INSERT emits literal bytes, DELETE is an
/// optimizer artifact: the applier skips it, because deleted regions are
/// simply never written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Copy {
        /// Target-side offset.
        offset: u64,
        /// Source-side offset.
        src_offset: u64,
        len: u32,
    },
    Insert {
        /// Target-side offset.
        offset: u64,
        data: Vec<u8>,
    },
    Delete {
        /// Target-side offset.
        offset: u64,
        len: u32,
    },
}

impl Op {
    pub fn offset(&self) -> u64 {
        match self {
            Op::Copy { offset, .. } | Op::Insert { offset, .. } | Op::Delete { offset, .. } => {
                *offset
            }
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            Op::Copy { len, .. } | Op::Delete { len, .. } => *len,
            Op::Insert { data, .. } => data.len() as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered operation list plus the metadata needed to reconstruct and verify
/// the target. Ephemeral; serialized into a patch container for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub source_size: u64,
    pub target_size: u64,
    pub ops: Vec<Op>,
    /// SHA-256 of the target as streamed during the scan; all-zero when
    /// digests are disabled.
    pub checksum: [u8; 32],
}

impl Delta {
    /// Total bytes produced by COPY ops.
    pub fn copy_len(&self) -> u64 {
        self.ops
            .iter()
            .filter(|op| matches!(op, Op::Copy { .. }))
            .map(|op| u64::from(op.len()))
            .sum()
    }

    /// Total literal bytes carried by INSERT ops.
    pub fn insert_len(&self) -> u64 {
        self.ops
            .iter()
            .filter(|op| matches!(op, Op::Insert { .. }))
            .map(|op| u64::from(op.len()))
            .sum()
    }
}

/// Generates deltas by scanning the target in block-aligned, non-overlapping
/// windows and probing the source signature.
///
/// The scan never byte-shifts: content displaced by a non-multiple of the
/// block size will not match across block boundaries. This trades matching
/// quality on shifted regions for O(n) throughput and O(block_size) scan
/// memory.
pub struct DeltaEngine {
    config: DeltaConfig,
}

impl DeltaEngine {
    pub fn new(config: DeltaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DeltaConfig {
        &self.config
    }

    /// Index `source` for subsequent scans.
    pub fn generate_signature(&self, source: &Path) -> Result<Signature> {
        Signature::generate(source, &self.config)
    }

    /// Produce a delta turning `source` into `target`.
    pub fn generate(&self, source: &Path, target: &Path) -> Result<Delta> {
        let signature = self.generate_signature(source)?;
        self.generate_with_signature(&signature, target)
    }

    /// Scan `target` against a prebuilt signature.
    pub fn generate_with_signature(&self, signature: &Signature, target: &Path) -> Result<Delta> {
        const OP: &str = "generate delta";

        // A signature built with a different block size indexes windows this
        // scan will never produce.
        if signature.block_size != self.config.block_size {
            return Err(Error::InvalidSignature {
                op: OP,
                reason: format!(
                    "signature block size {} != engine block size {}",
                    signature.block_size, self.config.block_size
                ),
            });
        }

        let file = File::open(target).map_err(|e| Error::read(OP, target, e))?;
        let target_size = file
            .metadata()
            .map_err(|e| Error::read(OP, target, e))?
            .len();
        let mut reader = BufReader::with_capacity(256 * 1024, file);

        let mut delta = Delta {
            source_size: signature.source_size,
            target_size,
            ops: Vec::new(),
            checksum: ZERO_DIGEST,
        };

        let mut hasher = self.config.enable_sha256.then(Sha256::new);
        let mut window = vec![0u8; self.config.block_size];
        let mut scan_pos = 0u64;
        let mut unmatched: Vec<u8> = Vec::new();
        let mut unmatched_start = 0u64;
        let mut literal_bytes = 0u64;

        loop {
            let n = read_block(&mut reader, &mut window).map_err(|e| Error::read(OP, target, e))?;
            if n == 0 {
                break;
            }
            let block = &window[..n];

            if let Some(h) = hasher.as_mut() {
                h.update(block);
            }

            match signature.find(fast_hash(block), block) {
                Some(found) => {
                    if !unmatched.is_empty() {
                        literal_bytes += unmatched.len() as u64;
                        delta.ops.push(Op::Insert {
                            offset: unmatched_start,
                            data: std::mem::take(&mut unmatched),
                        });
                    }
                    delta.ops.push(Op::Copy {
                        offset: scan_pos,
                        src_offset: found.offset,
                        len: found.len,
                    });
                }
                None => {
                    if unmatched.is_empty() {
                        unmatched_start = scan_pos;
                    }
                    unmatched.extend_from_slice(block);

                    let buffered = unmatched.len() as u64 + literal_bytes;
                    if buffered > self.config.max_memory {
                        return Err(Error::MemoryLimitExceeded {
                            op: OP,
                            needed: buffered,
                            limit: self.config.max_memory,
                        });
                    }
                }
            }
            scan_pos += n as u64;
        }

        if !unmatched.is_empty() {
            delta.ops.push(Op::Insert {
                offset: unmatched_start,
                data: unmatched,
            });
        }

        if let Some(h) = hasher {
            delta.checksum = h.finalize().into();
        }

        debug!(
            target_size,
            ops = delta.ops.len(),
            copied = delta.copy_len(),
            inserted = delta.insert_len(),
            "delta generated"
        );

        Ok(delta)
    }
}
