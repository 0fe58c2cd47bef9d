//! Compact binary patches between two versions of a file or directory tree.
//!
//! The delta core indexes the source file into fixed-size blocks keyed by a
//! cyclic-polynomial rolling hash, scans the target in block-aligned windows,
//! and emits a COPY/INSERT operation stream that reconstructs the target
//! byte-for-byte. Patches are self-describing binary containers with
//! SHA-256 digests on both sides and optional compression of the literal
//! data; the applier verifies the source before writing and the target
//! before atomically publishing it.
//!
//! Directory trees are handled by walking both versions, classifying each
//! path as added/deleted/modified, and packing per-file payloads into a tree
//! patch.

pub mod apply;
pub mod compress;
pub mod config;
pub mod delta;
pub mod error;
pub mod integrity;
pub mod optimizer;
pub mod patch_format;
pub mod rolling_hash;
pub mod signature;
pub mod tree;
pub mod tree_patch;
pub mod util;
pub mod walk;

pub use apply::{Applier, ApplyReport};
pub use compress::Compression;
pub use config::{ApplyConfig, DeltaConfig, TreeDiffConfig};
pub use delta::{Delta, DeltaEngine, Op};
pub use error::{Error, Result};
pub use optimizer::{Optimizer, OptimizerConfig};
pub use signature::Signature;
pub use tree::{apply_tree_patch, create_tree_patch, CancelFlag, TreeApplySummary, TreeDiffSummary};
pub use walk::FileStatus;

use std::path::Path;

/// Generate an optimized patch file turning `source` into `target`.
pub fn generate_patch(
    source: &Path,
    target: &Path,
    output: &Path,
    config: &DeltaConfig,
    compression: Compression,
) -> Result<()> {
    let engine = DeltaEngine::new(config.clone())?;
    let signature = engine.generate_signature(source)?;
    let delta = engine.generate_with_signature(&signature, target)?;
    let delta = Optimizer::new(OptimizerConfig::default()).optimize(delta);
    patch_format::Serializer::new(compression).serialize_to_path(&delta, signature.checksum, output)
}

/// Apply the patch at `patch` to `source`, producing `target`.
pub fn apply_patch(
    source: &Path,
    patch: &Path,
    target: &Path,
    config: &ApplyConfig,
) -> Result<ApplyReport> {
    Applier::new(config.clone())?.apply(source, patch, target)
}
