use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use filetime::FileTime;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::apply::Applier;
use crate::config::{ApplyConfig, TreeDiffConfig};
use crate::delta::DeltaEngine;
use crate::error::{Error, Result};
use crate::optimizer::{Optimizer, OptimizerConfig};
use crate::patch_format::Serializer;
use crate::tree_patch::{self, TreePatch, TreePatchEntry};
use crate::util::{mmap_file, sha256_bytes, unix_now};
use crate::walk::{classify_trees, walk_tree, Change, FileStatus};

/// Cooperative cancellation for tree operations. Workers check the flag
/// between files; a raised flag aborts the whole job before any output is
/// written.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled { op })
        } else {
            Ok(())
        }
    }
}

/// Per-status counts from a tree diff.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeDiffSummary {
    pub added: usize,
    pub deleted: usize,
    pub modified: usize,
    pub unchanged: usize,
}

/// Per-status counts from a tree apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeApplySummary {
    pub added: usize,
    pub deleted: usize,
    pub modified: usize,
}

/// Compare `old_dir` and `new_dir` and write a tree patch to `output`.
///
/// The two walks run concurrently; per-file work (full-content slurps for
/// added files, delta generation for modified ones) fans out over a worker
/// pool of `config.worker_count` threads. Results are buffered and serialized
/// in walker enumeration order regardless of completion order, and the patch
/// file is written last so a failed run leaves nothing behind.
pub async fn create_tree_patch(
    old_dir: &Path,
    new_dir: &Path,
    output: &Path,
    config: &TreeDiffConfig,
    cancel: &CancelFlag,
) -> Result<TreeDiffSummary> {
    const OP: &str = "create tree patch";

    config.validate()?;

    let old_dir = old_dir.to_path_buf();
    let new_dir = new_dir.to_path_buf();
    let old_config = config.clone();
    let new_config = config.clone();
    let old_for_walk = old_dir.clone();
    let new_for_walk = new_dir.clone();

    let (old_walk, new_walk) = tokio::try_join!(
        tokio::task::spawn_blocking(move || walk_tree(&old_for_walk, &old_config)),
        tokio::task::spawn_blocking(move || walk_tree(&new_for_walk, &new_config)),
    )
    .map_err(|e| Error::corrupted(OP, e.to_string()))?;
    let old_walk = old_walk?;
    let new_walk = new_walk?;

    cancel.check(OP)?;
    debug!(
        old = old_walk.len(),
        new = new_walk.len(),
        "trees walked"
    );

    let config = config.clone();
    let cancel = cancel.clone();
    let output = output.to_path_buf();

    let summary = tokio::task::spawn_blocking(move || -> Result<TreeDiffSummary> {
        let changes = classify_trees(&old_walk, &new_walk)?;
        cancel.check(OP)?;

        let mut summary = TreeDiffSummary::default();
        for change in &changes {
            match change.status {
                FileStatus::Added => summary.added += 1,
                FileStatus::Deleted => summary.deleted += 1,
                FileStatus::Modified => summary.modified += 1,
                FileStatus::Unchanged => summary.unchanged += 1,
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_count)
            .build()
            .map_err(|e| Error::InvalidConfig {
                reason: format!("worker pool: {e}"),
            })?;

        // par_iter + collect keeps the classification order while files are
        // processed on whatever worker frees up first.
        let entries: Vec<Option<TreePatchEntry>> = pool.install(|| {
            changes
                .par_iter()
                .map(|change| {
                    cancel.check(OP)?;
                    build_entry(change, &config)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let patch = TreePatch {
            timestamp: unix_now(),
            old_name: root_name(&old_dir),
            new_name: root_name(&new_dir),
            metadata: generator_metadata(),
            entries: entries.into_iter().flatten().collect(),
        };

        cancel.check(OP)?;
        tree_patch::write_tree_patch(&patch, &output)?;
        Ok(summary)
    })
    .await
    .map_err(|e| Error::corrupted(OP, e.to_string()))??;

    info!(
        added = summary.added,
        deleted = summary.deleted,
        modified = summary.modified,
        unchanged = summary.unchanged,
        "tree patch created"
    );
    Ok(summary)
}

/// Produce the serialized entry for one classified change, or `None` for
/// unchanged files.
fn build_entry(change: &Change, config: &TreeDiffConfig) -> Result<Option<TreePatchEntry>> {
    const OP: &str = "create tree patch";

    match change.status {
        FileStatus::Unchanged => Ok(None),

        FileStatus::Added => {
            let entry = change.new.as_ref().ok_or_else(|| {
                Error::corrupted(OP, format!("added entry {} has no metadata", change.relative_path))
            })?;
            // zero-length files cannot be mapped
            let payload = if entry.size == 0 {
                Vec::new()
            } else {
                mmap_file(OP, &entry.abs_path)?.to_vec()
            };

            Ok(Some(TreePatchEntry {
                relative_path: change.relative_path.clone(),
                status: FileStatus::Added,
                mode: entry.mode,
                mtime: entry.mtime_unix(),
                size: entry.size,
                checksum: sha256_bytes(&payload),
                payload,
                is_full_content: true,
            }))
        }

        FileStatus::Deleted => {
            let entry = change.old.as_ref().ok_or_else(|| {
                Error::corrupted(OP, format!("deleted entry {} has no metadata", change.relative_path))
            })?;
            Ok(Some(TreePatchEntry {
                relative_path: change.relative_path.clone(),
                status: FileStatus::Deleted,
                mode: entry.mode,
                mtime: entry.mtime_unix(),
                size: entry.size,
                checksum: [0u8; 32],
                payload: Vec::new(),
                is_full_content: false,
            }))
        }

        FileStatus::Modified => {
            let (old_entry, new_entry) = match (&change.old, &change.new) {
                (Some(o), Some(n)) => (o, n),
                _ => {
                    return Err(Error::corrupted(
                        OP,
                        format!("modified entry {} lacks a side", change.relative_path),
                    ))
                }
            };

            // Each worker owns its engine; the signature is built and consumed
            // within one file's processing.
            let engine = DeltaEngine::new(config.delta.clone())?;
            let signature = engine.generate_signature(&old_entry.abs_path)?;
            let delta = engine.generate_with_signature(&signature, &new_entry.abs_path)?;
            let delta = Optimizer::new(OptimizerConfig::default()).optimize(delta);

            let target_checksum = delta.checksum;
            let payload =
                Serializer::new(config.compression).serialize_to_vec(&delta, signature.checksum)?;

            Ok(Some(TreePatchEntry {
                relative_path: change.relative_path.clone(),
                status: FileStatus::Modified,
                mode: new_entry.mode,
                mtime: new_entry.mtime_unix(),
                size: new_entry.size,
                checksum: target_checksum,
                payload,
                is_full_content: false,
            }))
        }
    }
}

/// Apply a tree patch in place under `target_dir`.
///
/// Added, modified, and deleted entries operate on disjoint path sets by
/// construction, so the three groups run concurrently; modified files go
/// through the verified single-file applier (temp file + atomic rename).
pub async fn apply_tree_patch(
    patch_path: &Path,
    target_dir: &Path,
    apply_config: &ApplyConfig,
) -> Result<TreeApplySummary> {
    const OP: &str = "apply tree patch";

    apply_config.validate()?;
    if !target_dir.is_dir() {
        return Err(Error::FileNotFound {
            op: OP,
            path: target_dir.to_path_buf(),
        });
    }

    let patch = {
        let patch_path = patch_path.to_path_buf();
        tokio::task::spawn_blocking(move || tree_patch::read_tree_patch(&patch_path))
            .await
            .map_err(|e| Error::corrupted(OP, e.to_string()))??
    };

    let mut added: Vec<TreePatchEntry> = Vec::new();
    let mut modified: Vec<TreePatchEntry> = Vec::new();
    let mut deleted: Vec<TreePatchEntry> = Vec::new();
    for entry in patch.entries {
        match entry.status {
            FileStatus::Added => added.push(entry),
            FileStatus::Modified => modified.push(entry),
            FileStatus::Deleted => deleted.push(entry),
            FileStatus::Unchanged => {}
        }
    }

    let summary = TreeApplySummary {
        added: added.len(),
        modified: modified.len(),
        deleted: deleted.len(),
    };

    let target_for_add = target_dir.to_path_buf();
    let target_for_modify = target_dir.to_path_buf();
    let target_for_delete = target_dir.to_path_buf();
    let apply_config = apply_config.clone();

    let (r_add, r_modify, r_delete) = tokio::try_join!(
        tokio::task::spawn_blocking(move || -> Result<()> {
            added.par_iter().try_for_each(|entry| -> Result<()> {
                let full = target_for_add.join(&entry.relative_path);
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::write(OP, parent, e))?;
                }
                if sha256_bytes(&entry.payload) != entry.checksum {
                    return Err(Error::ChecksumMismatch {
                        op: OP,
                        path: Some(full),
                    });
                }
                fs::write(&full, &entry.payload).map_err(|e| Error::write(OP, &full, e))?;
                restore_entry_metadata(&full, entry)?;
                Ok(())
            })
        }),
        tokio::task::spawn_blocking(move || -> Result<()> {
            let applier = Applier::new(apply_config)?;
            modified.par_iter().try_for_each(|entry| -> Result<()> {
                let full = target_for_modify.join(&entry.relative_path);
                if !full.exists() {
                    return Err(Error::FileNotFound { op: OP, path: full });
                }
                applier.apply_bytes(&full, &entry.payload, &full)?;
                restore_entry_metadata(&full, entry)?;
                Ok(())
            })
        }),
        tokio::task::spawn_blocking(move || -> Result<()> {
            deleted.par_iter().try_for_each(|entry| -> Result<()> {
                let full = target_for_delete.join(&entry.relative_path);
                match fs::remove_file(&full) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(Error::write(OP, &full, e)),
                }
            })
        }),
    )
    .map_err(|e| Error::corrupted(OP, e.to_string()))?;
    r_add?;
    r_modify?;
    r_delete?;

    info!(
        added = summary.added,
        modified = summary.modified,
        deleted = summary.deleted,
        "tree patch applied"
    );
    Ok(summary)
}

fn restore_entry_metadata(path: &Path, entry: &TreePatchEntry) -> Result<()> {
    const OP: &str = "apply tree patch";

    #[cfg(unix)]
    if entry.mode != 0 {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(entry.mode))
            .map_err(|e| Error::write(OP, path, e))?;
    }

    filetime::set_file_mtime(path, FileTime::from_unix_time(entry.mtime, 0))
        .map_err(|e| Error::write(OP, path, e))?;
    Ok(())
}

fn root_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn generator_metadata() -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(
        "generator".to_string(),
        format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    );
    metadata
}
