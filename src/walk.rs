use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::trace;
use walkdir::WalkDir;

use crate::config::TreeDiffConfig;
use crate::error::{Error, Result};
use crate::util::sha256_file;

/// Classification of one path across the two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Unchanged,
    Added,
    Deleted,
    Modified,
}

impl FileStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            FileStatus::Unchanged => 0,
            FileStatus::Added => 1,
            FileStatus::Deleted => 2,
            FileStatus::Modified => 3,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(FileStatus::Unchanged),
            1 => Ok(FileStatus::Added),
            2 => Ok(FileStatus::Deleted),
            3 => Ok(FileStatus::Modified),
            other => Err(Error::PatchCorrupted {
                reason: format!("unknown file status {other}"),
            }),
        }
    }
}

/// One regular file found during a walk.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Forward-slash relative path; the pairing key across trees.
    pub relative_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    /// Unix permission bits (0 where the platform has none).
    pub mode: u32,
    pub mtime: SystemTime,
}

impl FileEntry {
    pub fn mtime_unix(&self) -> i64 {
        match self.mtime.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        }
    }
}

/// The result of walking one tree: entries in enumeration order plus a
/// path-keyed index into them.
pub struct TreeWalk {
    pub root: PathBuf,
    entries: Vec<FileEntry>,
    index: HashMap<String, usize>,
}

impl TreeWalk {
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileEntry> {
        self.index.get(relative_path).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.index.contains_key(relative_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Walk a directory tree into a [`TreeWalk`], applying the configured ignore
/// rules. Entries are sorted by file name per directory, making enumeration
/// order deterministic for a given filesystem state.
pub fn walk_tree(root: &Path, config: &TreeDiffConfig) -> Result<TreeWalk> {
    const OP: &str = "walk tree";

    if !root.is_dir() {
        return Err(Error::FileNotFound {
            op: OP,
            path: root.to_path_buf(),
        });
    }

    let root = root
        .canonicalize()
        .map_err(|e| Error::read(OP, root, e))?;

    let mut entries = Vec::new();
    let mut index = HashMap::new();

    let ignore_hidden = config.ignore_hidden;
    let patterns = config.ignore_patterns.clone();
    let root_for_filter = root.clone();

    let walker = WalkDir::new(&root)
        .min_depth(1)
        .follow_links(config.follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            let basename = entry.file_name().to_string_lossy();
            if ignore_hidden && basename.starts_with('.') {
                return false;
            }
            let rel = match entry.path().strip_prefix(&root_for_filter) {
                Ok(rel) => rel,
                Err(_) => return true,
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            !matches_ignore(&rel, &patterns)
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
            match e.into_io_error() {
                Some(io) => Error::read(OP, path, io),
                None => Error::corrupted(OP, "walk loop detected"),
            }
        })?;

        if !config.follow_symlinks && entry.path_is_symlink() {
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        let abs_path = entry.path().to_path_buf();
        let relative_path = abs_path
            .strip_prefix(&root)
            .map_err(|_| Error::corrupted(OP, format!("path escapes root: {}", abs_path.display())))?
            .to_str()
            .ok_or_else(|| {
                Error::corrupted(OP, format!("non-UTF-8 path: {}", abs_path.display()))
            })?
            .replace('\\', "/");

        let meta = entry
            .metadata()
            .map_err(|e| match e.into_io_error() {
                Some(io) => Error::read(OP, &abs_path, io),
                None => Error::corrupted(OP, "metadata unavailable"),
            })?;

        trace!(path = %relative_path, size = meta.len(), "walked");

        index.insert(relative_path.clone(), entries.len());
        entries.push(FileEntry {
            relative_path,
            abs_path,
            size: meta.len(),
            mode: file_mode(&meta),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    Ok(TreeWalk {
        root,
        entries,
        index,
    })
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0
}

/// Ignore-pattern matching over a forward-slash relative path.
///
/// `*.ext` matches any basename with that extension. Otherwise a leading `*`
/// is stripped, and a pattern matches when the basename equals it, the path
/// equals it, or the path lies under `<pattern>/`.
pub fn matches_ignore(path: &str, patterns: &[String]) -> bool {
    let basename = path.rsplit('/').next().unwrap_or(path);

    for pattern in patterns {
        if let Some(ext) = pattern.strip_prefix("*.") {
            let suffix = format!(".{ext}");
            if basename.ends_with(&suffix) || basename == suffix.as_str() {
                return true;
            }
            continue;
        }

        let pattern = pattern.strip_prefix('*').unwrap_or(pattern);
        if basename == pattern
            || path == pattern
            || path.starts_with(&format!("{pattern}/"))
        {
            return true;
        }
    }
    false
}

/// One pairing decision for a relative path.
#[derive(Debug, Clone)]
pub struct Change {
    pub relative_path: String,
    pub status: FileStatus,
    pub old: Option<FileEntry>,
    pub new: Option<FileEntry>,
}

/// Pair two walked trees and classify every path.
///
/// Equal size plus equal mtime classifies as Unchanged without reading either
/// file; this favors throughput and is blind to mtime spoofing. Equal size
/// with a different mtime falls back to comparing strong digests; a size
/// difference alone is already Modified.
///
/// Order: new-tree enumeration order for Added/Modified/Unchanged, then
/// old-tree enumeration order for Deleted.
pub fn classify_trees(old: &TreeWalk, new: &TreeWalk) -> Result<Vec<Change>> {
    const OP: &str = "classify trees";

    let mut changes = Vec::with_capacity(new.len() + old.len());

    for new_entry in new.entries() {
        let path = &new_entry.relative_path;
        let Some(old_entry) = old.get(path) else {
            changes.push(Change {
                relative_path: path.clone(),
                status: FileStatus::Added,
                old: None,
                new: Some(new_entry.clone()),
            });
            continue;
        };

        let status = if old_entry.size == new_entry.size {
            if old_entry.mtime == new_entry.mtime {
                FileStatus::Unchanged
            } else {
                let old_digest = sha256_file(OP, &old_entry.abs_path)?;
                let new_digest = sha256_file(OP, &new_entry.abs_path)?;
                if old_digest == new_digest {
                    FileStatus::Unchanged
                } else {
                    FileStatus::Modified
                }
            }
        } else {
            FileStatus::Modified
        };

        changes.push(Change {
            relative_path: path.clone(),
            status,
            old: Some(old_entry.clone()),
            new: Some(new_entry.clone()),
        });
    }

    for old_entry in old.entries() {
        if !new.contains(&old_entry.relative_path) {
            changes.push(Change {
                relative_path: old_entry.relative_path.clone(),
                status: FileStatus::Deleted,
                old: Some(old_entry.clone()),
                new: None,
            });
        }
    }

    Ok(changes)
}
