use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::walk::FileStatus;

/// Same magic as single-file patches; the version distinguishes containers.
pub const TREE_MAGIC: u32 = 0x4845_5844;
/// Tree-patch container version.
pub const TREE_VERSION: u16 = 2;
/// Fixed tree-patch header size.
pub const TREE_HEADER_SIZE: usize = 64;
/// Fixed per-entry record size (path and payload follow each record).
pub const TREE_ENTRY_SIZE: usize = 64;

/// One per-file entry of a tree patch.
///
/// `payload` holds full file bytes when `is_full_content` (Added), an
/// embedded single-file patch for Modified, and is empty for Deleted.
#[derive(Debug, Clone)]
pub struct TreePatchEntry {
    pub relative_path: String,
    pub status: FileStatus,
    pub mode: u32,
    pub mtime: i64,
    pub size: u64,
    /// SHA-256 of the final file content; zero for Deleted.
    pub checksum: [u8; 32],
    pub payload: Vec<u8>,
    pub is_full_content: bool,
}

/// A serializable tree patch: header metadata plus entries in walker
/// enumeration order. Consumers must not assume lexicographic entry order.
#[derive(Debug, Clone)]
pub struct TreePatch {
    pub timestamp: i64,
    pub old_name: String,
    pub new_name: String,
    pub metadata: BTreeMap<String, String>,
    pub entries: Vec<TreePatchEntry>,
}

fn marshal_header(patch: &TreePatch, metadata_len: u32) -> [u8; TREE_HEADER_SIZE] {
    let mut buf = [0u8; TREE_HEADER_SIZE];
    buf[0..4].copy_from_slice(&TREE_MAGIC.to_le_bytes());
    buf[4..6].copy_from_slice(&TREE_VERSION.to_le_bytes());
    // 6..8 reserved
    buf[8..16].copy_from_slice(&patch.timestamp.to_le_bytes());
    buf[16..20].copy_from_slice(&(patch.old_name.len() as u32).to_le_bytes());
    buf[20..24].copy_from_slice(&(patch.new_name.len() as u32).to_le_bytes());
    buf[24..28].copy_from_slice(&(patch.entries.len() as u32).to_le_bytes());
    buf[28..32].copy_from_slice(&metadata_len.to_le_bytes());
    // 32..64 padding / reserved
    buf
}

struct TreeHeader {
    timestamp: i64,
    old_name_len: u32,
    new_name_len: u32,
    file_count: u32,
    metadata_len: u32,
}

fn unmarshal_header(data: &[u8]) -> Result<TreeHeader> {
    if data.len() < TREE_HEADER_SIZE {
        return Err(Error::PatchCorrupted {
            reason: format!("tree header truncated at {} bytes", data.len()),
        });
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != TREE_MAGIC {
        return Err(Error::PatchCorrupted {
            reason: format!("bad tree magic {magic:#010x}"),
        });
    }
    let version = u16::from_le_bytes(data[4..6].try_into().unwrap());
    if version != TREE_VERSION {
        return Err(Error::PatchIncompatible {
            reason: format!("unsupported tree patch version {version}"),
        });
    }
    Ok(TreeHeader {
        timestamp: i64::from_le_bytes(data[8..16].try_into().unwrap()),
        old_name_len: u32::from_le_bytes(data[16..20].try_into().unwrap()),
        new_name_len: u32::from_le_bytes(data[20..24].try_into().unwrap()),
        file_count: u32::from_le_bytes(data[24..28].try_into().unwrap()),
        metadata_len: u32::from_le_bytes(data[28..32].try_into().unwrap()),
    })
}

fn marshal_entry(entry: &TreePatchEntry) -> [u8; TREE_ENTRY_SIZE] {
    let mut buf = [0u8; TREE_ENTRY_SIZE];
    buf[0..4].copy_from_slice(&(entry.relative_path.len() as u32).to_le_bytes());
    buf[4] = entry.status.as_u8();
    buf[5..9].copy_from_slice(&entry.mode.to_le_bytes());
    buf[9..17].copy_from_slice(&entry.mtime.to_le_bytes());
    buf[17..25].copy_from_slice(&(entry.size as i64).to_le_bytes());
    buf[25..57].copy_from_slice(&entry.checksum);
    buf[57..61].copy_from_slice(&(entry.payload.len() as u32).to_le_bytes());
    buf[61] = u8::from(entry.is_full_content);
    // 62..64 reserved
    buf
}

struct EntryRecord {
    path_len: u32,
    status: FileStatus,
    mode: u32,
    mtime: i64,
    size: i64,
    checksum: [u8; 32],
    data_len: u32,
    is_full_content: bool,
}

fn unmarshal_entry(data: &[u8]) -> Result<EntryRecord> {
    if data.len() < TREE_ENTRY_SIZE {
        return Err(Error::PatchCorrupted {
            reason: format!("tree entry truncated at {} bytes", data.len()),
        });
    }
    Ok(EntryRecord {
        path_len: u32::from_le_bytes(data[0..4].try_into().unwrap()),
        status: FileStatus::from_u8(data[4])?,
        mode: u32::from_le_bytes(data[5..9].try_into().unwrap()),
        mtime: i64::from_le_bytes(data[9..17].try_into().unwrap()),
        size: i64::from_le_bytes(data[17..25].try_into().unwrap()),
        checksum: data[25..57].try_into().unwrap(),
        data_len: u32::from_le_bytes(data[57..61].try_into().unwrap()),
        is_full_content: data[61] != 0,
    })
}

/// Serialize a tree patch to a writer.
pub fn serialize(patch: &TreePatch, writer: &mut impl Write) -> Result<()> {
    const OP: &str = "serialize tree patch";
    let io_err = |e: std::io::Error| Error::corrupted(OP, e.to_string());

    let metadata = serde_json::to_vec(&patch.metadata)
        .map_err(|e| Error::corrupted(OP, e.to_string()))?;

    writer
        .write_all(&marshal_header(patch, metadata.len() as u32))
        .map_err(io_err)?;
    writer.write_all(patch.old_name.as_bytes()).map_err(io_err)?;
    writer.write_all(patch.new_name.as_bytes()).map_err(io_err)?;
    writer.write_all(&metadata).map_err(io_err)?;

    for entry in &patch.entries {
        writer.write_all(&marshal_entry(entry)).map_err(io_err)?;
        writer
            .write_all(entry.relative_path.as_bytes())
            .map_err(io_err)?;
        writer.write_all(&entry.payload).map_err(io_err)?;
    }
    Ok(())
}

/// Write a tree patch at `path`.
pub fn write_tree_patch(patch: &TreePatch, path: &Path) -> Result<()> {
    const OP: &str = "write tree patch";
    let file = File::create(path).map_err(|e| Error::write(OP, path, e))?;
    let mut writer = BufWriter::new(file);
    serialize(patch, &mut writer)?;
    writer.flush().map_err(|e| Error::write(OP, path, e))?;
    Ok(())
}

/// Read and validate a tree patch from a reader.
pub fn deserialize(reader: &mut impl Read) -> Result<TreePatch> {
    let mut header_buf = [0u8; TREE_HEADER_SIZE];
    read_field(reader, &mut header_buf, "tree header")?;
    let header = unmarshal_header(&header_buf)?;

    let old_name = read_string(reader, header.old_name_len as usize, "old root name")?;
    let new_name = read_string(reader, header.new_name_len as usize, "new root name")?;

    let mut metadata_buf = vec![0u8; header.metadata_len as usize];
    read_field(reader, &mut metadata_buf, "metadata")?;
    let metadata: BTreeMap<String, String> = if metadata_buf.is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_slice(&metadata_buf).map_err(|e| Error::PatchCorrupted {
            reason: format!("metadata is not valid JSON: {e}"),
        })?
    };

    let mut entries = Vec::with_capacity(header.file_count as usize);
    let mut record_buf = [0u8; TREE_ENTRY_SIZE];
    for i in 0..header.file_count {
        read_field(reader, &mut record_buf, "entry record").map_err(|_| {
            Error::PatchCorrupted {
                reason: format!("entry table truncated at record {i}"),
            }
        })?;
        let record = unmarshal_entry(&record_buf)?;
        if record.size < 0 {
            return Err(Error::PatchCorrupted {
                reason: format!("entry {i} has negative size {}", record.size),
            });
        }

        let relative_path = read_string(reader, record.path_len as usize, "entry path")?;
        let mut payload = vec![0u8; record.data_len as usize];
        read_field(reader, &mut payload, "entry payload")?;

        entries.push(TreePatchEntry {
            relative_path,
            status: record.status,
            mode: record.mode,
            mtime: record.mtime,
            size: record.size as u64,
            checksum: record.checksum,
            payload,
            is_full_content: record.is_full_content,
        });
    }

    Ok(TreePatch {
        timestamp: header.timestamp,
        old_name,
        new_name,
        metadata,
        entries,
    })
}

/// Open and deserialize a tree patch file.
pub fn read_tree_patch(path: &Path) -> Result<TreePatch> {
    const OP: &str = "read tree patch";
    let file = File::open(path).map_err(|e| Error::read(OP, path, e))?;
    let mut reader = BufReader::new(file);
    deserialize(&mut reader)
}

fn read_field(reader: &mut impl Read, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|_| Error::PatchCorrupted {
        reason: format!("{what} truncated"),
    })
}

fn read_string(reader: &mut impl Read, len: usize, what: &str) -> Result<String> {
    let mut buf = vec![0u8; len];
    read_field(reader, &mut buf, what)?;
    String::from_utf8(buf).map_err(|_| Error::PatchCorrupted {
        reason: format!("{what} is not valid UTF-8"),
    })
}
