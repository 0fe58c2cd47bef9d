use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::compress::{self, Compression};
use crate::delta::{Delta, Op};
use crate::error::{Error, Result};
use crate::util::{unix_now, ZERO_DIGEST};

/// Container magic, "HEXD" little-endian.
pub const MAGIC: u32 = 0x4845_5844;
/// Single-file container version.
pub const VERSION: u16 = 1;
/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 104;
/// Fixed operation record size in bytes.
pub const OP_RECORD_SIZE: usize = 26;

pub const OP_TYPE_COPY: u8 = 0;
pub const OP_TYPE_INSERT: u8 = 1;
pub const OP_TYPE_DELETE: u8 = 2;

/// Parsed 104-byte patch header. All integers little-endian on the wire.
#[derive(Debug, Clone)]
pub struct PatchHeader {
    pub compression: Compression,
    pub timestamp: i64,
    pub source_size: i64,
    pub target_size: i64,
    /// All-zero means the source was not recorded ("unchecked").
    pub source_checksum: [u8; 32],
    /// All-zero means the target was not recorded ("unchecked").
    pub target_checksum: [u8; 32],
    pub operation_count: u32,
    pub data_offset: u32,
}

impl PatchHeader {
    pub fn marshal(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&VERSION.to_le_bytes());
        buf[6] = self.compression.tag();
        buf[7] = 0; // reserved
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..24].copy_from_slice(&self.source_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.target_size.to_le_bytes());
        buf[32..64].copy_from_slice(&self.source_checksum);
        buf[64..96].copy_from_slice(&self.target_checksum);
        buf[96..100].copy_from_slice(&self.operation_count.to_le_bytes());
        buf[100..104].copy_from_slice(&self.data_offset.to_le_bytes());
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::PatchCorrupted {
                reason: format!("header truncated at {} bytes", data.len()),
            });
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::PatchCorrupted {
                reason: format!("bad magic {magic:#010x}"),
            });
        }
        let version = u16::from_le_bytes(data[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(Error::PatchIncompatible {
                reason: format!("unsupported patch version {version}"),
            });
        }

        let header = PatchHeader {
            compression: Compression::from_tag(data[6])?,
            timestamp: i64::from_le_bytes(data[8..16].try_into().unwrap()),
            source_size: i64::from_le_bytes(data[16..24].try_into().unwrap()),
            target_size: i64::from_le_bytes(data[24..32].try_into().unwrap()),
            source_checksum: data[32..64].try_into().unwrap(),
            target_checksum: data[64..96].try_into().unwrap(),
            operation_count: u32::from_le_bytes(data[96..100].try_into().unwrap()),
            data_offset: u32::from_le_bytes(data[100..104].try_into().unwrap()),
        };

        if header.source_size < 0 || header.target_size < 0 {
            return Err(Error::PatchCorrupted {
                reason: format!(
                    "negative sizes: source {}, target {}",
                    header.source_size, header.target_size
                ),
            });
        }
        let expected_offset =
            HEADER_SIZE as u64 + u64::from(header.operation_count) * OP_RECORD_SIZE as u64;
        if u64::from(header.data_offset) != expected_offset {
            return Err(Error::PatchCorrupted {
                reason: format!(
                    "data offset {} does not match {} operations",
                    header.data_offset, header.operation_count
                ),
            });
        }

        Ok(header)
    }

    pub fn source_checked(&self) -> bool {
        self.source_checksum != ZERO_DIGEST
    }

    pub fn target_checked(&self) -> bool {
        self.target_checksum != ZERO_DIGEST
    }
}

/// One fixed-width operation record. Fields that do not apply to a variant
/// are zero on the wire and must not be relied upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRecord {
    pub op_type: u8,
    pub len: u32,
    /// Target-side offset.
    pub offset: u64,
    /// Source-side offset; COPY only.
    pub src_offset: u64,
    /// Offset into the literal blob; INSERT only.
    pub data_offset: u32,
}

impl OpRecord {
    pub fn marshal(&self) -> [u8; OP_RECORD_SIZE] {
        let mut buf = [0u8; OP_RECORD_SIZE];
        buf[0] = self.op_type;
        buf[1] = 0; // reserved
        buf[2..6].copy_from_slice(&self.len.to_le_bytes());
        buf[6..14].copy_from_slice(&self.offset.to_le_bytes());
        buf[14..22].copy_from_slice(&self.src_offset.to_le_bytes());
        buf[22..26].copy_from_slice(&self.data_offset.to_le_bytes());
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < OP_RECORD_SIZE {
            return Err(Error::PatchCorrupted {
                reason: format!("operation record truncated at {} bytes", data.len()),
            });
        }
        let record = OpRecord {
            op_type: data[0],
            len: u32::from_le_bytes(data[2..6].try_into().unwrap()),
            offset: u64::from_le_bytes(data[6..14].try_into().unwrap()),
            src_offset: u64::from_le_bytes(data[14..22].try_into().unwrap()),
            data_offset: u32::from_le_bytes(data[22..26].try_into().unwrap()),
        };
        if record.op_type > OP_TYPE_DELETE {
            return Err(Error::PatchCorrupted {
                reason: format!("unknown operation type {}", record.op_type),
            });
        }
        Ok(record)
    }
}

/// A deserialized patch: header, operation table, and the (decompressed)
/// literal blob all INSERT records index into.
pub struct PatchFile {
    pub header: PatchHeader,
    pub records: Vec<OpRecord>,
    pub data: Vec<u8>,
}

impl PatchFile {
    /// Slice an INSERT payload out of the literal blob, bounds-checked.
    pub fn insert_data(&self, record: &OpRecord) -> Result<&[u8]> {
        let start = record.data_offset as usize;
        let end = start + record.len as usize;
        self.data
            .get(start..end)
            .ok_or_else(|| Error::PatchCorrupted {
                reason: format!(
                    "insert data out of bounds: offset {} len {} blob {}",
                    record.data_offset,
                    record.len,
                    self.data.len()
                ),
            })
    }
}

/// Serializes deltas into the on-disk container.
pub struct Serializer {
    compression: Compression,
}

impl Serializer {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    /// Write `delta` as a patch. `source_checksum` is recorded in the header;
    /// pass the all-zero digest to mark the source unchecked.
    pub fn serialize_delta(
        &self,
        delta: &Delta,
        source_checksum: [u8; 32],
        writer: &mut impl Write,
    ) -> Result<()> {
        const OP: &str = "serialize patch";

        let mut records = Vec::with_capacity(delta.ops.len());
        let mut blob: Vec<u8> = Vec::new();

        for op in &delta.ops {
            if op.is_empty() {
                continue;
            }
            let record = match op {
                Op::Copy {
                    offset,
                    src_offset,
                    len,
                } => OpRecord {
                    op_type: OP_TYPE_COPY,
                    len: *len,
                    offset: *offset,
                    src_offset: *src_offset,
                    data_offset: 0,
                },
                Op::Insert { offset, data } => {
                    let data_offset = blob.len() as u32;
                    blob.extend_from_slice(data);
                    OpRecord {
                        op_type: OP_TYPE_INSERT,
                        len: data.len() as u32,
                        offset: *offset,
                        src_offset: 0,
                        data_offset,
                    }
                }
                Op::Delete { offset, len } => OpRecord {
                    op_type: OP_TYPE_DELETE,
                    len: *len,
                    offset: *offset,
                    src_offset: 0,
                    data_offset: 0,
                },
            };
            records.push(record);
        }

        let header = PatchHeader {
            compression: self.compression,
            timestamp: unix_now(),
            source_size: delta.source_size as i64,
            target_size: delta.target_size as i64,
            source_checksum,
            target_checksum: delta.checksum,
            operation_count: records.len() as u32,
            data_offset: (HEADER_SIZE + records.len() * OP_RECORD_SIZE) as u32,
        };

        let io_err = |e: std::io::Error| Error::corrupted(OP, e.to_string());
        writer.write_all(&header.marshal()).map_err(io_err)?;
        for record in &records {
            writer.write_all(&record.marshal()).map_err(io_err)?;
        }
        let packed = compress::compress(self.compression, &blob)?;
        writer.write_all(&packed).map_err(io_err)?;
        Ok(())
    }

    /// Serialize into an in-memory buffer, for embedding in tree patches.
    pub fn serialize_to_vec(&self, delta: &Delta, source_checksum: [u8; 32]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.serialize_delta(delta, source_checksum, &mut out)?;
        Ok(out)
    }

    /// Write a patch file at `path`.
    pub fn serialize_to_path(
        &self,
        delta: &Delta,
        source_checksum: [u8; 32],
        path: &Path,
    ) -> Result<()> {
        const OP: &str = "write patch";
        let file = File::create(path).map_err(|e| Error::write(OP, path, e))?;
        let mut writer = BufWriter::new(file);
        self.serialize_delta(delta, source_checksum, &mut writer)?;
        writer.flush().map_err(|e| Error::write(OP, path, e))?;
        Ok(())
    }
}

/// Read and validate a patch container from a reader, decompressing the
/// literal blob.
pub fn deserialize(reader: &mut impl Read) -> Result<PatchFile> {
    const OP: &str = "read patch";
    let io_err = |e: std::io::Error| Error::corrupted(OP, e.to_string());

    let mut header_buf = [0u8; HEADER_SIZE];
    read_exact_or_corrupt(reader, &mut header_buf, "header")?;
    let header = PatchHeader::unmarshal(&header_buf)?;

    let mut records = Vec::with_capacity(header.operation_count as usize);
    let mut record_buf = [0u8; OP_RECORD_SIZE];
    for i in 0..header.operation_count {
        read_exact_or_corrupt(reader, &mut record_buf, "operation table").map_err(|_| {
            Error::PatchCorrupted {
                reason: format!("operation table truncated at record {i}"),
            }
        })?;
        records.push(OpRecord::unmarshal(&record_buf)?);
    }

    let mut packed = Vec::new();
    reader.read_to_end(&mut packed).map_err(io_err)?;

    let literal_len: u64 = records
        .iter()
        .filter(|r| r.op_type == OP_TYPE_INSERT)
        .map(|r| u64::from(r.len))
        .sum();
    let data = compress::decompress(header.compression, &packed, literal_len as usize)?;

    Ok(PatchFile {
        header,
        records,
        data,
    })
}

/// Deserialize a patch from an in-memory buffer (embedded tree-patch entries).
pub fn deserialize_bytes(data: &[u8]) -> Result<PatchFile> {
    let mut cursor = std::io::Cursor::new(data);
    deserialize(&mut cursor)
}

/// Open and deserialize a patch file.
pub fn read_patch(path: &Path) -> Result<PatchFile> {
    const OP: &str = "read patch";
    let file = File::open(path).map_err(|e| Error::read(OP, path, e))?;
    let mut reader = BufReader::new(file);
    deserialize(&mut reader)
}

/// Read only the header of a patch file, for introspection.
pub fn read_header(path: &Path) -> Result<PatchHeader> {
    const OP: &str = "read patch header";
    let mut file = File::open(path).map_err(|e| Error::read(OP, path, e))?;
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut buf)
        .map_err(|e| Error::read(OP, path, e))?;
    PatchHeader::unmarshal(&buf)
}

fn read_exact_or_corrupt(reader: &mut impl Read, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|_| Error::PatchCorrupted {
        reason: format!("{what} truncated"),
    })
}
