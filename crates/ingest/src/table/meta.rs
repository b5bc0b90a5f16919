//! Table metadata file (`_meta`).
//!
//! ```text
//! magic            4 bytes  "META"
//! version          u16
//! partition_by     u8
//! timestamp index  i32      (-1 if the table has no designated timestamp)
//! column count     u32
//! per column:      type u8, name length u16, name bytes (UTF-8)
//! crc32            u32      over every preceding byte
//! ```
//!
//! The file is replaced atomically on every schema change.

use crate::error::{IngestError, Result};
use crate::table::{ColumnMeta, ColumnType, PartitionBy};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Metadata file name inside a table directory.
pub const META_FILE_NAME: &str = "_meta";

const META_TMP_FILE_NAME: &str = "_meta.tmp";

/// Magic bytes for the metadata file.
pub const META_MAGIC: [u8; 4] = *b"META";

/// Current metadata format version.
pub const META_VERSION: u16 = 1;

/// Schema and partitioning of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    /// Partition scheme.
    pub partition_by: PartitionBy,
    /// Index of the designated timestamp column, if any.
    pub timestamp_index: Option<usize>,
    /// Columns in their stable order.
    pub columns: Vec<ColumnMeta>,
}

impl TableMetadata {
    /// Creates metadata for a new table.
    pub fn new(
        partition_by: PartitionBy,
        columns: Vec<ColumnMeta>,
        timestamp_index: Option<usize>,
    ) -> Self {
        Self {
            partition_by,
            timestamp_index,
            columns,
        }
    }

    /// Returns the index of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Serializes the metadata including its trailing checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(16 + self.columns.len() * 16);
        bytes.extend_from_slice(&META_MAGIC);
        bytes.extend_from_slice(&META_VERSION.to_le_bytes());
        bytes.push(self.partition_by as u8);
        let ts = self.timestamp_index.map(|i| i as i32).unwrap_or(-1);
        bytes.extend_from_slice(&ts.to_le_bytes());
        bytes.extend_from_slice(&(self.columns.len() as u32).to_le_bytes());
        for column in &self.columns {
            let name_len = u16::try_from(column.name.len()).map_err(|_| {
                IngestError::InvalidConfig(format!("column name too long: {}", column.name))
            })?;
            bytes.push(column.column_type as u8);
            bytes.extend_from_slice(&name_len.to_le_bytes());
            bytes.extend_from_slice(column.name.as_bytes());
        }
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    /// Deserializes metadata, verifying magic, version and checksum.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 19 {
            return Err(IngestError::CorruptMetadata("file too short".to_string()));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let expected = u32::from_le_bytes(crc_bytes.try_into().unwrap_or_default());
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(IngestError::CorruptMetadata(format!(
                "checksum mismatch: expected {expected:#x}, got {actual:#x}"
            )));
        }

        let mut reader = ByteReader::new(body);
        if reader.take(4)? != META_MAGIC {
            return Err(IngestError::CorruptMetadata("bad magic".to_string()));
        }
        let version = reader.u16()?;
        if version != META_VERSION {
            return Err(IngestError::CorruptMetadata(format!(
                "unsupported version {version}"
            )));
        }
        let partition_by = PartitionBy::from_u8(reader.u8()?)
            .ok_or_else(|| IngestError::CorruptMetadata("unknown partition scheme".to_string()))?;
        let ts = reader.i32()?;
        let count = reader.u32()? as usize;

        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = reader.u8()?;
            let column_type = ColumnType::from_u8(tag).ok_or_else(|| {
                IngestError::CorruptMetadata(format!("unknown column type {tag}"))
            })?;
            let len = reader.u16()? as usize;
            let name = std::str::from_utf8(reader.take(len)?)
                .map_err(|_| IngestError::CorruptMetadata("column name not UTF-8".to_string()))?;
            columns.push(ColumnMeta::new(name, column_type));
        }

        let timestamp_index = match ts {
            -1 => None,
            i if i >= 0 && (i as usize) < count => Some(i as usize),
            i => {
                return Err(IngestError::CorruptMetadata(format!(
                    "timestamp index {i} out of range"
                )))
            }
        };

        Ok(Self {
            partition_by,
            timestamp_index,
            columns,
        })
    }

    /// Loads `_meta` from a table directory, or `None` if it does not exist.
    pub fn load(table_dir: &Path) -> Result<Option<Self>> {
        match fs::read(table_dir.join(META_FILE_NAME)) {
            Ok(bytes) => Self::from_bytes(&bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes `_meta` into `table_dir` using tmp file, fsync and rename.
    pub fn store(&self, table_dir: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let tmp_path = table_dir.join(META_TMP_FILE_NAME);
        let final_path = table_dir.join(META_FILE_NAME);

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        File::open(table_dir)?.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;
        File::open(table_dir)?.sync_all()?;
        Ok(())
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(IngestError::CorruptMetadata("unexpected end of file".to_string()));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn i32(&mut self) -> Result<i32> {
        self.array().map(i32::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }
}
