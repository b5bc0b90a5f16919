//! Columnar table storage.
//!
//! A table is a directory holding a `_meta` file and one subdirectory per
//! partition. Each partition holds one file pair per column plus a
//! `_index` file recording committed sizes and column tops.
//!
//! ```text
//! <root>/<table>/_meta
//! <root>/<table>/<partition>/_index
//! <root>/<table>/<partition>/<column>.d   primary data
//! <root>/<table>/<partition>/<column>.i   secondary data (string, binary, symbol)
//! ```

pub mod column;
pub mod index;
pub mod meta;
pub mod partition;
pub mod writer;

pub use column::AppendMemory;
pub use index::PartitionIndex;
pub use meta::TableMetadata;
pub use partition::PartitionBy;
pub use writer::{Row, TableWriter};

/// Null code stored in a symbol column's primary file.
pub const SYMBOL_NULL_CODE: i32 = i32::MIN;

/// Length prefix marking a null string value.
pub const NULL_STR_LEN: i32 = -1;

/// Length prefix marking a null binary value.
pub const NULL_BIN_LEN: i64 = -1;

/// Returns true if `name` can be used as a table directory or column file
/// name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control())
}

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnType {
    /// One byte, 0 or 1.
    Boolean = 1,
    /// Signed 8-bit integer.
    Byte = 2,
    /// Signed 16-bit integer.
    Short = 3,
    /// Signed 32-bit integer.
    Int = 4,
    /// Signed 64-bit integer.
    Long = 5,
    /// Milliseconds since epoch.
    Date = 6,
    /// Microseconds since epoch.
    Timestamp = 7,
    /// 32-bit IEEE float.
    Float = 8,
    /// 64-bit IEEE float.
    Double = 9,
    /// Length-prefixed UTF-8 string.
    String = 10,
    /// Length-prefixed byte array.
    Binary = 11,
    /// Dictionary-encoded string.
    Symbol = 12,
}

impl ColumnType {
    /// Creates a ColumnType from its on-disk tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Boolean),
            2 => Some(Self::Byte),
            3 => Some(Self::Short),
            4 => Some(Self::Int),
            5 => Some(Self::Long),
            6 => Some(Self::Date),
            7 => Some(Self::Timestamp),
            8 => Some(Self::Float),
            9 => Some(Self::Double),
            10 => Some(Self::String),
            11 => Some(Self::Binary),
            12 => Some(Self::Symbol),
            _ => None,
        }
    }

    /// Width in bytes of one primary value, or `None` for variable-length types.
    ///
    /// Symbol columns store fixed-width `i32` codes in the primary file.
    pub fn primary_width(self) -> Option<usize> {
        match self {
            Self::Boolean | Self::Byte => Some(1),
            Self::Short => Some(2),
            Self::Int | Self::Float | Self::Symbol => Some(4),
            Self::Long | Self::Date | Self::Timestamp | Self::Double => Some(8),
            Self::String | Self::Binary => None,
        }
    }

    /// Returns true if the column owns a secondary file.
    ///
    /// Strings and binaries keep per-row `i64` offsets there; symbols keep
    /// their dictionary there.
    pub fn has_secondary(self) -> bool {
        matches!(self, Self::String | Self::Binary | Self::Symbol)
    }

    /// Number of rows physically present given the committed file sizes.
    pub fn rows_from_sizes(self, primary_size: u64, secondary_size: u64) -> u64 {
        match self.primary_width() {
            Some(width) => primary_size / width as u64,
            None => secondary_size / 8,
        }
    }
}

/// Name and type of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Column name, unique within the table.
    pub name: String,
    /// Storage type.
    pub column_type: ColumnType,
}

impl ColumnMeta {
    /// Creates a new column description.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// A single decoded cell, or a value to be written into one.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// Null of any type.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// 8-bit integer.
    Byte(i8),
    /// 16-bit integer.
    Short(i16),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Milliseconds since epoch.
    Date(i64),
    /// Microseconds since epoch.
    Timestamp(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// String value.
    Str(String),
    /// Binary value.
    Binary(Vec<u8>),
    /// Symbol value.
    Symbol(String),
}

impl CellValue {
    /// Returns true for [`CellValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}
