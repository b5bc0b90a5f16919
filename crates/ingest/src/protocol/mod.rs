//! Line protocol: record types, parser and per-connection state machine.
//!
//! ```text
//! measurement[,tag=value]* field=value[,field=value]* [timestamp]\n
//! ```
//!
//! Timestamps are integer nanoseconds since the epoch and are stored at
//! microsecond resolution, truncated.

pub mod connection;
pub mod parser;

pub use connection::{ConnectionContext, ConnectionState, ConnectionStats, ReadStatus, Transport};
pub use parser::parse_line;

use crate::table::ColumnType;
use std::time::{SystemTime, UNIX_EPOCH};

/// A parsed field value, typed by its literal shape.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `123i`
    Integer(i64),
    /// `82`, `1.5`, `-2e3`
    Float(f64),
    /// `t`, `true`, `F`, `false`, ...
    Boolean(bool),
    /// `"text"`
    Str(String),
}

impl FieldValue {
    /// Column type created for a first-seen field with this value.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Integer(_) => ColumnType::Long,
            Self::Float(_) => ColumnType::Double,
            Self::Boolean(_) => ColumnType::Boolean,
            Self::Str(_) => ColumnType::String,
        }
    }

    /// Short name of the literal shape, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::Str(_) => "string",
        }
    }
}

/// One line-protocol record.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Target table.
    pub table: String,
    /// Tag keys and values in input order.
    pub tags: Vec<(String, String)>,
    /// Field keys and values in input order.
    pub fields: Vec<(String, FieldValue)>,
    /// Nanoseconds since epoch, if the record carried one.
    pub timestamp: Option<i64>,
}

impl Measurement {
    /// Record timestamp in microseconds, truncated from nanoseconds.
    pub fn timestamp_micros(&self) -> Option<i64> {
        self.timestamp.map(|nanos| nanos / 1_000)
    }
}

/// Current wall-clock time in microseconds since epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
