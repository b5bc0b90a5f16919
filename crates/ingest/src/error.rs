//! Error and Result types for the ingestion write path.

use crate::table::ColumnType;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// The error type for the ingestion write path.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Partition index file does not start with the expected magic.
    #[error("Bad partition index header: expected {expected:#x}, got {actual:#x}")]
    BadIndexHeader {
        /// Expected magic value.
        expected: u32,
        /// Magic value found on disk.
        actual: u32,
    },

    /// Partition index column count differs from the table's schema.
    #[error("Column count mismatch: index has {on_disk}, table has {expected}")]
    ColumnCountMismatch {
        /// Column count stored in the index file.
        on_disk: u32,
        /// Column count of the table.
        expected: u32,
    },

    /// Table metadata file is truncated, has a bad magic or a bad checksum.
    #[error("Corrupt table metadata: {0}")]
    CorruptMetadata(String),

    /// A column name was not found in the table.
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    /// A column with this name already exists.
    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    /// Value cannot be stored in a column of this type.
    #[error("Type conflict on column {column}: column is {column_type:?}, value is {value_kind}")]
    TypeConflict {
        /// Column name.
        column: String,
        /// Declared column type.
        column_type: ColumnType,
        /// Shape of the offending value.
        value_kind: &'static str,
    },

    /// Numeric value does not fit the column type.
    #[error("Value out of range for column {column}: {value}")]
    ValueOutOfRange {
        /// Column name.
        column: String,
        /// Offending value.
        value: i64,
    },

    /// Floating-point value is too large for a `Float` column.
    #[error("Value out of range for column {column}: {value}")]
    FloatOutOfRange {
        /// Column name.
        column: String,
        /// Offending value.
        value: f64,
    },

    /// Table or column name cannot be used as a file name.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// A table directory already holds a `_meta` file.
    #[error("Table {0} already exists")]
    TableExists(String),

    /// A table directory has no `_meta` file.
    #[error("Table {0} not found")]
    TableNotFound(String),

    /// A row was started before any partition was opened.
    #[error("Table {0} has no open partition")]
    NoPartition(String),

    /// A timestamp falls outside the current partition and cannot move the
    /// writer forward.
    #[error("Timestamp {timestamp} is outside partition {partition}")]
    TimestampOutsidePartition {
        /// Offending timestamp in microseconds.
        timestamp: i64,
        /// Name of the open partition.
        partition: String,
    },

    /// The same column was set twice within one row.
    #[error("Column {0} already set in this row")]
    ColumnAlreadySet(usize),

    /// A line-protocol record could not be parsed.
    #[error("Malformed line: {0}")]
    MalformedLine(String),

    /// A record exceeds the configured maximum measurement size.
    #[error("Measurement too large: {size} bytes exceeds limit of {limit}")]
    MeasurementTooLarge {
        /// Size of the record seen so far.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Table writer failed fatally earlier and no longer accepts rows.
    #[error("Table {0} is offline")]
    TableOffline(String),

    /// The scheduler has shut down and no longer accepts work.
    #[error("Scheduler is closed")]
    SchedulerClosed,

    /// Configuration values are inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl IngestError {
    /// Returns true if this error must take the whole table writer offline.
    ///
    /// On-disk integrity failures and I/O errors leave the writer in an
    /// unknown state; everything else only affects the current record.
    pub fn is_table_fatal(&self) -> bool {
        matches!(
            self,
            Self::IoError(_)
                | Self::BadIndexHeader { .. }
                | Self::ColumnCountMismatch { .. }
                | Self::CorruptMetadata(_)
        )
    }
}
