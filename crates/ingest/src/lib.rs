//! Alopex Ingest - line-protocol write path for columnar time series tables
//!
//! This crate turns a stream of line-protocol text into rows of
//! append-only, partitioned, memory-mapped column files.
//!
//! # Components
//!
//! - [`ConnectionContext`]: per-connection protocol state machine
//! - [`MeasurementScheduler`]: routes records to single-writer table threads
//! - [`TableWriter`]: row transactions, null filling and schema evolution
//! - [`table::AppendMemory`] / [`table::PartitionIndex`]: on-disk primitives
//!
//! ```text
//! bytes -> ConnectionContext -> SchedulerHandle -> writer thread -> TableWriter
//!                                                                   |-- <column>.d / <column>.i
//!                                                                   `-- _index (commit checkpoint)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_ingest::{ConnectionContext, MeasurementScheduler, ReceiverConfig, ShutdownMode};
//!
//! let config = ReceiverConfig::new("/var/lib/alopex");
//! let scheduler = MeasurementScheduler::new(config.clone())?;
//!
//! // One context per accepted, non-blocking socket
//! let mut ctx = ConnectionContext::new(
//!     stream,
//!     scheduler.handle(),
//!     config.net_msg_buffer_size,
//!     config.max_measurement_size,
//! )?;
//! while ctx.handle_io() {}
//!
//! scheduler.shutdown(ShutdownMode::Drain);
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod table;

pub use config::ReceiverConfig;
pub use error::{IngestError, Result};
pub use protocol::{
    parse_line, ConnectionContext, ConnectionState, ConnectionStats, FieldValue, Measurement,
    ReadStatus, Transport,
};
pub use scheduler::{MeasurementScheduler, SchedulerHandle, SchedulerStats, ShutdownMode};
pub use table::{CellValue, ColumnMeta, ColumnType, PartitionBy, Row, TableMetadata, TableWriter};
