//! Receiver configuration.
//!
//! All values are read-only inputs to the write path. How they are loaded
//! (file, environment, flags) is up to the embedding process.

use crate::error::{IngestError, Result};
use crate::table::PartitionBy;
use std::path::PathBuf;
use std::time::Duration;

/// Default network receive buffer size: 64 KiB.
pub const DEFAULT_NET_MSG_BUFFER_SIZE: usize = 64 * 1024;

/// Default maximum size of a single line-protocol record: 2 KiB.
pub const DEFAULT_MAX_MEASUREMENT_SIZE: usize = 2 * 1024;

/// Default number of writer threads.
pub const DEFAULT_WRITER_THREADS: usize = 2;

/// Default number of appended rows after which a table is committed.
pub const DEFAULT_COMMIT_ROW_COUNT: u64 = 10_000;

/// Default maximum time between commits of a table with pending rows.
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Longest line terminator (`\r\n`) the receive buffer must hold after a
/// maximal record.
pub const LINE_TERMINATOR_LEN: usize = 2;

/// Default extent by which column files grow: 16 MiB.
pub const DEFAULT_MAPPING_EXTENT: usize = 4096 * 4096;

/// Configuration for the line-protocol receiver and its writers.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Root directory holding one subdirectory per table.
    pub root: PathBuf,

    /// Capacity of each connection's receive buffer.
    pub net_msg_buffer_size: usize,

    /// Maximum length of a single record, excluding the line terminator.
    ///
    /// Together with [`LINE_TERMINATOR_LEN`] it must fit in
    /// `net_msg_buffer_size`.
    pub max_measurement_size: usize,

    /// Number of writer threads; each table is owned by exactly one.
    pub writer_threads: usize,

    /// Partition scheme for tables created by the receiver.
    pub partition_by: PartitionBy,

    /// Commit a table once this many rows are pending.
    pub commit_row_count: u64,

    /// Commit a table with pending rows at least this often.
    pub commit_interval: Duration,

    /// Size of the extents column files grow by. Multiple of 4096.
    pub mapping_extent: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./db"),
            net_msg_buffer_size: DEFAULT_NET_MSG_BUFFER_SIZE,
            max_measurement_size: DEFAULT_MAX_MEASUREMENT_SIZE,
            writer_threads: DEFAULT_WRITER_THREADS,
            partition_by: PartitionBy::Day,
            commit_row_count: DEFAULT_COMMIT_ROW_COUNT,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            mapping_extent: DEFAULT_MAPPING_EXTENT,
        }
    }
}

impl ReceiverConfig {
    /// Creates a default configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Sets the connection receive buffer size.
    pub fn with_net_msg_buffer_size(mut self, size: usize) -> Self {
        self.net_msg_buffer_size = size;
        self
    }

    /// Sets the maximum single-record size.
    pub fn with_max_measurement_size(mut self, size: usize) -> Self {
        self.max_measurement_size = size;
        self
    }

    /// Sets the writer thread count.
    pub fn with_writer_threads(mut self, threads: usize) -> Self {
        self.writer_threads = threads;
        self
    }

    /// Sets the partition scheme for new tables.
    pub fn with_partition_by(mut self, partition_by: PartitionBy) -> Self {
        self.partition_by = partition_by;
        self
    }

    /// Sets the pending-row threshold for commits.
    pub fn with_commit_row_count(mut self, rows: u64) -> Self {
        self.commit_row_count = rows;
        self
    }

    /// Sets the maximum interval between commits.
    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// Sets the column file growth extent.
    pub fn with_mapping_extent(mut self, extent: usize) -> Self {
        self.mapping_extent = extent;
        self
    }

    /// Checks that the values are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.net_msg_buffer_size == 0 {
            return Err(IngestError::InvalidConfig(
                "net_msg_buffer_size must be positive".to_string(),
            ));
        }
        if self.max_measurement_size == 0 {
            return Err(IngestError::InvalidConfig(
                "max_measurement_size must be positive".to_string(),
            ));
        }
        let needed = self.max_measurement_size.saturating_add(LINE_TERMINATOR_LEN);
        if needed > self.net_msg_buffer_size {
            return Err(IngestError::InvalidConfig(format!(
                "net_msg_buffer_size {} cannot hold a {} byte measurement and its terminator",
                self.net_msg_buffer_size, self.max_measurement_size
            )));
        }
        if self.writer_threads == 0 {
            return Err(IngestError::InvalidConfig(
                "writer_threads must be positive".to_string(),
            ));
        }
        if self.mapping_extent == 0 || self.mapping_extent % 4096 != 0 {
            return Err(IngestError::InvalidConfig(format!(
                "mapping_extent {} is not a positive multiple of 4096",
                self.mapping_extent
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReceiverConfig::default();
        assert_eq!(config.root, PathBuf::from("./db"));
        assert_eq!(config.net_msg_buffer_size, 64 * 1024);
        assert_eq!(config.max_measurement_size, 2 * 1024);
        assert_eq!(config.writer_threads, 2);
        assert_eq!(config.partition_by, PartitionBy::Day);
        assert_eq!(config.mapping_extent, 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ReceiverConfig::new("/tmp/ingest")
            .with_net_msg_buffer_size(512)
            .with_max_measurement_size(128)
            .with_writer_threads(5)
            .with_partition_by(PartitionBy::None)
            .with_commit_row_count(100)
            .with_commit_interval(Duration::from_millis(50))
            .with_mapping_extent(64 * 1024);

        assert_eq!(config.root, PathBuf::from("/tmp/ingest"));
        assert_eq!(config.net_msg_buffer_size, 512);
        assert_eq!(config.max_measurement_size, 128);
        assert_eq!(config.writer_threads, 5);
        assert_eq!(config.partition_by, PartitionBy::None);
        assert_eq!(config.commit_row_count, 100);
        assert_eq!(config.commit_interval, Duration::from_millis(50));
        assert_eq!(config.mapping_extent, 64 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_sizes() {
        let config = ReceiverConfig::default()
            .with_net_msg_buffer_size(128)
            .with_max_measurement_size(256);
        assert!(matches!(
            config.validate(),
            Err(IngestError::InvalidConfig(_))
        ));

        let config = ReceiverConfig::default()
            .with_net_msg_buffer_size(256)
            .with_max_measurement_size(256);
        assert!(config.validate().is_err());

        let config = ReceiverConfig::default()
            .with_net_msg_buffer_size(258)
            .with_max_measurement_size(256);
        assert!(config.validate().is_ok());

        let config = ReceiverConfig::default().with_writer_threads(0);
        assert!(config.validate().is_err());

        let config = ReceiverConfig::default().with_mapping_extent(1000);
        assert!(config.validate().is_err());
    }
}
