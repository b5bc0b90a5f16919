//! Shared helpers for the integration tests.

#![allow(dead_code)]

use alopex_ingest::{
    CellValue, ConnectionContext, MeasurementScheduler, PartitionBy, ReadStatus, ReceiverConfig,
    TableWriter, Transport,
};
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Receive buffer size used by the connection tests.
pub const BUFFER_SIZE: usize = 512;

/// Maximum record size used by the connection tests.
pub const MAX_MEASUREMENT_SIZE: usize = 128;

/// Column file extent used by the tests.
pub const EXTENT: usize = 64 * 1024;

/// Seven weather records sharing one table.
pub const WEATHER: &str = "weather,location=us-midwest temperature=82 1465839830100400200\n\
weather,location=us-midwest temperature=83 1465839830100500200\n\
weather,location=us-eastcoast temperature=81 1465839830101400200\n\
weather,location=us-midwest temperature=85 1465839830102300200\n\
weather,location=us-eastcoast temperature=89 1465839830102400200\n\
weather,location=us-eastcoast temperature=80 1465839830102400200\n\
weather,location=us-westcost temperature=82 1465839830102500200\n";

/// Expected `(location, temperature, timestamp micros)` rows for [`WEATHER`].
pub const WEATHER_ROWS: [(&str, f64, i64); 7] = [
    ("us-midwest", 82.0, 1_465_839_830_100_400),
    ("us-midwest", 83.0, 1_465_839_830_100_500),
    ("us-eastcoast", 81.0, 1_465_839_830_101_400),
    ("us-midwest", 85.0, 1_465_839_830_102_300),
    ("us-eastcoast", 89.0, 1_465_839_830_102_400),
    ("us-eastcoast", 80.0, 1_465_839_830_102_400),
    ("us-westcost", 82.0, 1_465_839_830_102_500),
];

/// In-memory transport fed by the test.
///
/// Each read copies as much of the front chunk as fits. An exhausted
/// script would block until [`ScriptedTransport::close`] is called.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    chunks: VecDeque<Vec<u8>>,
    closed: bool,
    disconnected: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes for subsequent reads.
    pub fn push(&mut self, bytes: impl AsRef<[u8]>) {
        self.chunks.push_back(bytes.as_ref().to_vec());
    }

    /// Makes reads return `Closed` once queued bytes are consumed.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Bytes queued but not yet read.
    pub fn unread(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// True once the context has disconnected the transport.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        let Some(chunk) = self.chunks.front_mut() else {
            return Ok(if self.closed {
                ReadStatus::Closed
            } else {
                ReadStatus::WouldBlock
            });
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.chunks.pop_front();
        }
        Ok(ReadStatus::Data(n))
    }

    fn disconnect(&mut self) {
        self.disconnected = true;
    }
}

/// Configuration with small buffers and no partitioning.
pub fn test_config(root: &Path) -> ReceiverConfig {
    ReceiverConfig::new(root)
        .with_net_msg_buffer_size(BUFFER_SIZE)
        .with_max_measurement_size(MAX_MEASUREMENT_SIZE)
        .with_partition_by(PartitionBy::None)
        .with_mapping_extent(EXTENT)
        .with_commit_interval(Duration::from_secs(60))
}

/// Creates a connection context over a fresh scripted transport.
pub fn connect(scheduler: &MeasurementScheduler) -> ConnectionContext<ScriptedTransport> {
    ConnectionContext::new(
        ScriptedTransport::new(),
        scheduler.handle(),
        BUFFER_SIZE,
        MAX_MEASUREMENT_SIZE,
    )
    .unwrap()
}

/// Pushes `bytes` and drives the context until the script is drained.
pub fn feed(ctx: &mut ConnectionContext<ScriptedTransport>, bytes: impl AsRef<[u8]>) {
    ctx.transport_mut().push(bytes);
    while ctx.handle_io() {}
}

/// Closes the peer side and drives the context until it disconnects.
pub fn finish(ctx: &mut ConnectionContext<ScriptedTransport>) {
    ctx.transport_mut().close();
    let mut iterations = 256;
    while ctx.handle_io() && iterations > 0 {
        iterations -= 1;
    }
    assert!(ctx.state().is_closed());
    assert!(ctx.transport().is_disconnected());
}

/// Opens a committed table for reading back its rows.
pub fn open_table(root: &Path, name: &str) -> TableWriter {
    TableWriter::open(root.join(name), EXTENT).unwrap()
}

/// Reads every row of the open partition, one `Vec` per row.
pub fn rows(writer: &TableWriter) -> Vec<Vec<CellValue>> {
    (0..writer.row_count())
        .map(|row| {
            (0..writer.column_count())
                .map(|column| writer.value_at(column, row).unwrap())
                .collect()
        })
        .collect()
}

/// Asserts the table holds exactly the [`WEATHER`] rows.
pub fn assert_weather(root: &Path) {
    let writer = open_table(root, "weather");
    let names: Vec<&str> = writer.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["location", "temperature", "timestamp"]);

    let expected: Vec<Vec<CellValue>> = WEATHER_ROWS
        .iter()
        .map(|(location, temperature, ts)| {
            vec![
                CellValue::Symbol(location.to_string()),
                CellValue::Double(*temperature),
                CellValue::Timestamp(*ts),
            ]
        })
        .collect();
    assert_eq!(rows(&writer), expected);
}
