//! Per-connection line-protocol state machine.
//!
//! ```text
//!   buf: [ consumed | unparsed record(s) ........ | free ]
//!        0          start                   end    capacity
//! ```
//!
//! Every [`ConnectionContext::handle_io`] call compacts consumed bytes out of
//! the buffer, performs one non-blocking read into the free space and
//! dispatches every complete line. What remains is at most one incomplete
//! record, which must fit within `max_measurement_size`.
//!
//! ```text
//! AwaitingData -> Parsing -> Dispatched | AwaitingData
//!                         -> Overflowed    (record too large, buffer full)
//!                         -> Disconnected  (peer closed, transport error)
//! ```

use crate::config::LINE_TERMINATOR_LEN;
use crate::error::{IngestError, Result};
use crate::protocol::parser::parse_line;
use crate::scheduler::SchedulerHandle;
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use tracing::{debug, warn};

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were read.
    Data(usize),
    /// No data is available right now.
    WouldBlock,
    /// The peer closed the connection.
    Closed,
}

/// Byte source of one connection.
pub trait Transport {
    /// Reads into `buf` without blocking. `buf` is never empty.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus>;

    /// Closes the connection.
    fn disconnect(&mut self);
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        match Read::read(self, buf) {
            Ok(0) => Ok(ReadStatus::Closed),
            Ok(n) => Ok(ReadStatus::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadStatus::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadStatus::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.shutdown(Shutdown::Both) {
            debug!("Socket shutdown failed: {:?}", e);
        }
    }
}

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the transport to become readable.
    AwaitingData,
    /// Scanning freshly read bytes.
    Parsing,
    /// The last call handed at least one record to the scheduler.
    Dispatched,
    /// Disconnected for sending a record that cannot fit.
    Overflowed,
    /// Closed by the peer, the caller or a transport error.
    Disconnected,
}

impl ConnectionState {
    /// Returns true once the connection has been closed for any reason.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Overflowed | Self::Disconnected)
    }
}

/// Counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Bytes received from the transport.
    pub bytes_read: u64,
    /// Records handed to the scheduler.
    pub records_dispatched: u64,
    /// Records dropped because they failed to parse.
    pub records_dropped: u64,
}

/// Line-protocol context for one connection.
pub struct ConnectionContext<T: Transport> {
    transport: T,
    scheduler: SchedulerHandle,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    scan: usize,
    max_measurement_size: usize,
    state: ConnectionState,
    stats: ConnectionStats,
}

impl<T: Transport> ConnectionContext<T> {
    /// Creates a context with a `buffer_size` receive buffer.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConfig`] if either size is zero or a
    /// `max_measurement_size` record and its `\r\n` do not fit in
    /// `buffer_size`.
    pub fn new(
        transport: T,
        scheduler: SchedulerHandle,
        buffer_size: usize,
        max_measurement_size: usize,
    ) -> Result<Self> {
        if buffer_size == 0
            || max_measurement_size == 0
            || max_measurement_size.saturating_add(LINE_TERMINATOR_LEN) > buffer_size
        {
            return Err(IngestError::InvalidConfig(format!(
                "buffer size {buffer_size} cannot hold measurements of {max_measurement_size} bytes"
            )));
        }
        Ok(Self {
            transport,
            scheduler,
            buf: vec![0u8; buffer_size].into_boxed_slice(),
            start: 0,
            end: 0,
            scan: 0,
            max_measurement_size,
            state: ConnectionState::AwaitingData,
            stats: ConnectionStats::default(),
        })
    }

    /// Current protocol state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connection counters.
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Bytes of the incomplete record held in the buffer.
    pub fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Closes the connection. Records already dispatched are unaffected.
    pub fn close(&mut self) {
        if !self.state.is_closed() {
            self.disconnect(ConnectionState::Disconnected);
        }
    }

    /// Reads once from the transport and dispatches complete records.
    ///
    /// Returns true if bytes were read, meaning the caller should call
    /// again before yielding; false if the transport would block or the
    /// connection is closed.
    pub fn handle_io(&mut self) -> bool {
        if self.state.is_closed() {
            return false;
        }

        self.compact();
        if self.end == self.buf.len() {
            self.overflow(self.end);
            return false;
        }

        let n = match self.transport.read(&mut self.buf[self.end..]) {
            Ok(ReadStatus::Data(n)) if n > 0 => n,
            Ok(ReadStatus::Data(_)) | Ok(ReadStatus::WouldBlock) => {
                self.state = ConnectionState::AwaitingData;
                return false;
            }
            Ok(ReadStatus::Closed) => {
                if self.buffered() > 0 {
                    debug!(
                        "Peer closed with {} bytes of incomplete record",
                        self.buffered()
                    );
                }
                self.disconnect(ConnectionState::Disconnected);
                return false;
            }
            Err(e) => {
                warn!("Transport read failed, disconnecting: {:?}", e);
                self.disconnect(ConnectionState::Disconnected);
                return false;
            }
        };

        self.state = ConnectionState::Parsing;
        self.end += n;
        self.stats.bytes_read += n as u64;

        let dispatched = match self.parse_lines() {
            Ok(dispatched) => dispatched,
            Err(size) => {
                self.overflow(size);
                return true;
            }
        };
        if self.state.is_closed() {
            return true;
        }

        let incomplete = self.buffered();
        if incomplete > self.max_measurement_size {
            self.overflow(incomplete);
        } else if self.start == 0 && self.end == self.buf.len() {
            self.overflow(self.end);
        } else if dispatched > 0 {
            self.state = ConnectionState::Dispatched;
        } else {
            self.state = ConnectionState::AwaitingData;
        }
        true
    }

    /// Dispatches every complete line. Returns the number dispatched, or
    /// the size of an oversized line.
    fn parse_lines(&mut self) -> std::result::Result<usize, usize> {
        let mut dispatched = 0;
        while let Some(pos) = self.buf[self.scan..self.end]
            .iter()
            .position(|&b| b == b'\n')
        {
            let newline = self.scan + pos;
            let mut line_end = newline;
            if line_end > self.start && self.buf[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            let size = line_end - self.start;
            if size > self.max_measurement_size {
                return Err(size);
            }

            let result = parse_line(&self.buf[self.start..line_end]);
            self.start = newline + 1;
            self.scan = self.start;

            match result {
                Ok(Some(measurement)) => {
                    if let Err(e) = self.scheduler.submit(measurement) {
                        warn!("Scheduler rejected record, disconnecting: {}", e);
                        self.disconnect(ConnectionState::Disconnected);
                        return Ok(dispatched);
                    }
                    dispatched += 1;
                    self.stats.records_dispatched += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Dropped malformed record: {}", e);
                    self.stats.records_dropped += 1;
                }
            }
        }
        self.scan = self.end;
        Ok(dispatched)
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.scan -= self.start;
        self.start = 0;
    }

    fn overflow(&mut self, size: usize) {
        let err = IngestError::MeasurementTooLarge {
            size,
            limit: self.max_measurement_size,
        };
        warn!("Disconnecting: {}", err);
        self.disconnect(ConnectionState::Overflowed);
    }

    fn disconnect(&mut self, state: ConnectionState) {
        self.transport.disconnect();
        self.state = state;
        self.start = 0;
        self.end = 0;
        self.scan = 0;
    }
}
