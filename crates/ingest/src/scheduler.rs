//! Measurement scheduler: routes records to single-writer table threads.
//!
//! ```text
//!  connection ──submit──┐
//!  connection ──submit──┼──> xxh3(table) % N ──> [queue 0] ──> writer thread 0 ─> tables {a, d}
//!  connection ──submit──┘                   └──> [queue 1] ──> writer thread 1 ─> tables {b, c}
//! ```
//!
//! Each table is owned by exactly one writer thread for the life of the
//! scheduler, so a [`TableWriter`] is never touched by two threads. Writer
//! threads resolve or create tables, evolve their schema, append rows and
//! commit on a row-count or time trigger.

use crate::config::ReceiverConfig;
use crate::error::{IngestError, Result};
use crate::protocol::{now_micros, FieldValue, Measurement};
use crate::table::{
    is_valid_name, CellValue, ColumnMeta, ColumnType, TableMetadata, TableWriter,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Name of the designated timestamp column of line-protocol tables.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// How [`MeasurementScheduler::shutdown`] treats queued and pending rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Apply every queued record, then commit and sync every table.
    Drain,
    /// Drop queued records and close writers without committing.
    Discard,
}

/// Scheduler counters.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Records written to a table.
    pub records_applied: AtomicU64,
    /// Records dropped for any reason.
    pub records_dropped: AtomicU64,
    /// Tables taken offline after a fatal error.
    pub tables_offline: AtomicU64,
    /// Table commits performed.
    pub commits: AtomicU64,
}

impl SchedulerStats {
    /// Gets the number of applied records.
    pub fn records_applied(&self) -> u64 {
        self.records_applied.load(Ordering::Relaxed)
    }

    /// Gets the number of dropped records.
    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    /// Gets the number of offline tables.
    pub fn tables_offline(&self) -> u64 {
        self.tables_offline.load(Ordering::Relaxed)
    }

    /// Gets the number of commits.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

enum WriterTask {
    Measurement(Measurement),
    Commit(Sender<()>),
    Shutdown,
}

struct Shared {
    stats: SchedulerStats,
    offline: RwLock<BTreeSet<String>>,
    discard: AtomicBool,
    /// Set once shutdown begins. Submits hold the read lock while they
    /// enqueue, so no record can land behind a `Shutdown` task.
    closed: RwLock<bool>,
}

/// Cloneable submit entry point handed to connections.
#[derive(Clone)]
pub struct SchedulerHandle {
    senders: Arc<[Sender<WriterTask>]>,
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Queues a record for its table's writer thread. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::SchedulerClosed`] after shutdown.
    pub fn submit(&self, measurement: Measurement) -> Result<()> {
        let closed = self.shared.closed.read().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return Err(IngestError::SchedulerClosed);
        }
        let worker = route(&measurement.table, self.senders.len());
        self.senders[worker]
            .send(WriterTask::Measurement(measurement))
            .map_err(|_| IngestError::SchedulerClosed)
    }

    /// Number of writer threads.
    pub fn writer_threads(&self) -> usize {
        self.senders.len()
    }
}

/// Index of the writer thread that owns `table`.
pub fn route(table: &str, writer_threads: usize) -> usize {
    (xxh3_64(table.as_bytes()) % writer_threads.max(1) as u64) as usize
}

/// Fixed pool of writer threads, each owning a disjoint set of tables.
///
/// # Examples
/// ```rust,ignore
/// use alopex_ingest::{MeasurementScheduler, ReceiverConfig, ShutdownMode};
///
/// let scheduler = MeasurementScheduler::new(ReceiverConfig::new("/data"))?;
/// let handle = scheduler.handle();
/// // hand `handle` to connection contexts ...
/// scheduler.commit_all()?;
/// scheduler.shutdown(ShutdownMode::Drain);
/// ```
pub struct MeasurementScheduler {
    handle: SchedulerHandle,
    threads: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl MeasurementScheduler {
    /// Validates `config` and spawns `config.writer_threads` writer threads.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConfig`] for a bad configuration and
    /// an I/O error if the root directory or a thread cannot be created.
    pub fn new(config: ReceiverConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;

        let shared = Arc::new(Shared {
            stats: SchedulerStats::default(),
            offline: RwLock::new(BTreeSet::new()),
            discard: AtomicBool::new(false),
            closed: RwLock::new(false),
        });
        let config = Arc::new(config);

        let mut senders = Vec::with_capacity(config.writer_threads);
        let mut threads = Vec::with_capacity(config.writer_threads);
        for id in 0..config.writer_threads {
            let (tx, rx) = mpsc::channel();
            let worker = Worker {
                id,
                config: Arc::clone(&config),
                shared: Arc::clone(&shared),
                tables: HashMap::new(),
            };
            let thread = thread::Builder::new()
                .name(format!("ingest-writer-{id}"))
                .spawn(move || worker.run(rx))?;
            senders.push(tx);
            threads.push(thread);
        }

        Ok(Self {
            handle: SchedulerHandle {
                senders: senders.into(),
                shared: Arc::clone(&shared),
            },
            threads,
            shared,
        })
    }

    /// Returns a handle for submitting records.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Queues a record for its table's writer thread.
    pub fn submit(&self, measurement: Measurement) -> Result<()> {
        self.handle.submit(measurement)
    }

    /// Commits every table and waits until all writer threads are done.
    ///
    /// Records submitted before this call are applied first.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::SchedulerClosed`] if a writer thread is gone.
    pub fn commit_all(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        for sender in self.handle.senders.iter() {
            sender
                .send(WriterTask::Commit(ack_tx.clone()))
                .map_err(|_| IngestError::SchedulerClosed)?;
        }
        drop(ack_tx);
        for _ in 0..self.handle.senders.len() {
            ack_rx.recv().map_err(|_| IngestError::SchedulerClosed)?;
        }
        Ok(())
    }

    /// Scheduler counters.
    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    /// Tables taken offline after a fatal error, sorted by name.
    pub fn offline_tables(&self) -> Vec<String> {
        self.shared
            .offline
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Stops every writer thread and waits for it to exit.
    pub fn shutdown(mut self, mode: ShutdownMode) {
        self.stop(mode);
    }

    fn stop(&mut self, mode: ShutdownMode) {
        if self.threads.is_empty() {
            return;
        }
        if mode == ShutdownMode::Discard {
            self.shared.discard.store(true, Ordering::SeqCst);
        }
        {
            let mut closed = self.shared.closed.write().unwrap_or_else(|e| e.into_inner());
            *closed = true;
            for sender in self.handle.senders.iter() {
                let _ = sender.send(WriterTask::Shutdown);
            }
        }
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("ingest-writer").to_string();
            if thread.join().is_err() {
                error!("Writer thread {} panicked", name);
            }
        }
        debug!("Scheduler stopped ({:?})", mode);
    }
}

impl Drop for MeasurementScheduler {
    fn drop(&mut self) {
        self.stop(ShutdownMode::Drain);
    }
}

enum TableSlot {
    Online {
        writer: Box<TableWriter>,
        last_commit: Instant,
    },
    Offline,
}

struct Worker {
    id: usize,
    config: Arc<ReceiverConfig>,
    shared: Arc<Shared>,
    tables: HashMap<String, TableSlot>,
}

impl Worker {
    fn run(mut self, rx: Receiver<WriterTask>) {
        debug!("Writer thread {} started", self.id);
        let mut last_sweep = Instant::now();
        let mut discarded = 0u64;
        loop {
            match rx.recv_timeout(self.config.commit_interval) {
                Ok(WriterTask::Measurement(measurement)) => {
                    if self.shared.discard.load(Ordering::SeqCst) {
                        self.shared.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
                        discarded += 1;
                        continue;
                    }
                    self.apply(measurement);
                }
                Ok(WriterTask::Commit(ack)) => {
                    self.commit_tables(|_| true);
                    let _ = ack.send(());
                }
                Ok(WriterTask::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if last_sweep.elapsed() >= self.config.commit_interval {
                let interval = self.config.commit_interval;
                self.commit_tables(|last_commit| last_commit.elapsed() >= interval);
                last_sweep = Instant::now();
            }
        }

        if discarded > 0 {
            warn!(
                "Writer thread {} discarded {} queued records on shutdown",
                self.id, discarded
            );
        }
        if self.shared.discard.load(Ordering::SeqCst) {
            debug!(
                "Writer thread {} discarding {} tables",
                self.id,
                self.tables.len()
            );
            self.tables.clear();
        } else {
            self.commit_tables(|_| true);
            for (name, slot) in &self.tables {
                if let TableSlot::Online { writer, .. } = slot {
                    if let Err(e) = writer.sync() {
                        error!("Failed to sync table {} on shutdown: {}", name, e);
                    }
                }
            }
        }
        debug!("Writer thread {} stopped", self.id);
    }

    fn apply(&mut self, measurement: Measurement) {
        match self.write(&measurement) {
            Ok(()) => {
                self.shared.stats.records_applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) if err.is_table_fatal() => {
                self.take_offline(&measurement.table, &err);
                warn!("Dropped record for table {}: {}", measurement.table, err);
                self.shared.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!("Dropped record for table {}: {}", measurement.table, err);
                self.shared.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn take_offline(&mut self, table: &str, err: &IngestError) {
        error!("Table {} taken offline: {}", table, err);
        self.tables.insert(table.to_string(), TableSlot::Offline);
        self.shared
            .offline
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.to_string());
        self.shared.stats.tables_offline.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&mut self, m: &Measurement) -> Result<()> {
        check_keys(m)?;
        let timestamp = m.timestamp_micros().unwrap_or_else(now_micros);
        let commit_row_count = self.config.commit_row_count;

        let writer = self.writer_for(m)?;

        // Coerce every value before touching the table so a bad record
        // leaves no trace.
        let mut cells = Vec::with_capacity(m.tags.len() + m.fields.len());
        let mut new_columns = Vec::new();
        for (key, value) in &m.tags {
            match writer.column_index(key) {
                Some(i) => cells.push((i, coerce_tag(&writer.columns()[i], value)?)),
                None => new_columns.push((
                    key.as_str(),
                    ColumnType::Symbol,
                    CellValue::Symbol(value.clone()),
                )),
            }
        }
        for (key, value) in &m.fields {
            match writer.column_index(key) {
                Some(i) => cells.push((i, coerce_field(&writer.columns()[i], value)?)),
                None => new_columns.push((key.as_str(), value.column_type(), field_cell(value))),
            }
        }

        writer.switch_partition(timestamp)?;
        for (name, column_type, cell) in new_columns {
            let index = writer.add_column(name, column_type)?;
            cells.push((index, cell));
        }

        let timestamp_index = writer.timestamp_index();
        let mut row = writer.new_row()?;
        for (index, cell) in &cells {
            row.put_value(*index, cell)?;
        }
        if let Some(ts) = timestamp_index {
            row.put_timestamp(ts, timestamp)?;
        }
        row.append()?;

        if writer.pending_rows() >= commit_row_count {
            self.commit_table(&m.table);
        }
        Ok(())
    }

    fn writer_for(&mut self, m: &Measurement) -> Result<&mut TableWriter> {
        if !self.tables.contains_key(&m.table) {
            let writer = self.open_table(m)?;
            self.tables.insert(
                m.table.clone(),
                TableSlot::Online {
                    writer: Box::new(writer),
                    last_commit: Instant::now(),
                },
            );
        }
        match self.tables.get_mut(&m.table) {
            Some(TableSlot::Online { writer, .. }) => Ok(&mut **writer),
            _ => Err(IngestError::TableOffline(m.table.clone())),
        }
    }

    fn open_table(&self, m: &Measurement) -> Result<TableWriter> {
        if !is_valid_name(&m.table) {
            return Err(IngestError::InvalidName(m.table.clone()));
        }
        let dir = self.config.root.join(&m.table);
        let extent = self.config.mapping_extent;
        if TableMetadata::load(&dir)?.is_some() {
            debug!("Writer thread {} opening table {}", self.id, m.table);
            return TableWriter::open(&dir, extent);
        }

        // Tags first, then fields, then the designated timestamp. Values
        // are written by the caller once the table exists.
        let mut columns: Vec<ColumnMeta> = m
            .tags
            .iter()
            .map(|(key, _)| ColumnMeta::new(key.as_str(), ColumnType::Symbol))
            .collect();
        columns.extend(
            m.fields
                .iter()
                .map(|(key, value)| ColumnMeta::new(key.as_str(), value.column_type())),
        );
        columns.push(ColumnMeta::new(TIMESTAMP_COLUMN, ColumnType::Timestamp));
        let timestamp_index = columns.len() - 1;

        let metadata = TableMetadata::new(self.config.partition_by, columns, Some(timestamp_index));
        TableWriter::create(&dir, metadata, extent)
    }

    fn commit_table(&mut self, table: &str) {
        let result = match self.tables.get_mut(table) {
            Some(TableSlot::Online {
                writer,
                last_commit,
            }) => {
                *last_commit = Instant::now();
                writer.commit()
            }
            _ => return,
        };
        match result {
            Ok(()) => {
                self.shared.stats.commits.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.take_offline(table, &err),
        }
    }

    fn commit_tables(&mut self, due: impl Fn(&Instant) -> bool) {
        let names: Vec<String> = self
            .tables
            .iter()
            .filter_map(|(name, slot)| match slot {
                TableSlot::Online {
                    writer,
                    last_commit,
                } if writer.pending_rows() > 0 && due(last_commit) => Some(name.clone()),
                _ => None,
            })
            .collect();
        for name in names {
            self.commit_table(&name);
        }
    }
}

/// Rejects records that repeat a key or use a reserved or unusable name.
fn check_keys(m: &Measurement) -> Result<()> {
    let keys = m
        .tags
        .iter()
        .map(|(k, _)| k)
        .chain(m.fields.iter().map(|(k, _)| k));
    let mut seen = BTreeSet::new();
    for key in keys {
        if !is_valid_name(key) {
            return Err(IngestError::InvalidName(key.clone()));
        }
        if key == TIMESTAMP_COLUMN || !seen.insert(key.as_str()) {
            return Err(IngestError::DuplicateColumn(key.clone()));
        }
    }
    Ok(())
}

fn coerce_tag(column: &ColumnMeta, value: &str) -> Result<CellValue> {
    match column.column_type {
        ColumnType::Symbol => Ok(CellValue::Symbol(value.to_string())),
        ColumnType::String => Ok(CellValue::Str(value.to_string())),
        column_type => Err(IngestError::TypeConflict {
            column: column.name.clone(),
            column_type,
            value_kind: "symbol",
        }),
    }
}

fn field_cell(value: &FieldValue) -> CellValue {
    match value {
        FieldValue::Integer(v) => CellValue::Long(*v),
        FieldValue::Float(v) => CellValue::Double(*v),
        FieldValue::Boolean(v) => CellValue::Boolean(*v),
        FieldValue::Str(v) => CellValue::Str(v.clone()),
    }
}

/// Converts a field value into the type of an existing column.
///
/// Integers are range-checked; the null sentinel of the target type is out
/// of range. A finite double too large for a `Float` column is out of range.
fn coerce_field(column: &ColumnMeta, value: &FieldValue) -> Result<CellValue> {
    let out_of_range = |v: i64| IngestError::ValueOutOfRange {
        column: column.name.clone(),
        value: v,
    };
    let cell = match (column.column_type, value) {
        (ColumnType::Byte, FieldValue::Integer(v)) => i8::try_from(*v)
            .ok()
            .filter(|&b| b != i8::MIN)
            .map(CellValue::Byte)
            .ok_or_else(|| out_of_range(*v))?,
        (ColumnType::Short, FieldValue::Integer(v)) => i16::try_from(*v)
            .ok()
            .filter(|&s| s != i16::MIN)
            .map(CellValue::Short)
            .ok_or_else(|| out_of_range(*v))?,
        (ColumnType::Int, FieldValue::Integer(v)) => i32::try_from(*v)
            .ok()
            .filter(|&i| i != i32::MIN)
            .map(CellValue::Int)
            .ok_or_else(|| out_of_range(*v))?,
        (ColumnType::Long | ColumnType::Date | ColumnType::Timestamp, FieldValue::Integer(v)) => {
            if *v == i64::MIN {
                return Err(out_of_range(*v));
            }
            match column.column_type {
                ColumnType::Long => CellValue::Long(*v),
                ColumnType::Date => CellValue::Date(*v),
                _ => CellValue::Timestamp(*v),
            }
        }
        (ColumnType::Float, FieldValue::Integer(v)) => CellValue::Float(*v as f32),
        (ColumnType::Double, FieldValue::Integer(v)) => CellValue::Double(*v as f64),
        (ColumnType::Float, FieldValue::Float(v)) => {
            let narrowed = *v as f32;
            if v.is_finite() && narrowed.is_infinite() {
                return Err(IngestError::FloatOutOfRange {
                    column: column.name.clone(),
                    value: *v,
                });
            }
            CellValue::Float(narrowed)
        }
        (ColumnType::Double, FieldValue::Float(v)) => CellValue::Double(*v),
        (ColumnType::Boolean, FieldValue::Boolean(v)) => CellValue::Boolean(*v),
        (ColumnType::String, FieldValue::Str(v)) => CellValue::Str(v.clone()),
        (ColumnType::Symbol, FieldValue::Str(v)) => CellValue::Symbol(v.clone()),
        (column_type, value) => {
            return Err(IngestError::TypeConflict {
                column: column.name.clone(),
                column_type,
                value_kind: value.kind(),
            })
        }
    };
    Ok(cell)
}
