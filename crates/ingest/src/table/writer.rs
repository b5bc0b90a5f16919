//! Table writer: row transactions over one table's column files.
//!
//! A [`TableWriter`] exclusively owns the open partition of one table: one
//! [`AppendMemory`] pair per column plus the [`PartitionIndex`]. Rows are
//! built through a [`Row`] handle and finalized with [`Row::append`].
//!
//! ## Null filling
//!
//! The writer keeps a master sequence number that advances with every
//! [`TableWriter::new_row`], and each column remembers the sequence of the
//! last row it was written in. On append, every column whose sequence is
//! behind the master one receives its type's null value:
//!
//! ```text
//! Boolean, Byte      i8::MIN
//! Short              i16::MIN
//! Int                i32::MIN
//! Long, Date, Ts     i64::MIN
//! Float, Double      NaN
//! String, Binary     length prefix -1, no payload
//! Symbol             SYMBOL_NULL_CODE
//! ```
//!
//! ## Lazy columns
//!
//! A column added while the partition already has `K` rows gets top `K`:
//! its files start empty and rows `0..K` read as null.

use crate::error::{IngestError, Result};
use crate::table::{
    is_valid_name, AppendMemory, CellValue, ColumnMeta, ColumnType, PartitionBy, PartitionIndex,
    TableMetadata, SYMBOL_NULL_CODE,
};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Partition index file name inside a partition directory.
pub const INDEX_FILE_NAME: &str = "_index";

/// Single-threaded writer for one table.
///
/// # Examples
/// ```rust,ignore
/// use alopex_ingest::table::{ColumnMeta, ColumnType, PartitionBy, TableMetadata, TableWriter};
///
/// let meta = TableMetadata::new(
///     PartitionBy::None,
///     vec![ColumnMeta::new("temperature", ColumnType::Double)],
///     None,
/// );
/// let mut writer = TableWriter::create("/data/weather", meta, 1 << 20)?;
/// let mut row = writer.new_row()?;
/// row.put_double(0, 82.0)?;
/// row.append()?;
/// writer.commit()?;
/// ```
pub struct TableWriter {
    table_dir: PathBuf,
    name: String,
    metadata: TableMetadata,
    extent: usize,
    partition: Option<OpenPartition>,
    refs: Vec<u64>,
    master_ref: u64,
    undo_log: Vec<Undo>,
    row_count: u64,
    pending_rows: u64,
    max_timestamp: Option<i64>,
}

struct OpenPartition {
    name: String,
    bounds: Range<i64>,
    dir: PathBuf,
    index: PartitionIndex,
    columns: Vec<Column>,
}

impl TableWriter {
    /// Creates a new table in `table_dir` and writes its `_meta`.
    ///
    /// Non-partitioned tables open their `default` partition immediately;
    /// partitioned ones wait for [`TableWriter::switch_partition`].
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::TableExists`] if `_meta` is already present,
    /// [`IngestError::InvalidName`] or [`IngestError::DuplicateColumn`] for
    /// a bad schema, and I/O errors from creating files.
    pub fn create(
        table_dir: impl AsRef<Path>,
        metadata: TableMetadata,
        extent: usize,
    ) -> Result<Self> {
        let table_dir = table_dir.as_ref().to_path_buf();
        let name = table_name(&table_dir)?;
        if TableMetadata::load(&table_dir)?.is_some() {
            return Err(IngestError::TableExists(name));
        }
        for (i, column) in metadata.columns.iter().enumerate() {
            if !is_valid_name(&column.name) {
                return Err(IngestError::InvalidName(column.name.clone()));
            }
            if metadata.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(IngestError::DuplicateColumn(column.name.clone()));
            }
        }

        fs::create_dir_all(&table_dir)?;
        metadata.store(&table_dir)?;
        info!(
            "Created table {} with {} columns, partitioned by {:?}",
            name,
            metadata.columns.len(),
            metadata.partition_by
        );
        Self::init(table_dir, name, metadata, extent)
    }

    /// Opens an existing table from its `_meta` and latest partition.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::TableNotFound`] if there is no `_meta`, and
    /// the table-fatal errors of [`PartitionIndex::open`] if the latest
    /// partition does not match the schema.
    pub fn open(table_dir: impl AsRef<Path>, extent: usize) -> Result<Self> {
        let table_dir = table_dir.as_ref().to_path_buf();
        let name = table_name(&table_dir)?;
        let metadata = TableMetadata::load(&table_dir)?
            .ok_or_else(|| IngestError::TableNotFound(name.clone()))?;
        Self::init(table_dir, name, metadata, extent)
    }

    fn init(table_dir: PathBuf, name: String, metadata: TableMetadata, extent: usize) -> Result<Self> {
        let column_count = metadata.columns.len();
        let mut writer = Self {
            table_dir,
            name,
            metadata,
            extent,
            partition: None,
            refs: vec![0; column_count],
            master_ref: 0,
            undo_log: Vec::with_capacity(column_count),
            row_count: 0,
            pending_rows: 0,
            max_timestamp: None,
        };

        let latest = match writer.metadata.partition_by {
            PartitionBy::None => Some(i64::MIN),
            by => latest_partition(&writer.table_dir, by)?,
        };
        if let Some(start) = latest {
            writer.open_partition(start)?;
        }
        Ok(writer)
    }

    /// Table name, taken from the directory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table directory.
    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    /// Current schema.
    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    /// Columns in their stable order.
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.metadata.columns
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.metadata.columns.len()
    }

    /// Index of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.metadata.column_index(name)
    }

    /// Index of the designated timestamp column.
    pub fn timestamp_index(&self) -> Option<usize> {
        self.metadata.timestamp_index
    }

    /// Rows in the open partition, including rows not yet committed.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Rows appended since the last commit.
    pub fn pending_rows(&self) -> u64 {
        self.pending_rows
    }

    /// Largest designated timestamp in the open partition.
    ///
    /// Partitions only move forward, so this is also the table maximum.
    pub fn max_timestamp(&self) -> Option<i64> {
        self.max_timestamp
    }

    /// Name of the open partition directory.
    pub fn partition_name(&self) -> Option<&str> {
        self.partition.as_ref().map(|p| p.name.as_str())
    }

    /// Timestamp range accepted by the open partition.
    pub fn partition_bounds(&self) -> Option<Range<i64>> {
        self.partition.as_ref().map(|p| p.bounds.clone())
    }

    /// Top of column `column` in the open partition.
    pub fn column_top(&self, column: usize) -> Option<u64> {
        self.column(column).map(|c| c.top)
    }

    /// Bytes appended to the primary file of `column`.
    pub fn primary_size(&self, column: usize) -> Option<u64> {
        self.column(column).map(|c| c.sizes().0)
    }

    /// Bytes appended to the secondary file of `column`, 0 if it has none.
    pub fn secondary_size(&self, column: usize) -> Option<u64> {
        self.column(column).map(|c| c.sizes().1)
    }

    fn column(&self, column: usize) -> Option<&Column> {
        self.partition.as_ref()?.columns.get(column)
    }

    /// Returns true if `timestamp` belongs to the open partition.
    pub fn in_current_partition(&self, timestamp: i64) -> bool {
        self.partition
            .as_ref()
            .is_some_and(|p| p.bounds.contains(&timestamp))
    }

    /// Makes the partition holding `timestamp` the open one.
    ///
    /// The outgoing partition is committed first. Returns true if a switch
    /// happened.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::TimestampOutsidePartition`] for a timestamp
    /// older than the open partition, and table-fatal errors if the new
    /// partition cannot be opened.
    pub fn switch_partition(&mut self, timestamp: i64) -> Result<bool> {
        if let Some(current) = &self.partition {
            if current.bounds.contains(&timestamp) {
                return Ok(false);
            }
            if timestamp < current.bounds.start {
                return Err(IngestError::TimestampOutsidePartition {
                    timestamp,
                    partition: current.name.clone(),
                });
            }
            self.commit()?;
        }
        let start = self.metadata.partition_by.bounds(timestamp).start;
        self.open_partition(start)?;
        Ok(true)
    }

    fn open_partition(&mut self, start: i64) -> Result<()> {
        let by = self.metadata.partition_by;
        let name = by.partition_name(start);
        let bounds = by.bounds(start);
        let dir = self.table_dir.join(&name);
        fs::create_dir_all(&dir)?;

        let mut index =
            PartitionIndex::open(dir.join(INDEX_FILE_NAME), self.metadata.columns.len())?;
        let mut columns = Vec::with_capacity(self.metadata.columns.len());
        for (i, meta) in self.metadata.columns.iter().enumerate() {
            columns.push(Column::open(
                &dir,
                meta,
                self.extent,
                index.primary_size(i),
                index.secondary_size(i),
                index.top(i),
            )?);
        }

        // A column added before rows that were never committed has a top
        // past the committed row count; only columns holding data count.
        let row_count = columns
            .iter()
            .filter(|c| c.row_count() > c.top)
            .map(Column::row_count)
            .max()
            .unwrap_or(0);
        for (i, column) in columns.iter_mut().enumerate() {
            if column.top > row_count {
                debug!(
                    "Clamping top of column {} in {}/{} from {} to {}",
                    i, self.name, name, column.top, row_count
                );
                column.top = row_count;
                index.set_top(i, row_count);
            }
        }

        let max_timestamp = self
            .metadata
            .timestamp_index
            .and_then(|ts| columns.get(ts))
            .and_then(Column::max_i64);

        debug!(
            "Opened partition {}/{} with {} rows",
            self.name, name, row_count
        );

        self.partition = Some(OpenPartition {
            name,
            bounds,
            dir,
            index,
            columns,
        });
        self.row_count = row_count;
        self.pending_rows = 0;
        self.max_timestamp = max_timestamp;
        Ok(())
    }

    /// Begins a new row.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::NoPartition`] if no partition is open.
    pub fn new_row(&mut self) -> Result<Row<'_>> {
        if self.partition.is_none() {
            return Err(IngestError::NoPartition(self.name.clone()));
        }
        self.master_ref += 1;
        self.undo_log.clear();
        Ok(Row {
            writer: self,
            timestamp: None,
            finished: false,
        })
    }

    /// Adds a column and returns its index.
    ///
    /// The column's top in the open partition is the current row count, so
    /// existing rows read as null and nothing is written for them.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::DuplicateColumn`] or
    /// [`IngestError::InvalidName`] for a bad name, and table-fatal errors
    /// if the index or `_meta` cannot be updated.
    pub fn add_column(&mut self, name: &str, column_type: ColumnType) -> Result<usize> {
        if !is_valid_name(name) {
            return Err(IngestError::InvalidName(name.to_string()));
        }
        if self.metadata.column_index(name).is_some() {
            return Err(IngestError::DuplicateColumn(name.to_string()));
        }

        let meta = ColumnMeta::new(name, column_type);
        let top = self.row_count;
        if let Some(partition) = &mut self.partition {
            let column = Column::open(&partition.dir, &meta, self.extent, 0, 0, top)?;
            partition.index.add_column(top)?;
            partition.columns.push(column);
        }

        self.metadata.columns.push(meta);
        self.metadata.store(&self.table_dir)?;
        self.refs.push(0);

        info!(
            "Added column {} ({:?}) to table {} at row {}",
            name, column_type, self.name, top
        );
        Ok(self.metadata.columns.len() - 1)
    }

    /// Records every column's current sizes in the partition index.
    ///
    /// Rows appended after the last commit are invisible to a reopen.
    pub fn commit(&mut self) -> Result<()> {
        let Some(partition) = &mut self.partition else {
            return Ok(());
        };
        for (i, column) in partition.columns.iter().enumerate() {
            let (primary, secondary) = column.sizes();
            partition.index.set_sizes(i, primary, secondary);
        }
        if self.pending_rows > 0 {
            debug!(
                "Committed {} rows to {}/{}",
                self.pending_rows, self.name, partition.name
            );
        }
        self.pending_rows = 0;
        Ok(())
    }

    /// Flushes column files and the partition index to disk.
    pub fn sync(&self) -> Result<()> {
        if let Some(partition) = &self.partition {
            for column in &partition.columns {
                column.sync()?;
            }
            partition.index.sync()?;
        }
        Ok(())
    }

    /// Drops every row of the open partition and commits the empty state.
    pub fn truncate(&mut self) -> Result<()> {
        if let Some(partition) = &mut self.partition {
            for (i, column) in partition.columns.iter_mut().enumerate() {
                column.truncate();
                partition.index.set_top(i, 0);
            }
        }
        self.row_count = 0;
        self.max_timestamp = None;
        self.commit()?;
        debug!("Truncated table {}", self.name);
        Ok(())
    }

    /// Decodes the value of `column` at `row` in the open partition.
    ///
    /// Returns `None` if either is out of range.
    pub fn value_at(&self, column: usize, row: u64) -> Option<CellValue> {
        if row >= self.row_count {
            return None;
        }
        self.column(column)?.read(row)
    }
}

/// A row being built. Created by [`TableWriter::new_row`].
///
/// Dropping a row without calling [`Row::append`] cancels it.
pub struct Row<'a> {
    writer: &'a mut TableWriter,
    timestamp: Option<i64>,
    finished: bool,
}

impl Row<'_> {
    /// Writes a boolean into a `Boolean` column.
    pub fn put_bool(&mut self, column: usize, value: bool) -> Result<()> {
        let col = self.prepare(column, "boolean", |t| t == ColumnType::Boolean)?;
        col.primary_mut().put_i8(value as i8)?;
        Ok(())
    }

    /// Writes into a `Byte` column.
    pub fn put_byte(&mut self, column: usize, value: i8) -> Result<()> {
        let col = self.prepare(column, "byte", |t| t == ColumnType::Byte)?;
        col.primary_mut().put_i8(value)?;
        Ok(())
    }

    /// Writes into a `Short` column.
    pub fn put_short(&mut self, column: usize, value: i16) -> Result<()> {
        let col = self.prepare(column, "short", |t| t == ColumnType::Short)?;
        col.primary_mut().put_i16(value)?;
        Ok(())
    }

    /// Writes into an `Int` column.
    pub fn put_int(&mut self, column: usize, value: i32) -> Result<()> {
        let col = self.prepare(column, "int", |t| t == ColumnType::Int)?;
        col.primary_mut().put_i32(value)?;
        Ok(())
    }

    /// Writes into a `Long` column.
    pub fn put_long(&mut self, column: usize, value: i64) -> Result<()> {
        let col = self.prepare(column, "long", |t| t == ColumnType::Long)?;
        col.primary_mut().put_i64(value)?;
        Ok(())
    }

    /// Writes milliseconds since epoch into a `Date` column.
    pub fn put_date(&mut self, column: usize, value: i64) -> Result<()> {
        let col = self.prepare(column, "date", |t| t == ColumnType::Date)?;
        col.primary_mut().put_i64(value)?;
        Ok(())
    }

    /// Writes microseconds since epoch into a `Timestamp` column.
    ///
    /// # Errors
    ///
    /// For the designated timestamp column, a value outside the open
    /// partition returns [`IngestError::TimestampOutsidePartition`].
    pub fn put_timestamp(&mut self, column: usize, value: i64) -> Result<()> {
        let designated = self.writer.metadata.timestamp_index == Some(column);
        if designated {
            if let Some(partition) = &self.writer.partition {
                if !partition.bounds.contains(&value) {
                    return Err(IngestError::TimestampOutsidePartition {
                        timestamp: value,
                        partition: partition.name.clone(),
                    });
                }
            }
        }
        let col = self.prepare(column, "timestamp", |t| t == ColumnType::Timestamp)?;
        col.primary_mut().put_i64(value)?;
        if designated {
            self.timestamp = Some(value);
        }
        Ok(())
    }

    /// Writes into a `Float` column.
    pub fn put_float(&mut self, column: usize, value: f32) -> Result<()> {
        let col = self.prepare(column, "float", |t| t == ColumnType::Float)?;
        col.primary_mut().put_f32(value)?;
        Ok(())
    }

    /// Writes into a `Double` column.
    pub fn put_double(&mut self, column: usize, value: f64) -> Result<()> {
        let col = self.prepare(column, "double", |t| t == ColumnType::Double)?;
        col.primary_mut().put_f64(value)?;
        Ok(())
    }

    /// Writes into a `String` column; `None` stores null.
    pub fn put_str(&mut self, column: usize, value: Option<&str>) -> Result<()> {
        let col = self.prepare(column, "string", |t| t == ColumnType::String)?;
        col.put_var(|data| data.put_str(value))
    }

    /// Writes into a `Binary` column; `None` stores null.
    pub fn put_bin(&mut self, column: usize, value: Option<&[u8]>) -> Result<()> {
        let col = self.prepare(column, "binary", |t| t == ColumnType::Binary)?;
        col.put_var(|data| data.put_bin(value))
    }

    /// Writes into a `Symbol` column; `None` stores the null code.
    pub fn put_sym(&mut self, column: usize, value: Option<&str>) -> Result<()> {
        let col = self.prepare(column, "symbol", |t| t == ColumnType::Symbol)?;
        col.put_sym(value)
    }

    /// Writes an explicit null into any column.
    pub fn put_null(&mut self, column: usize) -> Result<()> {
        let col = self.prepare(column, "null", |_| true)?;
        col.put_null()?;
        Ok(())
    }

    /// Writes a [`CellValue`] with the setter matching its variant.
    pub fn put_value(&mut self, column: usize, value: &CellValue) -> Result<()> {
        match value {
            CellValue::Null => self.put_null(column),
            CellValue::Boolean(v) => self.put_bool(column, *v),
            CellValue::Byte(v) => self.put_byte(column, *v),
            CellValue::Short(v) => self.put_short(column, *v),
            CellValue::Int(v) => self.put_int(column, *v),
            CellValue::Long(v) => self.put_long(column, *v),
            CellValue::Date(v) => self.put_date(column, *v),
            CellValue::Timestamp(v) => self.put_timestamp(column, *v),
            CellValue::Float(v) => self.put_float(column, *v),
            CellValue::Double(v) => self.put_double(column, *v),
            CellValue::Str(v) => self.put_str(column, Some(v)),
            CellValue::Binary(v) => self.put_bin(column, Some(v)),
            CellValue::Symbol(v) => self.put_sym(column, Some(v)),
        }
    }

    /// Finalizes the row, null-filling every column it did not set.
    ///
    /// # Errors
    ///
    /// An I/O error while null-filling cancels the row and is returned.
    pub fn append(mut self) -> Result<()> {
        if let Err(err) = self.fill_nulls() {
            self.rollback();
            self.finished = true;
            return Err(err);
        }

        let writer = &mut *self.writer;
        writer.row_count += 1;
        writer.pending_rows += 1;
        if let Some(ts) = self.timestamp {
            writer.max_timestamp = Some(writer.max_timestamp.map_or(ts, |max| max.max(ts)));
        }
        self.finished = true;
        Ok(())
    }

    /// Discards everything written into this row.
    pub fn cancel(mut self) {
        self.rollback();
        self.finished = true;
    }

    fn fill_nulls(&mut self) -> Result<()> {
        let writer = &mut *self.writer;
        let partition = writer
            .partition
            .as_mut()
            .ok_or_else(|| IngestError::NoPartition(writer.name.clone()))?;
        for (i, column) in partition.columns.iter_mut().enumerate() {
            if writer.refs[i] < writer.master_ref {
                writer.undo_log.push(column.undo_point(i));
                writer.refs[i] = writer.master_ref;
                column.put_null()?;
            }
        }
        Ok(())
    }

    fn rollback(&mut self) {
        let writer = &mut *self.writer;
        if let Some(partition) = &mut writer.partition {
            for undo in writer.undo_log.drain(..).rev() {
                if let Some(column) = partition.columns.get_mut(undo.column) {
                    column.rollback(&undo);
                }
            }
        }
    }

    fn prepare(
        &mut self,
        column: usize,
        value_kind: &'static str,
        accepts: impl Fn(ColumnType) -> bool,
    ) -> Result<&mut Column> {
        let writer = &mut *self.writer;
        let meta = writer
            .metadata
            .columns
            .get(column)
            .ok_or_else(|| IngestError::UnknownColumn(format!("#{column}")))?;
        if !accepts(meta.column_type) {
            return Err(IngestError::TypeConflict {
                column: meta.name.clone(),
                column_type: meta.column_type,
                value_kind,
            });
        }
        if writer.refs[column] == writer.master_ref {
            return Err(IngestError::ColumnAlreadySet(column));
        }

        let partition = writer
            .partition
            .as_mut()
            .ok_or_else(|| IngestError::NoPartition(writer.name.clone()))?;
        let col = partition
            .columns
            .get_mut(column)
            .ok_or_else(|| IngestError::UnknownColumn(format!("#{column}")))?;
        writer.undo_log.push(col.undo_point(column));
        writer.refs[column] = writer.master_ref;
        Ok(col)
    }
}

impl Drop for Row<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

struct Undo {
    column: usize,
    primary: u64,
    secondary: u64,
}

/// Files of one column in the open partition.
struct Column {
    column_type: ColumnType,
    top: u64,
    store: ColumnStore,
}

enum ColumnStore {
    Fixed {
        data: AppendMemory,
    },
    Var {
        data: AppendMemory,
        offsets: AppendMemory,
    },
    Symbol {
        codes: AppendMemory,
        dictionary: AppendMemory,
        symbols: SymbolTable,
    },
}

impl Column {
    fn open(
        dir: &Path,
        meta: &ColumnMeta,
        extent: usize,
        primary_size: u64,
        secondary_size: u64,
        top: u64,
    ) -> Result<Self> {
        let primary = AppendMemory::open(
            dir.join(format!("{}.d", meta.name)),
            extent,
            primary_size,
        )?;
        let secondary = |size| AppendMemory::open(dir.join(format!("{}.i", meta.name)), extent, size);

        let store = match meta.column_type {
            ColumnType::String | ColumnType::Binary => ColumnStore::Var {
                data: primary,
                offsets: secondary(secondary_size)?,
            },
            ColumnType::Symbol => {
                let dictionary = secondary(secondary_size)?;
                let symbols = SymbolTable::load(&dictionary)?;
                ColumnStore::Symbol {
                    codes: primary,
                    dictionary,
                    symbols,
                }
            }
            _ => ColumnStore::Fixed { data: primary },
        };

        Ok(Self {
            column_type: meta.column_type,
            top,
            store,
        })
    }

    fn sizes(&self) -> (u64, u64) {
        match &self.store {
            ColumnStore::Fixed { data } => (data.size(), 0),
            ColumnStore::Var { data, offsets } => (data.size(), offsets.size()),
            ColumnStore::Symbol {
                codes, dictionary, ..
            } => (codes.size(), dictionary.size()),
        }
    }

    fn row_count(&self) -> u64 {
        let (primary, secondary) = self.sizes();
        self.top + self.column_type.rows_from_sizes(primary, secondary)
    }

    fn primary_mut(&mut self) -> &mut AppendMemory {
        match &mut self.store {
            ColumnStore::Fixed { data } | ColumnStore::Var { data, .. } => data,
            ColumnStore::Symbol { codes, .. } => codes,
        }
    }

    fn undo_point(&self, column: usize) -> Undo {
        let (primary, secondary) = self.sizes();
        Undo {
            column,
            primary,
            secondary,
        }
    }

    fn rollback(&mut self, undo: &Undo) {
        match &mut self.store {
            ColumnStore::Fixed { data } => data.jump_to(undo.primary),
            ColumnStore::Var { data, offsets } => {
                data.jump_to(undo.primary);
                offsets.jump_to(undo.secondary);
            }
            // Dictionary entries stay; an unused symbol is harmless.
            ColumnStore::Symbol { codes, .. } => codes.jump_to(undo.primary),
        }
    }

    fn put_var(&mut self, write: impl FnOnce(&mut AppendMemory) -> io::Result<u64>) -> Result<()> {
        match &mut self.store {
            ColumnStore::Var { data, offsets } => {
                let offset = write(data)?;
                offsets.put_i64(offset as i64)?;
                Ok(())
            }
            _ => Err(mismatched_store(self.column_type)),
        }
    }

    fn put_sym(&mut self, value: Option<&str>) -> Result<()> {
        match &mut self.store {
            ColumnStore::Symbol {
                codes,
                dictionary,
                symbols,
            } => {
                let code = match value {
                    Some(value) => symbols.code_for(value, dictionary)?,
                    None => SYMBOL_NULL_CODE,
                };
                codes.put_i32(code)?;
                Ok(())
            }
            _ => Err(mismatched_store(self.column_type)),
        }
    }

    fn put_null(&mut self) -> Result<()> {
        match self.column_type {
            ColumnType::Boolean | ColumnType::Byte => {
                self.primary_mut().put_i8(i8::MIN)?;
            }
            ColumnType::Short => {
                self.primary_mut().put_i16(i16::MIN)?;
            }
            ColumnType::Int => {
                self.primary_mut().put_i32(i32::MIN)?;
            }
            ColumnType::Long | ColumnType::Date | ColumnType::Timestamp => {
                self.primary_mut().put_i64(i64::MIN)?;
            }
            ColumnType::Float => {
                self.primary_mut().put_f32(f32::NAN)?;
            }
            ColumnType::Double => {
                self.primary_mut().put_f64(f64::NAN)?;
            }
            ColumnType::String => return self.put_var(|data| data.put_str(None)),
            ColumnType::Binary => return self.put_var(|data| data.put_bin(None)),
            ColumnType::Symbol => return self.put_sym(None),
        }
        Ok(())
    }

    fn truncate(&mut self) {
        self.top = 0;
        match &mut self.store {
            ColumnStore::Fixed { data } => data.truncate(),
            ColumnStore::Var { data, offsets } => {
                data.truncate();
                offsets.truncate();
            }
            ColumnStore::Symbol {
                codes,
                dictionary,
                symbols,
            } => {
                codes.truncate();
                dictionary.truncate();
                *symbols = SymbolTable::default();
            }
        }
    }

    fn sync(&self) -> io::Result<()> {
        match &self.store {
            ColumnStore::Fixed { data } => data.sync(),
            ColumnStore::Var { data, offsets } => {
                data.sync()?;
                offsets.sync()
            }
            ColumnStore::Symbol {
                codes, dictionary, ..
            } => {
                codes.sync()?;
                dictionary.sync()
            }
        }
    }

    fn max_i64(&self) -> Option<i64> {
        let ColumnStore::Fixed { data } = &self.store else {
            return None;
        };
        (0..data.size() / 8)
            .filter_map(|i| data.get_i64(i * 8))
            .filter(|&v| v != i64::MIN)
            .max()
    }

    fn read(&self, row: u64) -> Option<CellValue> {
        if row < self.top {
            return Some(CellValue::Null);
        }
        let row = row - self.top;

        let value = match &self.store {
            ColumnStore::Fixed { data } => {
                let width = self.column_type.primary_width()? as u64;
                let offset = row * width;
                match self.column_type {
                    ColumnType::Boolean => match data.get_i8(offset)? {
                        i8::MIN => CellValue::Null,
                        v => CellValue::Boolean(v != 0),
                    },
                    ColumnType::Byte => match data.get_i8(offset)? {
                        i8::MIN => CellValue::Null,
                        v => CellValue::Byte(v),
                    },
                    ColumnType::Short => match data.get_i16(offset)? {
                        i16::MIN => CellValue::Null,
                        v => CellValue::Short(v),
                    },
                    ColumnType::Int => match data.get_i32(offset)? {
                        i32::MIN => CellValue::Null,
                        v => CellValue::Int(v),
                    },
                    ColumnType::Long | ColumnType::Date | ColumnType::Timestamp => {
                        match data.get_i64(offset)? {
                            i64::MIN => CellValue::Null,
                            v if self.column_type == ColumnType::Long => CellValue::Long(v),
                            v if self.column_type == ColumnType::Date => CellValue::Date(v),
                            v => CellValue::Timestamp(v),
                        }
                    }
                    ColumnType::Float => {
                        let v = data.get_f32(offset)?;
                        if v.is_nan() {
                            CellValue::Null
                        } else {
                            CellValue::Float(v)
                        }
                    }
                    ColumnType::Double => {
                        let v = data.get_f64(offset)?;
                        if v.is_nan() {
                            CellValue::Null
                        } else {
                            CellValue::Double(v)
                        }
                    }
                    ColumnType::String | ColumnType::Binary | ColumnType::Symbol => return None,
                }
            }
            ColumnStore::Var { data, offsets } => {
                let offset = u64::try_from(offsets.get_i64(row * 8)?).ok()?;
                if self.column_type == ColumnType::String {
                    match data.get_str(offset)? {
                        Some(s) => CellValue::Str(s.to_string()),
                        None => CellValue::Null,
                    }
                } else {
                    match data.get_bin(offset)? {
                        Some(b) => CellValue::Binary(b.to_vec()),
                        None => CellValue::Null,
                    }
                }
            }
            ColumnStore::Symbol { codes, symbols, .. } => match codes.get_i32(row * 4)? {
                SYMBOL_NULL_CODE => CellValue::Null,
                code => CellValue::Symbol(symbols.value(code)?.to_string()),
            },
        };
        Some(value)
    }
}

fn mismatched_store(column_type: ColumnType) -> IngestError {
    IngestError::IoError(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("column store does not match type {column_type:?}"),
    ))
}

/// In-memory view of a symbol column's dictionary file.
#[derive(Default)]
struct SymbolTable {
    codes: HashMap<String, i32>,
    values: Vec<String>,
}

impl SymbolTable {
    fn load(dictionary: &AppendMemory) -> io::Result<Self> {
        let mut table = Self::default();
        let mut offset = 0;
        while offset < dictionary.size() {
            let value = match dictionary.get_str(offset) {
                Some(Some(value)) => value,
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "bad symbol entry at offset {} of {}",
                            offset,
                            dictionary.path().display()
                        ),
                    ))
                }
            };
            table.insert(value.to_string())?;
            offset += 4 + value.len() as u64;
        }
        Ok(table)
    }

    fn code_for(&mut self, value: &str, dictionary: &mut AppendMemory) -> io::Result<i32> {
        if let Some(&code) = self.codes.get(value) {
            return Ok(code);
        }
        dictionary.put_str(Some(value))?;
        self.insert(value.to_string())
    }

    fn insert(&mut self, value: String) -> io::Result<i32> {
        let code = i32::try_from(self.values.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "symbol table full"))?;
        self.codes.insert(value.clone(), code);
        self.values.push(value);
        Ok(code)
    }

    fn value(&self, code: i32) -> Option<&str> {
        self.values.get(usize::try_from(code).ok()?).map(String::as_str)
    }
}

fn table_name(table_dir: &Path) -> Result<String> {
    table_dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| IngestError::InvalidName(table_dir.display().to_string()))
}

fn latest_partition(table_dir: &Path, by: PartitionBy) -> Result<Option<i64>> {
    let entries = match fs::read_dir(table_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut latest = None;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(start) = entry.file_name().to_str().and_then(|n| by.parse_partition_name(n)) {
            latest = latest.max(Some(start));
        }
    }
    Ok(latest)
}
