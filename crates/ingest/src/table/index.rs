//! Partition index: the per-partition durability checkpoint.
//!
//! ## File Structure
//!
//! ```text
//! offset 0                 i32  magic = 0xDEADBEEF
//! offset 4                 i32  column count (n)
//! offset 8 + i*16          i64  primary size of column i
//! offset 16 + i*16         i64  secondary size of column i (0 if none)
//! offset 8 + n*16 + i*8    i64  top (first physical row) of column i
//! ```
//!
//! All integers are little-endian. Sizes are only updated by
//! [`PartitionIndex::set_sizes`] during a table commit, so bytes a column file
//! holds beyond its recorded size are an uncommitted tail.

use crate::error::{IngestError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic value at the start of every partition index.
pub const INDEX_MAGIC: u32 = 0xDEAD_BEEF;

/// Header length: magic + column count.
pub const INDEX_HEADER_SIZE: usize = 8;

const PAGE_SIZE: usize = 4096;

/// Memory-mapped partition index file.
pub struct PartitionIndex {
    path: PathBuf,
    file: File,
    map: MmapMut,
    column_count: usize,
}

impl PartitionIndex {
    /// Opens the index at `path`, creating it if absent.
    ///
    /// # Errors
    ///
    /// An existing file with a wrong magic returns
    /// [`IngestError::BadIndexHeader`]; one whose column count differs from
    /// `column_count` returns [`IngestError::ColumnCountMismatch`]. Both are
    /// fatal for the owning table.
    pub fn open(path: impl AsRef<Path>, column_count: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len() as usize;
        if exists && file_len < INDEX_HEADER_SIZE {
            return Err(IngestError::BadIndexHeader {
                expected: INDEX_MAGIC,
                actual: 0,
            });
        }

        let map_len = Self::map_len_for(column_count).max(file_len.next_multiple_of(PAGE_SIZE));
        if file_len < map_len {
            file.set_len(map_len as u64)?;
        }
        let mut map = unsafe { MmapOptions::new().len(map_len).map_mut(&file)? };

        if exists {
            let magic = read_u32(&map, 0);
            if magic != INDEX_MAGIC {
                return Err(IngestError::BadIndexHeader {
                    expected: INDEX_MAGIC,
                    actual: magic,
                });
            }
            let on_disk = read_u32(&map, 4);
            if on_disk as usize != column_count {
                return Err(IngestError::ColumnCountMismatch {
                    on_disk,
                    expected: column_count as u32,
                });
            }
        } else {
            map[..Self::required_len(column_count)].fill(0);
            write_u32(&mut map, 0, INDEX_MAGIC);
            write_u32(&mut map, 4, column_count as u32);
            debug!(
                "Created partition index {} for {} columns",
                path.display(),
                column_count
            );
        }

        Ok(Self {
            path,
            file,
            map,
            column_count,
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of columns the index has slots for.
    pub fn column_count(&self) -> usize {
        self.column_count
    }

    /// Committed primary size of column `column`.
    pub fn primary_size(&self, column: usize) -> u64 {
        read_u64(&self.map, primary_size_offset(column))
    }

    /// Committed secondary size of column `column`.
    pub fn secondary_size(&self, column: usize) -> u64 {
        read_u64(&self.map, secondary_size_offset(column))
    }

    /// First physical row of column `column` in this partition.
    pub fn top(&self, column: usize) -> u64 {
        read_u64(&self.map, top_offset(self.column_count, column))
    }

    /// Records the committed sizes of column `column`.
    pub fn set_sizes(&mut self, column: usize, primary: u64, secondary: u64) {
        write_u64(&mut self.map, primary_size_offset(column), primary);
        write_u64(&mut self.map, secondary_size_offset(column), secondary);
    }

    /// Records the top of column `column`.
    pub fn set_top(&mut self, column: usize, top: u64) {
        let offset = top_offset(self.column_count, column);
        write_u64(&mut self.map, offset, top);
    }

    /// Appends a slot for one more column with zero sizes and the given top.
    ///
    /// The top region sits after the size pairs, so it is relocated by 16
    /// bytes. Existing sizes and tops keep their values.
    pub fn add_column(&mut self, top: u64) -> Result<()> {
        let old_count = self.column_count;
        let tops: Vec<u64> = (0..old_count).map(|i| self.top(i)).collect();

        let new_count = old_count + 1;
        let required = Self::required_len(new_count);
        if required > self.map.len() {
            let new_len = Self::map_len_for(new_count);
            self.map.flush()?;
            self.file.set_len(new_len as u64)?;
            self.map = unsafe { MmapOptions::new().len(new_len).map_mut(&self.file)? };
        }

        self.column_count = new_count;
        write_u64(&mut self.map, primary_size_offset(old_count), 0);
        write_u64(&mut self.map, secondary_size_offset(old_count), 0);
        for (i, t) in tops.into_iter().enumerate() {
            self.set_top(i, t);
        }
        self.set_top(old_count, top);
        write_u32(&mut self.map, 4, new_count as u32);

        debug!(
            "Extended partition index {} to {} columns",
            self.path.display(),
            new_count
        );
        Ok(())
    }

    /// Flushes the mapping to disk.
    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Bytes occupied by an index for `column_count` columns.
    pub fn required_len(column_count: usize) -> usize {
        INDEX_HEADER_SIZE + column_count * 24
    }

    fn map_len_for(column_count: usize) -> usize {
        Self::required_len(column_count).next_multiple_of(PAGE_SIZE)
    }
}

fn primary_size_offset(column: usize) -> usize {
    INDEX_HEADER_SIZE + column * 16
}

fn secondary_size_offset(column: usize) -> usize {
    primary_size_offset(column) + 8
}

fn top_offset(column_count: usize, column: usize) -> usize {
    INDEX_HEADER_SIZE + column_count * 16 + column * 8
}

fn read_u32(map: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&map[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn write_u32(map: &mut [u8], offset: usize, value: u32) {
    map[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(map: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&map[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn write_u64(map: &mut [u8], offset: usize, value: u64) {
    map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
