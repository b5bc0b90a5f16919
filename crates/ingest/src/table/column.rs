//! Append-only memory-mapped column files.
//!
//! Each [`AppendMemory`] owns one file and a writable mapping over it. The
//! file grows in fixed extents as appends run past the mapped length; it is
//! never shrunk, and every value keeps the byte offset it was appended at.
//!
//! # Value encodings
//!
//! All values are little-endian. Variable-length values are written as a
//! length prefix followed by the payload:
//!
//! ```text
//! string: i32 byte length, UTF-8 bytes      (null: length = -1, no payload)
//! binary: i64 byte length, raw bytes        (null: length = -1, no payload)
//! ```

use crate::table::{NULL_BIN_LEN, NULL_STR_LEN};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Memory-mapped append log backing one column file.
pub struct AppendMemory {
    path: PathBuf,
    file: File,
    map: MmapMut,
    extent: usize,
    append_offset: usize,
}

impl AppendMemory {
    /// Opens or creates the file at `path`.
    ///
    /// `committed_size` is the number of bytes the partition index vouches
    /// for; anything beyond it is an uncommitted tail and is overwritten by
    /// subsequent appends.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped, or if it is
    /// shorter than `committed_size`.
    pub fn open(path: impl AsRef<Path>, extent: usize, committed_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len < committed_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} is {} bytes but {} are committed",
                    path.display(),
                    file_len,
                    committed_size
                ),
            ));
        }

        let committed = usize::try_from(committed_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "committed size overflow"))?;
        let map_len = round_up(committed.max(file_len as usize).max(1), extent);
        if (file_len as usize) < map_len {
            file.set_len(map_len as u64)?;
        }
        let map = unsafe { MmapOptions::new().len(map_len).map_mut(&file)? };

        Ok(Self {
            path,
            file,
            map,
            extent,
            append_offset: committed,
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes appended so far.
    pub fn size(&self) -> u64 {
        self.append_offset as u64
    }

    /// Currently mapped length in bytes.
    pub fn mapped_len(&self) -> usize {
        self.map.len()
    }

    /// Resets the append cursor to zero. The mapping is kept.
    pub fn truncate(&mut self) {
        self.append_offset = 0;
    }

    /// Moves the append cursor back to `offset`, discarding later bytes.
    pub fn jump_to(&mut self, offset: u64) {
        self.append_offset = (offset as usize).min(self.append_offset);
    }

    /// Flushes the mapping to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.map.flush()
    }

    /// Appends raw bytes and returns the offset they were written at.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let offset = self.append_offset;
        self.ensure_capacity(bytes.len())?;
        self.map[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.append_offset += bytes.len();
        Ok(offset as u64)
    }

    /// Appends one byte.
    pub fn put_i8(&mut self, value: i8) -> io::Result<u64> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Appends a 16-bit integer.
    pub fn put_i16(&mut self, value: i16) -> io::Result<u64> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Appends a 32-bit integer.
    pub fn put_i32(&mut self, value: i32) -> io::Result<u64> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Appends a 64-bit integer.
    pub fn put_i64(&mut self, value: i64) -> io::Result<u64> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Appends a 32-bit float.
    pub fn put_f32(&mut self, value: f32) -> io::Result<u64> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Appends a 64-bit float.
    pub fn put_f64(&mut self, value: f64) -> io::Result<u64> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Appends a length-prefixed string, or the null marker for `None`.
    ///
    /// Returns the offset of the length prefix.
    pub fn put_str(&mut self, value: Option<&str>) -> io::Result<u64> {
        match value {
            None => self.put_i32(NULL_STR_LEN),
            Some(s) => {
                let len = i32::try_from(s.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "string too long")
                })?;
                let offset = self.put_i32(len)?;
                self.put_bytes(s.as_bytes())?;
                Ok(offset)
            }
        }
    }

    /// Appends a length-prefixed byte array, or the null marker for `None`.
    ///
    /// Returns the offset of the length prefix.
    pub fn put_bin(&mut self, value: Option<&[u8]>) -> io::Result<u64> {
        match value {
            None => self.put_i64(NULL_BIN_LEN),
            Some(bytes) => {
                let offset = self.put_i64(bytes.len() as i64)?;
                self.put_bytes(bytes)?;
                Ok(offset)
            }
        }
    }

    /// Returns `len` appended bytes starting at `offset`.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        if end > self.append_offset {
            return None;
        }
        Some(&self.map[start..end])
    }

    /// Reads a byte at `offset`.
    pub fn get_i8(&self, offset: u64) -> Option<i8> {
        self.read_array::<1>(offset).map(i8::from_le_bytes)
    }

    /// Reads a 16-bit integer at `offset`.
    pub fn get_i16(&self, offset: u64) -> Option<i16> {
        self.read_array::<2>(offset).map(i16::from_le_bytes)
    }

    /// Reads a 32-bit integer at `offset`.
    pub fn get_i32(&self, offset: u64) -> Option<i32> {
        self.read_array::<4>(offset).map(i32::from_le_bytes)
    }

    /// Reads a 64-bit integer at `offset`.
    pub fn get_i64(&self, offset: u64) -> Option<i64> {
        self.read_array::<8>(offset).map(i64::from_le_bytes)
    }

    /// Reads a 32-bit float at `offset`.
    pub fn get_f32(&self, offset: u64) -> Option<f32> {
        self.read_array::<4>(offset).map(f32::from_le_bytes)
    }

    /// Reads a 64-bit float at `offset`.
    pub fn get_f64(&self, offset: u64) -> Option<f64> {
        self.read_array::<8>(offset).map(f64::from_le_bytes)
    }

    /// Reads the string whose length prefix is at `offset`.
    ///
    /// The outer `Option` is `None` when the bytes are out of bounds or not
    /// UTF-8; the inner one is `None` for a stored null.
    pub fn get_str(&self, offset: u64) -> Option<Option<&str>> {
        let len = self.get_i32(offset)?;
        if len == NULL_STR_LEN {
            return Some(None);
        }
        let len = usize::try_from(len).ok()?;
        let bytes = self.read_bytes(offset + 4, len)?;
        std::str::from_utf8(bytes).ok().map(Some)
    }

    /// Reads the byte array whose length prefix is at `offset`.
    pub fn get_bin(&self, offset: u64) -> Option<Option<&[u8]>> {
        let len = self.get_i64(offset)?;
        if len == NULL_BIN_LEN {
            return Some(None);
        }
        let len = usize::try_from(len).ok()?;
        self.read_bytes(offset + 8, len).map(Some)
    }

    /// Total bytes occupied by the string stored at `offset`, prefix included.
    pub fn str_footprint(&self, offset: u64) -> Option<u64> {
        let len = self.get_i32(offset)?;
        Some(4 + len.max(0) as u64)
    }

    fn read_array<const N: usize>(&self, offset: u64) -> Option<[u8; N]> {
        let bytes = self.read_bytes(offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    fn ensure_capacity(&mut self, additional: usize) -> io::Result<()> {
        let needed = self.append_offset + additional;
        if needed <= self.map.len() {
            return Ok(());
        }

        let new_len = round_up(needed, self.extent);
        self.map.flush_async()?;
        self.file.set_len(new_len as u64)?;
        self.map = unsafe { MmapOptions::new().len(new_len).map_mut(&self.file)? };
        debug!(
            "Extended {} to {} bytes",
            self.path.display(),
            new_len
        );
        Ok(())
    }
}

fn round_up(value: usize, extent: usize) -> usize {
    value.div_ceil(extent) * extent
}
