//! Byte sequences with independent read and write cursors.
//!
//! Two backings share one behaviour:
//! - [`MemoryCursor`] keeps the whole buffer resident in a `Vec<u8>`
//! - [`FileCursor`] spills to an anonymous temporary file
//!
//! Writes insert at the write cursor. At the end of the buffer that is a plain append; in the
//! middle, the bytes after the cursor are kept and shifted behind the new data:
//!
//! ```text
//! before:  [a b c d]      write cursor at 2
//! write "XY"
//! after:   [a b X Y c d]  write cursor at 4
//! ```
//!
//! Both cursors always lie in `[0, len]`; every seek clamps into that range.

use crate::config::StorageConfig;
use crate::error::FecResult;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Reference point of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Absolute offset from the start.
    Start,
    /// Relative to the cursor being moved.
    Current,
    /// Back from the end: the offset's magnitude is subtracted from the length.
    End,
}

/// Addressable byte buffer with separate read and write positions.
pub trait BufferedCursor: Send {
    /// Inserts `data` at the write cursor and advances it past the new bytes.
    fn write(&mut self, data: &[u8]) -> FecResult<()>;

    /// Reads up to `n` bytes from the read cursor and advances it.
    fn read(&mut self, n: usize) -> FecResult<Vec<u8>>;

    /// Returns the whole buffer and moves the read cursor to the end.
    fn read_all(&mut self) -> FecResult<Vec<u8>>;

    fn seek_read(&mut self, offset: i64, whence: Whence);

    fn seek_write(&mut self, offset: i64, whence: Whence);

    fn tell_read(&self) -> usize;

    fn tell_write(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes left between the read cursor and the end.
    fn remaining(&self) -> usize {
        self.len().saturating_sub(self.tell_read())
    }

    fn eof(&self) -> bool {
        self.remaining() == 0
    }
}

fn resolve(current: usize, len: usize, offset: i64, whence: Whence) -> usize {
    let len = len as i64;
    let target = match whence {
        Whence::Start => offset,
        Whence::Current => (current as i64).saturating_add(offset),
        Whence::End => len.saturating_sub(offset.saturating_abs()),
    };
    target.clamp(0, len) as usize
}

/// Cursor over an in-memory buffer.
#[derive(Debug, Default, Clone)]
pub struct MemoryCursor {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl MemoryCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }
}

impl BufferedCursor for MemoryCursor {
    fn write(&mut self, data: &[u8]) -> FecResult<()> {
        let at = self.write_pos;
        self.data.splice(at..at, data.iter().copied());
        self.write_pos += data.len();
        Ok(())
    }

    fn read(&mut self, n: usize) -> FecResult<Vec<u8>> {
        let end = self.read_pos.saturating_add(n).min(self.data.len());
        let out = self.data[self.read_pos..end].to_vec();
        self.read_pos = end;
        Ok(out)
    }

    fn read_all(&mut self) -> FecResult<Vec<u8>> {
        self.read_pos = self.data.len();
        Ok(self.data.clone())
    }

    fn seek_read(&mut self, offset: i64, whence: Whence) {
        self.read_pos = resolve(self.read_pos, self.data.len(), offset, whence);
    }

    fn seek_write(&mut self, offset: i64, whence: Whence) {
        self.write_pos = resolve(self.write_pos, self.data.len(), offset, whence);
    }

    fn tell_read(&self) -> usize {
        self.read_pos
    }

    fn tell_write(&self) -> usize {
        self.write_pos
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Cursor over an anonymous temporary file, removed when the cursor is dropped.
#[derive(Debug)]
pub struct FileCursor {
    file: File,
    len: usize,
    read_pos: usize,
    write_pos: usize,
}

impl FileCursor {
    pub fn new() -> FecResult<Self> {
        Ok(Self {
            file: tempfile::tempfile()?,
            len: 0,
            read_pos: 0,
            write_pos: 0,
        })
    }

    fn read_range(&mut self, start: usize, end: usize) -> FecResult<Vec<u8>> {
        let mut buf = vec![0u8; end - start];
        self.file.seek(SeekFrom::Start(start as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl BufferedCursor for FileCursor {
    fn write(&mut self, data: &[u8]) -> FecResult<()> {
        let tail = if self.write_pos < self.len {
            self.read_range(self.write_pos, self.len)?
        } else {
            Vec::new()
        };
        self.file.seek(SeekFrom::Start(self.write_pos as u64))?;
        self.file.write_all(data)?;
        self.file.write_all(&tail)?;
        self.len += data.len();
        self.write_pos += data.len();
        Ok(())
    }

    fn read(&mut self, n: usize) -> FecResult<Vec<u8>> {
        let end = self.read_pos.saturating_add(n).min(self.len);
        let out = self.read_range(self.read_pos, end)?;
        self.read_pos = end;
        Ok(out)
    }

    fn read_all(&mut self) -> FecResult<Vec<u8>> {
        let out = self.read_range(0, self.len)?;
        self.read_pos = self.len;
        Ok(out)
    }

    fn seek_read(&mut self, offset: i64, whence: Whence) {
        self.read_pos = resolve(self.read_pos, self.len, offset, whence);
    }

    fn seek_write(&mut self, offset: i64, whence: Whence) {
        self.write_pos = resolve(self.write_pos, self.len, offset, whence);
    }

    fn tell_read(&self) -> usize {
        self.read_pos
    }

    fn tell_write(&self) -> usize {
        self.write_pos
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Picks a cursor backing from the expected size of the data.
#[derive(Debug, Clone, Copy)]
pub struct CursorFactory {
    spill_threshold: usize,
}

impl CursorFactory {
    pub fn new(spill_threshold: usize) -> Self {
        Self { spill_threshold }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.spill_threshold_bytes)
    }

    pub fn create(&self, expected_size: usize) -> FecResult<Box<dyn BufferedCursor>> {
        new_cursor(expected_size, self.spill_threshold)
    }
}

/// In-memory cursor below `spill_threshold` bytes, file-backed at or above it.
pub fn new_cursor(expected_size: usize, spill_threshold: usize) -> FecResult<Box<dyn BufferedCursor>> {
    if expected_size >= spill_threshold {
        Ok(Box::new(FileCursor::new()?))
    } else {
        Ok(Box::new(MemoryCursor::with_capacity(expected_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backings() -> Vec<Box<dyn BufferedCursor>> {
        vec![Box::new(MemoryCursor::new()), Box::new(FileCursor::new().unwrap())]
    }

    #[test]
    fn test_sequential_writes_concatenate() {
        for mut cursor in backings() {
            cursor.write(b"abc").unwrap();
            cursor.write(b"def").unwrap();
            assert_eq!(cursor.read_all().unwrap(), b"abcdef");
            assert!(cursor.eof());
        }
    }

    #[test]
    fn test_write_in_middle_keeps_tail() {
        for mut cursor in backings() {
            cursor.write(b"abcd").unwrap();
            cursor.seek_write(2, Whence::Start);
            cursor.write(b"XY").unwrap();
            assert_eq!(cursor.tell_write(), 4);
            assert_eq!(cursor.read_all().unwrap(), b"abXYcd");
        }
    }

    #[test]
    fn test_seeks_clamp_to_bounds() {
        for mut cursor in backings() {
            cursor.write(b"hello").unwrap();

            cursor.seek_read(100, Whence::Start);
            assert_eq!(cursor.tell_read(), 5);
            cursor.seek_read(-100, Whence::Current);
            assert_eq!(cursor.tell_read(), 0);
            cursor.seek_write(42, Whence::Current);
            assert_eq!(cursor.tell_write(), 5);
            cursor.seek_write(-9, Whence::End);
            assert_eq!(cursor.tell_write(), 0);
        }
    }

    #[test]
    fn test_end_uses_offset_magnitude() {
        for mut cursor in backings() {
            cursor.write(b"0123456789").unwrap();
            cursor.seek_read(3, Whence::End);
            assert_eq!(cursor.tell_read(), 7);
            cursor.seek_read(-3, Whence::End);
            assert_eq!(cursor.tell_read(), 7);
            assert_eq!(cursor.read(10).unwrap(), b"789");
        }
    }

    #[test]
    fn test_read_is_independent_of_write() {
        for mut cursor in backings() {
            cursor.write(b"abc").unwrap();
            assert_eq!(cursor.tell_read(), 0);
            assert_eq!(cursor.remaining(), 3);
            assert_eq!(cursor.read(2).unwrap(), b"ab");
            cursor.write(b"d").unwrap();
            assert_eq!(cursor.read(5).unwrap(), b"cd");
            assert!(cursor.eof());
            assert!(cursor.read(1).unwrap().is_empty());
        }
    }

    #[test]
    fn test_empty_cursor_is_at_eof() {
        for cursor in backings() {
            assert!(cursor.is_empty());
            assert!(cursor.eof());
        }
    }

    #[test]
    fn test_factory_spills_at_threshold() {
        let factory = CursorFactory::new(1024);
        let mut small = factory.create(10).unwrap();
        let mut large = factory.create(1024).unwrap();
        small.write(b"x").unwrap();
        large.write(b"x").unwrap();
        assert_eq!(small.read_all().unwrap(), large.read_all().unwrap());
    }
}
