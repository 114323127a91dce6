//! Random-access byte sources.
//!
//! A [`ByteSource`] is the bottom of every stack: a disk image file, an
//! in-memory buffer, or an already-open file handle re-exported as a
//! "disk" by the loopback table. Sources are shared single-threaded via
//! `Rc<RefCell<..>>`; the concurrency contract is one owner thread per
//! stack.

use std::cell::RefCell;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::file::FileHandle;

pub trait ByteSource {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// Reads crossing the end of the source fail with
    /// [`Error::OutOfRange`] before any byte is transferred.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type SharedSource = Rc<RefCell<dyn ByteSource>>;

pub fn share(source: impl ByteSource + 'static) -> SharedSource {
    Rc::new(RefCell::new(source))
}

/// A disk image backed by a regular file.
pub struct FileSource {
    file: fs::File,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset.checked_add(buf.len() as u64).is_none_or(|end| end > self.len) {
            return Err(Error::OutOfRange);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }
}

/// An in-memory disk image. Tests and the loopback of small archives use
/// this heavily.
pub struct MemSource {
    data: Vec<u8>,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for MemSource {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl ByteSource for MemSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| Error::OutOfRange)?;
        let end = start.checked_add(buf.len()).ok_or(Error::OutOfRange)?;
        let slice = self.data.get(start..end).ok_or(Error::OutOfRange)?;
        buf.copy_from_slice(slice);
        Ok(())
    }
}

/// Adapts an open [`FileHandle`] into a byte source, so a file inside a
/// filesystem can be aliased as a disk (loopback).
pub struct HandleSource {
    handle: FileHandle,
}

impl HandleSource {
    pub fn new(handle: FileHandle) -> Self {
        Self { handle }
    }
}

impl ByteSource for HandleSource {
    fn len(&self) -> u64 {
        self.handle.size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let got = self.handle.read_at(offset, buf)?;
        if got != buf.len() {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_source_bounds() {
        let mut src = MemSource::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 2];
        src.read_at(1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
        assert!(matches!(src.read_at(3, &mut buf), Err(Error::OutOfRange)));
        assert!(matches!(src.read_at(5, &mut buf), Err(Error::OutOfRange)));
    }

    #[test]
    fn file_source_reads() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"strata").unwrap();
        let mut src = FileSource::open(tmp.path()).unwrap();
        assert_eq!(src.len(), 6);
        let mut buf = [0u8; 3];
        src.read_at(2, &mut buf).unwrap();
        assert_eq!(&buf, b"rat");
    }
}
