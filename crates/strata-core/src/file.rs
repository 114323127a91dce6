//! Opened file handles.

use crate::disk::{ReadHook, ReadHookSlot};
use crate::error::Result;
use crate::walker::FileKind;

/// Per-format read state behind a [`FileHandle`].
///
/// `read_at` fills as much of `buf` as the file provides at `offset`; the
/// handle has already clamped the request to the file size, so an
/// implementation returning fewer bytes than requested signals
/// truncated metadata and surfaces as an error upstream.
pub trait FileReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// The result of a successful open: file size, a cursor, the per-format
/// reader, and optionally the read hook plumbing of the disk the file
/// lives on.
pub struct FileHandle {
    size: u64,
    offset: u64,
    reader: Box<dyn FileReader>,
    hook_slot: Option<ReadHookSlot>,
    hook: Option<ReadHook>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("size", &self.size)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl FileHandle {
    pub fn new(size: u64, reader: Box<dyn FileReader>) -> Self {
        Self {
            size,
            offset: 0,
            reader,
            hook_slot: None,
            hook: None,
        }
    }

    /// Attaches the hook slot of the disk this file reads from, enabling
    /// [`FileHandle::set_read_hook`].
    pub fn with_hook_slot(mut self, slot: ReadHookSlot) -> Self {
        self.hook_slot = Some(slot);
        self
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Installs an observer called with `(sector, length)` for every
    /// physical disk read this handle causes. No-op for handles that do
    /// not read from a disk (for example fully decoded filter output).
    pub fn set_read_hook(&mut self, hook: ReadHook) {
        self.hook = Some(hook);
    }

    pub fn clear_read_hook(&mut self) {
        self.hook = None;
    }

    /// Moves the cursor, clamped to `[0, size]`.
    pub fn seek(&mut self, pos: u64) -> u64 {
        self.offset = pos.min(self.size);
        self.offset
    }

    /// Reads at the cursor and advances it. At or past EOF returns 0.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let got = self.read_at(self.offset, buf)?;
        self.offset += got as u64;
        Ok(got)
    }

    /// Positional read; does not move the cursor.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((self.size - offset) as usize);
        let installed = self.hook.is_some() && self.hook_slot.is_some();
        if installed {
            let slot = self.hook_slot.as_ref().unwrap();
            *slot.borrow_mut() = self.hook.take();
        }
        let result = self.reader.read_at(offset, &mut buf[..want]);
        if installed {
            let slot = self.hook_slot.as_ref().unwrap();
            self.hook = slot.borrow_mut().take();
        }
        result
    }

    /// Reads the remainder of the file from the cursor.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; (self.size - self.offset) as usize];
        let mut done = 0;
        while done < out.len() {
            let got = self.read(&mut out[done..])?;
            if got == 0 {
                out.truncate(done);
                break;
            }
            done += got;
        }
        Ok(out)
    }
}

/// A reader over a fully materialised buffer. Filters and archive entries
/// that decode eagerly use this.
pub struct MemReader {
    data: Vec<u8>,
}

impl MemReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_handle(self) -> FileHandle {
        let size = self.data.len() as u64;
        FileHandle::new(size, Box::new(self))
    }
}

impl FileReader for MemReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let start = offset as usize;
        let n = buf.len().min(self.data.len().saturating_sub(start));
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// Metadata yielded per directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryInfo {
    pub kind: FileKind,
    /// Name comparison inside this entry's filesystem ignores case.
    pub case_insensitive: bool,
    /// Modification time, unix seconds.
    pub mtime: Option<i64>,
    pub inode: Option<u64>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub info: EntryInfo,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.info.kind == FileKind::Directory
    }
}
