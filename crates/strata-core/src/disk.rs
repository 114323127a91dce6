//! Named byte-addressable disks and partition slices.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::source::SharedSource;

pub const DEFAULT_LOG2_SECTOR_SIZE: u8 = 9;

/// Observer invoked with `(sector, length)` for every physical read that
/// goes through a disk. Consumers use it to build sector maps of a file.
pub type ReadHook = Box<dyn FnMut(u64, usize)>;

/// The hook slot is shared by a disk and all slices derived from it, so a
/// file handle can install its hook for the duration of a read no matter
/// how deep the slice it ultimately reads from is.
pub type ReadHookSlot = Rc<RefCell<Option<ReadHook>>>;

/// A contiguous, byte-addressable view of a [`crate::ByteSource`].
///
/// A freshly opened disk covers the whole source; `slice` derives
/// partition views. Cloning is cheap (the source is shared) and does not
/// duplicate any I/O state.
#[derive(Clone)]
pub struct Disk {
    name: String,
    source: SharedSource,
    start: u64,
    len: u64,
    log2_sector: u8,
    part_index: Option<u32>,
    part_number: Option<u32>,
    hook: ReadHookSlot,
}

impl Disk {
    pub fn new(name: impl Into<String>, source: SharedSource) -> Self {
        let len = source.borrow().len();
        Self {
            name: name.into(),
            source,
            start: 0,
            len,
            log2_sector: DEFAULT_LOG2_SECTOR_SIZE,
            part_index: None,
            part_number: None,
            hook: Rc::new(RefCell::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_bytes(&self) -> u64 {
        self.len
    }

    pub fn total_sectors(&self) -> u64 {
        self.len >> self.log2_sector
    }

    pub fn log2_sector_size(&self) -> u8 {
        self.log2_sector
    }

    pub fn sector_size(&self) -> u32 {
        1 << self.log2_sector
    }

    /// `(index, number)` of the partition this disk is a slice of.
    pub fn partition(&self) -> Option<(u32, u32)> {
        self.part_index.zip(self.part_number)
    }

    pub fn hook_slot(&self) -> ReadHookSlot {
        Rc::clone(&self.hook)
    }

    /// Reads `buf.len()` bytes starting at byte `offset` within this view.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = offset.checked_add(buf.len() as u64).ok_or(Error::OutOfRange)?;
        if end > self.len {
            return Err(Error::OutOfRange);
        }
        let abs = self.start + offset;
        if let Some(hook) = self.hook.borrow_mut().as_mut() {
            hook(abs >> self.log2_sector, buf.len());
        }
        self.source.borrow_mut().read_at(abs, buf)
    }

    /// Sector-addressed read: `offset` bytes into `sector`.
    pub fn read(&self, sector: u64, offset: u32, buf: &mut [u8]) -> Result<()> {
        let base = sector
            .checked_shl(self.log2_sector as u32)
            .ok_or(Error::OutOfRange)?;
        let off = base.checked_add(offset as u64).ok_or(Error::OutOfRange)?;
        self.read_at(off, buf)
    }

    /// Derives a partition view. `start_sector`/`num_sectors` are in this
    /// disk's sectors and must lie within it.
    pub fn slice(
        &self,
        name: impl Into<String>,
        start_sector: u64,
        num_sectors: u64,
        index: u32,
        number: u32,
    ) -> Result<Disk> {
        let start = start_sector
            .checked_shl(self.log2_sector as u32)
            .ok_or(Error::OutOfRange)?;
        let len = num_sectors
            .checked_shl(self.log2_sector as u32)
            .ok_or(Error::OutOfRange)?;
        if start.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(Error::OutOfRange);
        }
        Ok(Disk {
            name: name.into(),
            source: Rc::clone(&self.source),
            start: self.start + start,
            len,
            log2_sector: self.log2_sector,
            part_index: Some(index),
            part_number: Some(number),
            hook: Rc::clone(&self.hook),
        })
    }
}

impl core::fmt::Debug for Disk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Disk")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("len", &self.len)
            .field("partition", &self.partition())
            .finish()
    }
}
