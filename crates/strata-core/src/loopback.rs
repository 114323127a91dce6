//! Named loopback devices.
//!
//! A loopback aliases an open file as a disk, so a nested image —
//! `(hd0,msdos1)/img.iso`, say — can itself be browsed with a single
//! composite path once added under a name. Entries are looked up by
//! linear name match in insertion order and refuse deletion while any
//! disk or handle still holds a reference to the underlying source.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::file::FileHandle;
use crate::source::{HandleSource, SharedSource, share};

struct Loopback {
    name: String,
    source: SharedSource,
}

#[derive(Default)]
pub struct LoopbackTable {
    entries: Vec<Loopback>,
}

impl LoopbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle`'s content under `name`.
    pub fn add(&mut self, name: &str, handle: FileHandle) -> Result<()> {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(Error::InUse(name.to_string()));
        }
        log::debug!(target: "loopback", "add {} ({} bytes)", name, handle.size());
        self.entries.push(Loopback {
            name: name.to_string(),
            source: share(HandleSource::new(handle)),
        });
        Ok(())
    }

    /// Removes `name`. Fails with [`Error::InUse`] while any open disk or
    /// handle still references the device.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| Error::NoSuchDevice(name.to_string()))?;
        if Rc::strong_count(&self.entries[pos].source) > 1 {
            return Err(Error::InUse(name.to_string()));
        }
        log::debug!(target: "loopback", "delete {}", name);
        self.entries.remove(pos);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedSource> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| Rc::clone(&e.source))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}
