//! The front object tying disks, registries and the resolver together.

use std::path::Path;

use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::file::{DirEntry, FileHandle};
use crate::filter::{FileFilter, MAGIC_PROBE_LEN};
use crate::fsdriver::{DiskFilterDriver, FilesystemDriver, PartitionMapDriver};
use crate::loopback::LoopbackTable;
use crate::resolver::{DeviceSpec, PartSelector, split_path};
use crate::source::{ByteSource, FileSource, share};
use crate::walker::WalkConfig;

#[derive(Debug, Clone, Copy)]
pub struct VfsOptions {
    /// Default comparison mode for filesystems that do not mark their
    /// entries case-insensitive themselves.
    pub case_sensitive: bool,
    pub max_symlink_depth: u32,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            max_symlink_depth: 8,
        }
    }
}

/// A configured stack: registered disk images, module registries and the
/// loopback table. Registries are append-only after setup; registration
/// order is probe order.
pub struct Vfs {
    options: VfsOptions,
    filesystems: Vec<Box<dyn FilesystemDriver>>,
    partition_maps: Vec<Box<dyn PartitionMapDriver>>,
    disk_filters: Vec<Box<dyn DiskFilterDriver>>,
    filters: Vec<Box<dyn FileFilter>>,
    images: Vec<Disk>,
    arrays: Vec<Disk>,
    loopbacks: LoopbackTable,
}

impl Vfs {
    pub fn new(options: VfsOptions) -> Self {
        Self {
            options,
            filesystems: Vec::new(),
            partition_maps: Vec::new(),
            disk_filters: Vec::new(),
            filters: Vec::new(),
            images: Vec::new(),
            arrays: Vec::new(),
            loopbacks: LoopbackTable::new(),
        }
    }

    pub fn options(&self) -> VfsOptions {
        self.options
    }

    pub fn walk_config(&self) -> WalkConfig {
        WalkConfig {
            case_fold: !self.options.case_sensitive,
            max_symlink_depth: self.options.max_symlink_depth,
        }
    }

    pub fn register_filesystem(&mut self, driver: Box<dyn FilesystemDriver>) {
        log::trace!(target: "vfs", "register filesystem {}", driver.name());
        self.filesystems.push(driver);
    }

    pub fn register_partition_map(&mut self, driver: Box<dyn PartitionMapDriver>) {
        log::trace!(target: "vfs", "register partition map {}", driver.name());
        self.partition_maps.push(driver);
    }

    pub fn register_disk_filter(&mut self, driver: Box<dyn DiskFilterDriver>) {
        log::trace!(target: "vfs", "register disk filter {}", driver.name());
        self.disk_filters.push(driver);
    }

    pub fn register_filter(&mut self, filter: Box<dyn FileFilter>) {
        log::trace!(target: "vfs", "register file filter {}", filter.name());
        self.filters.push(filter);
    }

    /// Registers a disk image file under `name`.
    pub fn add_image(&mut self, name: &str, path: impl AsRef<Path>) -> Result<()> {
        let source = FileSource::open(path)?;
        self.add_image_source(name, source);
        Ok(())
    }

    /// Registers an in-memory or custom source under `name`.
    pub fn add_image_source(&mut self, name: &str, source: impl ByteSource + 'static) {
        self.images.push(Disk::new(name, share(source)));
    }

    /// Runs every disk-filter driver over the registered images and adds
    /// the assembled arrays as openable disks. Returns how many arrays
    /// were found.
    pub fn scan_disk_filters(&mut self) -> Result<usize> {
        let mut found = 0;
        for driver in &self.disk_filters {
            for array in driver.assemble(&self.images)? {
                log::debug!(target: "vfs", "disk filter {} assembled {}", driver.name(), array.name());
                self.arrays.push(array);
                found += 1;
            }
        }
        Ok(found)
    }

    fn open_leaf(&self, name: &str) -> Result<Disk> {
        // Loopbacks shadow images of the same name.
        if let Some(source) = self.loopbacks.get(name) {
            return Ok(Disk::new(name, source));
        }
        self.arrays
            .iter()
            .chain(self.images.iter())
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| Error::NoSuchDevice(name.to_string()))
    }

    fn apply_selector(&self, disk: Disk, sel: &PartSelector) -> Result<Disk> {
        for map in &self.partition_maps {
            if map.name() != sel.map {
                continue;
            }
            // Map-parse failures are speculative-probe errors; the
            // caller only learns the partition could not be found.
            let entries = match map.entries(&disk) {
                Ok(entries) => entries,
                Err(err) => {
                    log::trace!(target: "vfs", "{} on {}: {}", map.name(), disk.name(), err);
                    break;
                }
            };
            let entry = entries
                .into_iter()
                .find(|e| e.number == sel.number)
                .ok_or_else(|| {
                    Error::NoSuchPartition(format!("{},{}{}", disk.name(), sel.map, sel.number))
                })?;
            let name = format!("{},{}{}", disk.name(), sel.map, sel.number);
            return disk.slice(
                name,
                entry.start_sector,
                entry.num_sectors,
                entry.index,
                entry.number,
            );
        }
        Err(Error::NoSuchPartition(format!(
            "{},{}{}",
            disk.name(),
            sel.map,
            sel.number
        )))
    }

    /// Opens a device spec (`hd0,gpt1`, parentheses optional) down to the
    /// final slice.
    pub fn disk_open(&self, spec: &str) -> Result<Disk> {
        let trimmed = spec
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(spec);
        let spec = DeviceSpec::parse(trimmed)?;
        self.resolve_device(&spec)
    }

    fn resolve_device(&self, spec: &DeviceSpec) -> Result<Disk> {
        let mut disk = self.open_leaf(&spec.disk)?;
        for sel in &spec.selectors {
            disk = self.apply_selector(disk, sel)?;
        }
        Ok(disk)
    }

    /// First registered filesystem whose probe accepts the disk.
    /// Probe failures of non-matching drivers are discarded.
    pub fn probe(&self, disk: &Disk) -> Result<&dyn FilesystemDriver> {
        for driver in &self.filesystems {
            match driver.probe(disk) {
                Ok(()) => {
                    log::trace!(target: "vfs", "{} claims {}", driver.name(), disk.name());
                    return Ok(driver.as_ref());
                }
                Err(err) => {
                    log::trace!(target: "vfs", "{} rejects {}: {}", driver.name(), disk.name(), err)
                }
            }
        }
        Err(Error::UnknownFs)
    }

    fn resolve(&self, path: &str) -> Result<(Disk, String)> {
        let (spec, subpath) = split_path(path)?;
        let spec = spec.ok_or_else(|| Error::BadFilename(path.to_string()))?;
        let disk = self.resolve_device(&spec)?;
        let subpath = if subpath.is_empty() { "/" } else { subpath };
        Ok((disk, subpath.to_string()))
    }

    /// Opens a file without applying the filter chain.
    pub fn open_raw(&self, path: &str) -> Result<FileHandle> {
        let (disk, subpath) = self.resolve(path)?;
        let fs = self.probe(&disk)?;
        fs.open(&disk, &subpath, &self.walk_config())
    }

    /// Opens a file; if its extension or magic matches a registered
    /// filter, the returned handle yields the decoded stream.
    pub fn open(&self, path: &str) -> Result<FileHandle> {
        let mut handle = self.open_raw(path)?;
        let leaf = path.rsplit('/').next().unwrap_or(path);
        let mut magic = [0u8; MAGIC_PROBE_LEN];
        let got = handle.read_at(0, &mut magic)?;
        for filter in &self.filters {
            if filter.matches(leaf, &magic[..got]) {
                log::debug!(target: "vfs", "filter {} wraps {}", filter.name(), path);
                return filter.wrap(handle);
            }
        }
        Ok(handle)
    }

    /// Lists a directory. `.` and `..` entries from the low-level
    /// iterators are filtered out here.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (disk, subpath) = self.resolve(path)?;
        let fs = self.probe(&disk)?;
        let mut entries = fs.read_dir(&disk, &subpath, &self.walk_config())?;
        entries.retain(|e| e.name != "." && e.name != "..");
        Ok(entries)
    }

    pub fn loopback_add(&mut self, name: &str, handle: FileHandle) -> Result<()> {
        self.loopbacks.add(name, handle)
    }

    pub fn loopback_delete(&mut self, name: &str) -> Result<()> {
        self.loopbacks.delete(name)
    }

    pub fn loopbacks(&self) -> Vec<String> {
        self.loopbacks.names().map(str::to_string).collect()
    }

    pub fn disks(&self) -> Vec<String> {
        self.arrays
            .iter()
            .chain(self.images.iter())
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Lists the partitions every registered map finds on `disk`.
    pub fn partitions(&self, disk: &Disk) -> Vec<(String, Vec<crate::fsdriver::PartitionEntry>)> {
        let mut out = Vec::new();
        for map in &self.partition_maps {
            if let Ok(entries) = map.entries(disk)
                && !entries.is_empty()
            {
                out.push((map.name().to_string(), entries));
            }
        }
        out
    }

    pub fn fs_label(&self, disk: &Disk) -> Result<String> {
        self.probe(disk)?.label(disk)
    }

    pub fn fs_uuid(&self, disk: &Disk) -> Result<String> {
        self.probe(disk)?.uuid(disk)
    }

    pub fn fs_mtime(&self, disk: &Disk) -> Result<i64> {
        self.probe(disk)?.mtime(disk)
    }
}
