//! Read-only WIM driver.
//!
//! Every image inside a `.wim` appears as a top-level directory named by
//! its 1-based index (`(hd0)/1/Windows/...`), with index 0 aliasing the
//! boot-selected image when one is set. File contents are found by
//! matching the directory entry's SHA-1 against the lookup table;
//! resources are read through the 32 KiB chunk machinery with a
//! one-chunk cache.

pub mod structures;

use std::cell::RefCell;

use strata_core::{
    DirEntry, Disk, EntryInfo, Error, FileHandle, FileKind, FileReader, FilesystemDriver, NodeOps,
    Result, WalkConfig, WalkEntry, find_file,
};
use strata_codec::{lzx_decompress, xpress_decompress};
use strata_usn::filetime_to_unix;

use structures::*;

fn utf16le_string(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

struct ChunkCache {
    resource_offset: u64,
    chunk: u64,
    data: Vec<u8>,
    valid: bool,
}

pub struct WimVolume {
    disk: Disk,
    size: u64,
    header: WimHeader,
    /// Metadata resource per image; slot 0 is the boot metadata.
    metas: Vec<ResourceHeader>,
    cache: RefCell<ChunkCache>,
}

impl WimVolume {
    pub fn mount(disk: &Disk) -> Result<Self> {
        let mut raw = [0u8; WIM_HEADER_SIZE];
        disk.read_at(0, &mut raw)
            .map_err(|_| Error::bad_fs("not a wim filesystem"))?;
        let header: WimHeader = bytemuck::cast(raw);
        if header.signature != WIM_SIGNATURE {
            return Err(Error::bad_fs("not a wim filesystem"));
        }
        // Spanned sets (.swm) are not supported.
        if header.part.get() != 1 || header.parts.get() != 1 {
            return Err(Error::unsupported("spanned wim set"));
        }
        if header.boot_index.get() > header.images.get() {
            return Err(Error::bad_fs("wim boot index out of range"));
        }
        if header.flags.get() & HDR_COMPRESS_LZMS != 0 {
            return Err(Error::unsupported("LZMS-compressed wim"));
        }

        let mut volume = Self {
            disk: disk.clone(),
            size: disk.total_bytes(),
            header,
            metas: vec![header.boot],
            cache: RefCell::new(ChunkCache {
                resource_offset: 0,
                chunk: 0,
                data: vec![0u8; WIM_CHUNK_LEN as usize],
                valid: false,
            }),
        };

        // Collect the per-image metadata resources from the lookup
        // table, in order.
        let lookup = volume.header.lookup;
        let mut offset = 0u64;
        while offset + LOOKUP_ENTRY_SIZE as u64 <= lookup.len.get() {
            let entry = volume.read_lookup_entry(&lookup, offset)?;
            if entry.resource.is_metadata() {
                volume.metas.push(entry.resource);
            }
            offset += LOOKUP_ENTRY_SIZE as u64;
        }
        if volume.metas.len() as u32 != volume.header.images.get() + 1 {
            return Err(Error::bad_fs("wim image count does not match lookup table"));
        }
        Ok(volume)
    }

    pub fn images(&self) -> u32 {
        self.header.images.get()
    }

    pub fn boot_index(&self) -> u32 {
        self.header.boot_index.get()
    }

    fn read_lookup_entry(&self, lookup: &ResourceHeader, offset: u64) -> Result<LookupEntry> {
        let mut raw = [0u8; LOOKUP_ENTRY_SIZE];
        self.read_resource(lookup, offset, &mut raw)?;
        Ok(bytemuck::cast(raw))
    }

    /// Finds the content resource for a directory entry's hash.
    fn find_by_hash(&self, hash: &[u8; 20]) -> Result<LookupEntry> {
        let lookup = self.header.lookup;
        let mut offset = 0u64;
        while offset + LOOKUP_ENTRY_SIZE as u64 <= lookup.len.get() {
            let entry = self.read_lookup_entry(&lookup, offset)?;
            if &entry.hash == hash {
                return Ok(entry);
            }
            offset += LOOKUP_ENTRY_SIZE as u64;
        }
        Err(Error::NotFound("wim stream for file hash".to_string()))
    }

    /// Byte offset of `chunk`'s compressed data, relative to the end of
    /// the chunk table. Out-of-range chunks resolve to the resource end
    /// so the final chunk's length falls out of the subtraction.
    fn chunk_offset(&self, res: &ResourceHeader, chunk: u64) -> Result<u64> {
        let zlen = res.zlen();
        let len = res.len.get();
        if len == 0 {
            return Ok(0);
        }
        let chunks = len.div_ceil(WIM_CHUNK_LEN);
        let entry_size: u64 = if len > 0xffff_ffff { 8 } else { 4 };
        let table_len = (chunks - 1) * entry_size;
        if table_len > zlen {
            return Err(Error::bad_fs("wim chunk table larger than resource"));
        }
        if chunk == 0 {
            return Ok(table_len);
        }
        if chunk >= chunks {
            return Ok(zlen);
        }
        let mut raw = [0u8; 8];
        self.disk.read_at(
            res.offset.get() + (chunk - 1) * entry_size,
            &mut raw[..entry_size as usize],
        )?;
        let entry = u64::from_le_bytes(raw);
        let offset = table_len + entry;
        if offset > zlen {
            return Err(Error::bad_fs("wim chunk offset beyond resource"));
        }
        Ok(offset)
    }

    /// Loads `chunk` of a compressed resource into the cache buffer.
    fn load_chunk(&self, res: &ResourceHeader, chunk: u64) -> Result<()> {
        let offset = self.chunk_offset(res, chunk)?;
        let next = self.chunk_offset(res, chunk + 1)?;
        if next < offset {
            return Err(Error::bad_fs("wim chunk table not monotonic"));
        }
        let zlen = (next - offset) as usize;

        let chunks = res.len.get().div_ceil(WIM_CHUNK_LEN);
        let mut expected = WIM_CHUNK_LEN;
        if chunk >= chunks - 1 {
            expected -= res.len.get().wrapping_neg() & (WIM_CHUNK_LEN - 1);
        }
        let expected = expected as usize;

        let mut cache = self.cache.borrow_mut();
        if zlen == expected {
            // The chunk did not compress; it is stored raw.
            self.disk
                .read_at(res.offset.get() + offset, &mut cache.data[..zlen])?;
        } else {
            let mut zbuf = vec![0u8; zlen];
            self.disk.read_at(res.offset.get() + offset, &mut zbuf)?;
            let flags = self.header.flags.get();
            let out = if flags & HDR_COMPRESS_LZX != 0 {
                lzx_decompress(&zbuf, expected)?
            } else if flags & HDR_COMPRESS_XPRESS != 0 {
                xpress_decompress(&zbuf, expected)?
            } else {
                return Err(Error::bad_fs("compressed chunk in uncompressed wim"));
            };
            cache.data[..expected].copy_from_slice(&out);
        }
        cache.resource_offset = res.offset.get();
        cache.chunk = chunk;
        cache.valid = true;
        Ok(())
    }

    /// Reads a byte range out of a (possibly chunked) resource.
    pub fn read_resource(&self, res: &ResourceHeader, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > res.len.get() {
            return Err(Error::OutOfRange);
        }
        if res.offset.get() + res.zlen() > self.size {
            return Err(Error::bad_fs("wim resource beyond the image"));
        }
        if !res.is_compressed() {
            return self.disk.read_at(res.offset.get() + offset, buf);
        }

        let mut offset = offset;
        let mut buf = buf;
        while !buf.is_empty() {
            let chunk = offset / WIM_CHUNK_LEN;
            let needs_load = {
                let cache = self.cache.borrow();
                !cache.valid || cache.resource_offset != res.offset.get() || cache.chunk != chunk
            };
            if needs_load {
                self.load_chunk(res, chunk)?;
            }
            let cache = self.cache.borrow();
            let skip = (offset % WIM_CHUNK_LEN) as usize;
            let frag = buf.len().min(WIM_CHUNK_LEN as usize - skip);
            let (head, tail) = buf.split_at_mut(frag);
            head.copy_from_slice(&cache.data[skip..skip + frag]);
            offset += frag as u64;
            buf = tail;
        }
        Ok(())
    }

    /// Root node of an image: skip the security table, read the root
    /// directory entry, descend to its children.
    fn image_root(&self, image: u32) -> Result<WimNode> {
        if image == 0 && self.boot_index() == 0 {
            return Err(Error::NotFound("no bootable wim image".to_string()));
        }
        let meta = *self
            .metas
            .get(image as usize)
            .ok_or_else(|| Error::NotFound(format!("wim image {image}")))?;

        let mut raw = [0u8; 8];
        self.read_resource(&meta, 0, &mut raw)?;
        let security: SecurityHeader = bytemuck::cast(raw);
        let root_offset = (security.len.get() as u64).next_multiple_of(8);

        let root = self.read_dirent(&meta, root_offset)?;
        let Some((entry, _)) = root else {
            return Err(Error::bad_fs("wim image without a root directory"));
        };
        Ok(WimNode {
            meta,
            subdir: entry.subdir.get(),
            attributes: entry.attributes.get(),
            hash: entry.hash,
            mtime: entry.mtime.get(),
        })
    }

    /// Reads the fixed part of the directory entry at `offset`, or
    /// `None` at the zero terminator.
    fn read_dirent(
        &self,
        meta: &ResourceHeader,
        offset: u64,
    ) -> Result<Option<(DirectoryEntry, u64)>> {
        let mut raw_len = [0u8; 8];
        self.read_resource(meta, offset, &mut raw_len)?;
        let len = u64::from_le_bytes(raw_len);
        if len == 0 {
            return Ok(None);
        }
        if len < DIRECTORY_ENTRY_SIZE as u64 {
            return Err(Error::bad_fs("wim directory entry too short"));
        }
        let mut raw = [0u8; DIRECTORY_ENTRY_SIZE];
        self.read_resource(meta, offset, &mut raw)?;
        Ok(Some((bytemuck::cast(raw), len)))
    }

    fn iterate_dir(&self, node: &WimNode) -> Result<Vec<(String, WimNode)>> {
        let mut entries = Vec::new();
        let mut offset = node.subdir;
        loop {
            let Some((entry, len)) = self.read_dirent(&node.meta, offset)? else {
                break;
            };
            let name_len = entry.name_len.get() as usize;
            if name_len >= 2 {
                let mut name_raw = vec![0u8; name_len];
                self.read_resource(&node.meta, offset + DIRECTORY_ENTRY_SIZE as u64, &mut name_raw)?;
                entries.push((
                    utf16le_string(&name_raw),
                    WimNode {
                        meta: node.meta,
                        subdir: entry.subdir.get(),
                        attributes: entry.attributes.get(),
                        hash: entry.hash,
                        mtime: entry.mtime.get(),
                    },
                ));
            }
            offset += len;
        }
        Ok(entries)
    }
}

#[derive(Clone)]
pub struct WimNode {
    meta: ResourceHeader,
    subdir: u64,
    attributes: u32,
    hash: [u8; 20],
    mtime: u64,
}

impl WimNode {
    fn kind(&self) -> FileKind {
        if self.attributes & ATTR_DIRECTORY != 0 {
            FileKind::Directory
        } else {
            FileKind::Regular
        }
    }
}

struct Ops<'a> {
    vol: &'a WimVolume,
}

impl NodeOps for Ops<'_> {
    type Node = WimNode;

    fn read_dir_node(&mut self, dir: &WimNode) -> Result<Vec<WalkEntry<WimNode>>> {
        Ok(self
            .vol
            .iterate_dir(dir)?
            .into_iter()
            .map(|(name, node)| {
                let kind = node.kind();
                WalkEntry {
                    name,
                    kind,
                    node,
                    case_insensitive: true,
                }
            })
            .collect())
    }
}

/// Splits `1/Windows/System32` into the image number and the in-image
/// path.
fn split_image_path(path: &str) -> Result<(u32, &str)> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(Error::BadFilename(path.to_string()));
    }
    let (image, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
    let image: u32 = image
        .parse()
        .map_err(|_| Error::NotFound(format!("wim image `{image}`")))?;
    Ok((image, rest))
}

struct WimFileReader {
    vol: WimVolume,
    resource: ResourceHeader,
}

impl FileReader for WimFileReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.vol.read_resource(&self.resource, offset, buf)?;
        Ok(buf.len())
    }
}

pub struct WimDriver;

impl FilesystemDriver for WimDriver {
    fn name(&self) -> &'static str {
        "wim"
    }

    fn probe(&self, disk: &Disk) -> Result<()> {
        WimVolume::mount(disk).map(|_| ())
    }

    fn open(&self, disk: &Disk, path: &str, cfg: &WalkConfig) -> Result<FileHandle> {
        let vol = WimVolume::mount(disk)?;
        let (image, subpath) = split_image_path(path)?;
        let root = vol.image_root(image)?;
        let node = find_file(&mut Ops { vol: &vol }, &root, subpath, FileKind::Regular, cfg)?;
        let entry = vol.find_by_hash(&node.hash)?;
        let size = entry.resource.len.get();
        log::trace!(target: "wim", "open {} ({} bytes)", path, size);
        Ok(FileHandle::new(
            size,
            Box::new(WimFileReader {
                vol,
                resource: entry.resource,
            }),
        )
        .with_hook_slot(disk.hook_slot()))
    }

    fn read_dir(&self, disk: &Disk, path: &str, cfg: &WalkConfig) -> Result<Vec<DirEntry>> {
        let vol = WimVolume::mount(disk)?;

        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            // The filesystem root lists the images.
            let first = if vol.boot_index() == 0 { 1 } else { 0 };
            return Ok((first..=vol.images())
                .map(|i| DirEntry {
                    name: i.to_string(),
                    info: EntryInfo {
                        kind: FileKind::Directory,
                        case_insensitive: true,
                        ..Default::default()
                    },
                })
                .collect());
        }

        let (image, subpath) = split_image_path(path)?;
        let root = vol.image_root(image)?;
        let dir = find_file(&mut Ops { vol: &vol }, &root, subpath, FileKind::Directory, cfg)?;
        Ok(vol
            .iterate_dir(&dir)?
            .into_iter()
            .map(|(name, node)| {
                let size = if node.kind() == FileKind::Regular {
                    vol.find_by_hash(&node.hash)
                        .ok()
                        .map(|e| e.resource.len.get())
                } else {
                    None
                };
                DirEntry {
                    name,
                    info: EntryInfo {
                        kind: node.kind(),
                        case_insensitive: true,
                        mtime: Some(filetime_to_unix(node.mtime)),
                        size,
                        ..Default::default()
                    },
                }
            })
            .collect())
    }

    fn uuid(&self, disk: &Disk) -> Result<String> {
        let vol = WimVolume::mount(disk)?;
        let g = vol.header.guid;
        Ok(format!(
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            u32::from_le_bytes([g[0], g[1], g[2], g[3]]),
            u16::from_le_bytes([g[4], g[5]]),
            u16::from_le_bytes([g[6], g[7]]),
            g[8],
            g[9],
            g[10],
            g[11],
            g[12],
            g[13],
            g[14],
            g[15]
        ))
    }
}
