//! Read-only EROFS driver.
//!
//! Supports compact and extended inodes, the flat (plain/inline),
//! chunk-based and LZ4-compressed (full and compact index) data
//! layouts, tailpacking, fragment tails in the packed inode and
//! interlaced plain pclusters.

pub mod structures;
pub mod volume;
pub mod zdata;
pub mod zmap;

use strata_core::{
    DirEntry, Disk, EntryInfo, Error, FileHandle, FileKind, FileReader, FilesystemDriver, NodeOps,
    Result, WalkConfig, WalkEntry, find_file,
};

use structures::*;
use volume::{Inode, Volume};
use zdata::{ZState, pread};

fn file_kind(file_type: u8) -> FileKind {
    match file_type {
        FT_DIR => FileKind::Directory,
        FT_SYMLINK => FileKind::Symlink,
        FT_UNKNOWN => FileKind::Unknown,
        _ => FileKind::Regular,
    }
}

/// Lists `(name, file_type, nid)` of a directory inode, handling
/// compressed directory data like any other content.
fn iterate_dir(vol: &Volume, inode: &Inode) -> Result<Vec<(String, u8, u64)>> {
    let blocksz = vol.block_size();
    let mut entries = Vec::new();
    let mut zstate: Option<ZState> = None;
    let mut offset = 0u64;

    while offset < inode.file_size {
        let maxsize = blocksz.min(inode.file_size - offset) as usize;
        let mut block = vec![0u8; maxsize];
        pread(vol, inode, &mut zstate, offset, &mut block)?;

        if maxsize < DIRENT_SIZE {
            return Err(Error::bad_fs(format!(
                "short dirent block @ inode {}",
                inode.nid
            )));
        }
        let head: Dirent = bytemuck::cast(<[u8; 12]>::try_from(&block[..12]).unwrap());
        let nameoff0 = head.nameoff.get() as usize;
        if nameoff0 < DIRENT_SIZE || nameoff0 as u64 > blocksz || nameoff0 > maxsize {
            return Err(Error::bad_fs(format!(
                "invalid de[0].nameoff {nameoff0} @ inode {}",
                inode.nid
            )));
        }

        let count = nameoff0 / DIRENT_SIZE;
        for i in 0..count {
            let at = i * DIRENT_SIZE;
            let de: Dirent =
                bytemuck::cast(<[u8; 12]>::try_from(&block[at..at + 12]).unwrap());
            let nameoff = de.nameoff.get() as usize;
            if nameoff < nameoff0 || nameoff > maxsize {
                return Err(Error::bad_fs(format!(
                    "invalid dirent nameoff @ inode {}",
                    inode.nid
                )));
            }
            let name_end = if i + 1 < count {
                let next: Dirent = bytemuck::cast(
                    <[u8; 12]>::try_from(&block[at + 12..at + 24]).unwrap(),
                );
                next.nameoff.get() as usize
            } else {
                // The final name runs to its NUL or the block end.
                let tail = &block[nameoff..];
                nameoff + tail.iter().position(|&b| b == 0).unwrap_or(tail.len())
            };
            if name_end < nameoff || name_end > maxsize || name_end - nameoff > NAME_MAX {
                return Err(Error::bad_fs(format!(
                    "invalid dirent name @ inode {}",
                    inode.nid
                )));
            }
            let name = String::from_utf8_lossy(&block[nameoff..name_end]).into_owned();
            entries.push((name, de.file_type, de.nid.get()));
        }
        offset += maxsize as u64;
    }
    Ok(entries)
}

fn read_symlink(vol: &Volume, inode: &Inode) -> Result<String> {
    let mut content = vec![0u8; inode.file_size as usize];
    let mut zstate = None;
    pread(vol, inode, &mut zstate, 0, &mut content)?;
    Ok(String::from_utf8_lossy(&content).into_owned())
}

struct Ops<'a> {
    vol: &'a Volume,
}

impl NodeOps for Ops<'_> {
    type Node = u64;

    fn read_dir_node(&mut self, dir: &u64) -> Result<Vec<WalkEntry<u64>>> {
        let inode = self.vol.read_inode(*dir)?;
        if !inode.is_dir() {
            return Err(Error::bad_fs("walking through a non-directory inode"));
        }
        Ok(iterate_dir(self.vol, &inode)?
            .into_iter()
            .map(|(name, file_type, nid)| WalkEntry {
                name,
                kind: file_kind(file_type),
                node: nid,
                case_insensitive: false,
            })
            .collect())
    }

    fn read_link(&mut self, node: &u64) -> Result<String> {
        let inode = self.vol.read_inode(*node)?;
        read_symlink(self.vol, &inode)
    }
}

struct ErofsFileReader {
    vol: Volume,
    inode: Inode,
    zstate: Option<ZState>,
}

impl FileReader for ErofsFileReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        pread(&self.vol, &self.inode, &mut self.zstate, offset, buf)?;
        Ok(buf.len())
    }
}

pub struct ErofsDriver;

impl FilesystemDriver for ErofsDriver {
    fn name(&self) -> &'static str {
        "erofs"
    }

    fn probe(&self, disk: &Disk) -> Result<()> {
        Volume::mount(disk).map(|_| ())
    }

    fn open(&self, disk: &Disk, path: &str, cfg: &WalkConfig) -> Result<FileHandle> {
        let vol = Volume::mount(disk)?;
        let root = vol.sb.root_nid.get() as u64;
        let nid = find_file(&mut Ops { vol: &vol }, &root, path, FileKind::Regular, cfg)?;
        let inode = vol.read_inode(nid)?;
        let size = inode.file_size;
        log::trace!(target: "erofs", "open {} -> nid {} ({} bytes)", path, nid, size);
        Ok(FileHandle::new(
            size,
            Box::new(ErofsFileReader {
                vol,
                inode,
                zstate: None,
            }),
        )
        .with_hook_slot(disk.hook_slot()))
    }

    fn read_dir(&self, disk: &Disk, path: &str, cfg: &WalkConfig) -> Result<Vec<DirEntry>> {
        let vol = Volume::mount(disk)?;
        let root = vol.sb.root_nid.get() as u64;
        let nid = find_file(&mut Ops { vol: &vol }, &root, path, FileKind::Directory, cfg)?;
        let dir = vol.read_inode(nid)?;

        let mut out = Vec::new();
        for (name, file_type, entry_nid) in iterate_dir(&vol, &dir)? {
            // Entry metadata is best effort; a broken child inode must
            // not hide the listing itself.
            let mut info = EntryInfo {
                kind: file_kind(file_type),
                inode: Some(entry_nid),
                ..Default::default()
            };
            if let Ok(inode) = vol.read_inode(entry_nid) {
                info.mtime = Some(inode.mtime as i64);
                info.size = Some(inode.file_size);
            }
            out.push(DirEntry { name, info });
        }
        Ok(out)
    }

    fn uuid(&self, disk: &Disk) -> Result<String> {
        let vol = Volume::mount(disk)?;
        let u = vol.sb.uuid;
        Ok(format!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            u[0], u[1], u[2], u[3], u[4], u[5], u[6], u[7], u[8], u[9], u[10], u[11], u[12], u[13],
            u[14], u[15]
        ))
    }

    fn label(&self, disk: &Disk) -> Result<String> {
        let vol = Volume::mount(disk)?;
        let name = vol.sb.volume_name;
        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Ok(String::from_utf8_lossy(&name[..len]).into_owned())
    }

    fn mtime(&self, disk: &Disk) -> Result<i64> {
        let vol = Volume::mount(disk)?;
        Ok(vol.sb.build_time.get() as i64)
    }
}
