//! Mounting, inode access and the uncompressed data path.

use strata_core::{Disk, Error, Result};

use crate::structures::*;

#[derive(Clone)]
pub struct Volume {
    pub disk: Disk,
    pub sb: SuperBlock,
}

/// An inode pulled into memory, layout fields decoded.
#[derive(Debug, Clone)]
pub struct Inode {
    pub nid: u64,
    pub extended: bool,
    pub datalayout: u8,
    pub mode: u16,
    pub file_size: u64,
    pub mtime: u64,
    pub xattr_icount: u16,
    /// `i_u`: raw block address, compressed block count or chunk format.
    pub union_raw: u32,
}

impl Inode {
    pub fn on_disk_size(&self) -> u64 {
        if self.extended { 64 } else { 32 }
    }

    pub fn xattr_ibody_size(&self) -> u64 {
        if self.xattr_icount == 0 {
            0
        } else {
            (XATTR_IBODY_HEADER_SIZE + (self.xattr_icount as u32 - 1) * 4) as u64
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// A mapped extent: logical range `m_la..m_la+m_llen` backed by physical
/// bytes `m_pa..m_pa+m_plen`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapBlocks {
    pub m_pa: u64,
    pub m_la: u64,
    pub m_plen: u64,
    pub m_llen: u64,
    pub m_flags: u32,
    pub m_algorithm: u8,
}

impl Volume {
    pub fn mount(disk: &Disk) -> Result<Self> {
        let mut raw = [0u8; core::mem::size_of::<SuperBlock>()];
        disk.read_at(SUPER_OFFSET, &mut raw)
            .map_err(|_| Error::bad_fs("not a valid erofs filesystem"))?;
        let sb: SuperBlock = bytemuck::cast(raw);
        if sb.magic.get() != SUPER_MAGIC {
            return Err(Error::bad_fs("not a valid erofs filesystem"));
        }
        if !(9..=12).contains(&sb.log2_blksz) {
            return Err(Error::bad_fs("erofs block size out of range"));
        }
        let feature = sb.feature_incompat.get();
        if feature & !ALL_FEATURE_INCOMPAT != 0 {
            return Err(Error::unsupported(format!(
                "erofs incompat features 0x{:x}",
                feature & !ALL_FEATURE_INCOMPAT
            )));
        }
        Ok(Self {
            disk: disk.clone(),
            sb,
        })
    }

    pub fn block_size(&self) -> u64 {
        1u64 << self.sb.log2_blksz
    }

    pub fn has_feature(&self, bit: u32) -> bool {
        self.sb.feature_incompat.get() & bit != 0
    }

    pub fn iloc(&self, nid: u64) -> u64 {
        ((self.sb.meta_blkaddr.get() as u64) << self.sb.log2_blksz) + (nid << ISLOT_BITS)
    }

    pub fn read_inode(&self, nid: u64) -> Result<Inode> {
        let addr = self.iloc(nid);
        let mut raw = [0u8; 32];
        self.disk.read_at(addr, &mut raw)?;
        let compact: InodeCompact = bytemuck::cast(raw);
        let format = compact.i_format.get();
        let version = (format >> I_VERSION_BIT) & I_VERSION_MASK;
        let datalayout = ((format >> I_DATALAYOUT_BIT) & I_DATALAYOUT_MASK) as u8;
        if datalayout > DATALAYOUT_CHUNK_BASED {
            return Err(Error::bad_fs(format!(
                "unknown data layout {datalayout} @ inode {nid}"
            )));
        }

        match version as u8 {
            INODE_LAYOUT_COMPACT => Ok(Inode {
                nid,
                extended: false,
                datalayout,
                mode: compact.i_mode.get(),
                file_size: compact.i_size.get() as u64,
                mtime: self.sb.build_time.get(),
                xattr_icount: compact.i_xattr_icount.get(),
                union_raw: compact.i_u.get(),
            }),
            INODE_LAYOUT_EXTENDED => {
                let mut raw = [0u8; 64];
                self.disk.read_at(addr, &mut raw)?;
                let ext: InodeExtended = bytemuck::cast(raw);
                Ok(Inode {
                    nid,
                    extended: true,
                    datalayout,
                    mode: ext.i_mode.get(),
                    file_size: ext.i_size.get(),
                    mtime: ext.i_mtime.get(),
                    xattr_icount: ext.i_xattr_icount.get(),
                    union_raw: ext.i_u.get(),
                })
            }
            other => Err(Error::bad_fs(format!(
                "invalid inode version {other} @ inode {nid}"
            ))),
        }
    }

    pub fn inode_nblocks(&self, inode: &Inode) -> u64 {
        inode.file_size.div_ceil(self.block_size())
    }

    /// Maps `la` for the flat (plain / tail-inline) layouts.
    fn map_flat(&self, inode: &Inode, la: u64) -> Result<MapBlocks> {
        let blocksz = self.block_size();
        let tailpacking = inode.datalayout == DATALAYOUT_FLAT_INLINE;
        let nblocks = self.inode_nblocks(inode);
        let lastblk = nblocks - if tailpacking { 1 } else { 0 };

        let mut map = MapBlocks {
            m_la: la,
            m_flags: MAP_MAPPED,
            ..Default::default()
        };
        if la < lastblk * blocksz {
            map.m_pa = (inode.union_raw as u64) * blocksz + la;
            map.m_plen = lastblk * blocksz - la;
        } else if tailpacking {
            map.m_pa =
                self.iloc(inode.nid) + inode.on_disk_size() + inode.xattr_ibody_size() + la % blocksz;
            map.m_plen = inode.file_size - la;
            if map.m_pa % blocksz + map.m_plen > blocksz {
                return Err(Error::bad_fs(format!(
                    "inline data crosses block boundary @ inode {}",
                    inode.nid
                )));
            }
        } else {
            return Err(Error::bad_fs(format!(
                "invalid map offset {la} @ inode {}",
                inode.nid
            )));
        }
        map.m_llen = map.m_plen;
        Ok(map)
    }

    /// Maps `la` for the chunk-based layout (block map or chunk
    /// indexes).
    fn map_chunk(&self, inode: &Inode, la: u64) -> Result<MapBlocks> {
        let chunk_format = (inode.union_raw & 0xffff) as u16;
        let indexes = chunk_format & CHUNK_FORMAT_INDEXES != 0;
        let unit = if indexes {
            core::mem::size_of::<ChunkIndex>() as u64
        } else {
            BLOCK_MAP_ENTRY_SIZE
        };
        let chunkbits =
            self.sb.log2_blksz as u32 + (chunk_format & CHUNK_FORMAT_BLKBITS_MASK) as u32;

        let chunknr = la >> chunkbits;
        let base = align_up(
            self.iloc(inode.nid) + inode.on_disk_size() + inode.xattr_ibody_size(),
            unit,
        );
        let pos = base + chunknr * unit;

        let mut map = MapBlocks {
            m_la: chunknr << chunkbits,
            ..Default::default()
        };
        map.m_plen = (1u64 << chunkbits)
            .min(align_up(inode.file_size - map.m_la, self.block_size()));

        let blkaddr = if indexes {
            let mut raw = [0u8; core::mem::size_of::<ChunkIndex>()];
            self.disk.read_at(pos, &mut raw)?;
            let idx: ChunkIndex = bytemuck::cast(raw);
            idx.blkaddr.get()
        } else {
            let mut raw = [0u8; 4];
            self.disk.read_at(pos, &mut raw)?;
            u32::from_le_bytes(raw)
        };

        if blkaddr == NULL_ADDR {
            map.m_pa = 0;
            map.m_flags = 0;
        } else {
            map.m_pa = (blkaddr as u64) << self.sb.log2_blksz;
            map.m_flags = MAP_MAPPED;
        }
        map.m_llen = map.m_plen;
        Ok(map)
    }

    pub fn map_blocks(&self, inode: &Inode, la: u64) -> Result<MapBlocks> {
        if la >= inode.file_size {
            return Ok(MapBlocks::default());
        }
        if inode.datalayout == DATALAYOUT_CHUNK_BASED {
            self.map_chunk(inode, la)
        } else {
            self.map_flat(inode, la)
        }
    }

    /// Reads `buf.len()` bytes at `offset` of an uncompressed-layout
    /// inode; holes and the area past EOF read as zeros.
    pub fn read_raw_data(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut cur = offset;
        let end = offset + buf.len() as u64;
        while cur < end {
            let map = self.map_blocks(inode, cur)?;
            let estart = (cur - offset) as usize;

            if map.m_flags & MAP_MAPPED == 0 {
                if map.m_llen == 0 {
                    // EOF
                    buf[estart..].fill(0);
                    break;
                }
                let eend = end.min(map.m_la + map.m_llen);
                buf[estart..(eend - offset) as usize].fill(0);
                cur = eend;
                continue;
            }

            let eend = end.min(map.m_la + map.m_llen);
            let moff = cur - map.m_la;
            let len = (eend - cur) as usize;
            self.disk
                .read_at(map.m_pa + moff, &mut buf[estart..estart + len])?;
            cur = eend;
        }
        Ok(())
    }
}
