//! Mapping logical offsets of compressed inodes to physical extents.
//!
//! The map recorder walks lcluster index entries (full 8-byte form or
//! the bit-packed compact form), resolving NONHEAD entries through their
//! lookback deltas until a HEAD is found, and computing the compressed
//! length of big pclusters from the D0_CBLKCNT marker.

use strata_core::{Error, Result};

use crate::structures::*;
use crate::volume::{Inode, MapBlocks, Volume};

/// Per-inode compression metadata, from the Z header.
#[derive(Debug, Clone, Default)]
pub struct ZInfo {
    pub advise: u16,
    pub algorithm: [u8; 2],
    pub log2_lclustersize: u8,
    pub tailextent_headlcn: u64,
    pub idataoff: u64,
    pub idatasize: u16,
    pub fragment_off: u64,
}

/// One cached metadata block.
pub struct MetaPage {
    index: u64,
    data: Vec<u8>,
}

impl MetaPage {
    pub fn new(block_size: u64) -> Self {
        Self {
            index: u64::MAX,
            data: vec![0u8; block_size as usize],
        }
    }

    fn load(&mut self, vol: &Volume, blkno: u64) -> Result<()> {
        if self.index == blkno {
            return Ok(());
        }
        let addr = blkno << vol.sb.log2_blksz;
        vol.disk.read_at(addr, &mut self.data)?;
        self.index = blkno;
        Ok(())
    }
}

struct MapRecorder<'a> {
    vol: &'a Volume,
    inode: &'a Inode,
    advise: u16,
    lclusterbits: u8,
    mpage: &'a mut MetaPage,

    lcn: u64,
    ltype: u8,
    headtype: u8,
    clusterofs: u32,
    delta: [u16; 2],
    pblk: u64,
    compressedblks: u64,
    nextpackoff: u64,
    partialref: bool,
}

impl<'a> MapRecorder<'a> {
    fn new(vol: &'a Volume, inode: &'a Inode, z: &ZInfo, mpage: &'a mut MetaPage) -> Self {
        Self {
            vol,
            inode,
            advise: z.advise,
            lclusterbits: z.log2_lclustersize,
            mpage,
            lcn: 0,
            ltype: 0,
            headtype: 0,
            clusterofs: 0,
            delta: [0; 2],
            pblk: 0,
            compressedblks: 0,
            nextpackoff: 0,
            partialref: false,
        }
    }

    fn index_base(&self) -> u64 {
        self.vol.iloc(self.inode.nid) + self.inode.on_disk_size() + self.inode.xattr_ibody_size()
    }

    fn load_full(&mut self, lcn: u64) -> Result<()> {
        let pos = full_index_start(self.index_base()) + lcn * LCLUSTER_INDEX_SIZE;
        self.mpage.load(self.vol, pos >> self.vol.sb.log2_blksz)?;
        self.nextpackoff = pos + LCLUSTER_INDEX_SIZE;
        self.lcn = lcn;

        let in_block = (pos & (self.vol.block_size() - 1)) as usize;
        let raw: [u8; 8] = self.mpage.data[in_block..in_block + 8].try_into().unwrap();
        let di: LclusterIndex = bytemuck::cast(raw);

        let advise = di.di_advise.get();
        let ltype = ((advise >> LI_LCLUSTER_TYPE_BIT) & LI_LCLUSTER_TYPE_MASK) as u8;
        match ltype {
            LCLUSTER_TYPE_NONHEAD => {
                self.clusterofs = 1 << self.lclusterbits;
                self.delta[0] = di.di_u[0].get();
                if self.delta[0] & LI_D0_CBLKCNT != 0 {
                    if self.advise & Z_ADVISE_BIG_PCLUSTER_1 == 0 {
                        return Err(Error::bad_fs("bogus big pcluster"));
                    }
                    self.compressedblks = (self.delta[0] & !LI_D0_CBLKCNT) as u64;
                    self.delta[0] = 1;
                }
                self.delta[1] = di.di_u[1].get();
            }
            LCLUSTER_TYPE_PLAIN | LCLUSTER_TYPE_HEAD1 | LCLUSTER_TYPE_HEAD2 => {
                if advise & LI_PARTIAL_REF != 0 {
                    self.partialref = true;
                }
                self.clusterofs = di.di_clusterofs.get() as u32;
                self.pblk = (di.di_u[0].get() as u64) | ((di.di_u[1].get() as u64) << 16);
            }
            other => {
                return Err(Error::bad_fs(format!("unsupported cluster type {other}")));
            }
        }
        self.ltype = ltype;
        Ok(())
    }

    fn decode_compactedbits(&self, base: usize, bit_pos: usize) -> (u32, u8) {
        let lomask = (1u32 << self.lclusterbits) - 1;
        let at = base + bit_pos / 8;
        let raw: [u8; 4] = self.mpage.data[at..at + 4].try_into().unwrap();
        let v = u32::from_le_bytes(raw) >> (bit_pos & 7);
        (v & lomask, ((v >> self.lclusterbits) & 3) as u8)
    }

    fn unpack_compacted(&mut self, amortizedshift: u32, pos: u64) -> Result<()> {
        let lclusterbits = self.lclusterbits as u32;
        let vcnt: u64 = if (1 << amortizedshift) == 4 {
            2
        } else if (1 << amortizedshift) == 2 && lclusterbits == 12 {
            16
        } else {
            return Err(Error::bad_fs("bad compact index amortization"));
        };
        let group = vcnt << amortizedshift;
        self.nextpackoff = align_down(pos, group) + group;
        let big = self.advise & Z_ADVISE_BIG_PCLUSTER_1 != 0;
        let encodebits = ((group - 4) * 8 / vcnt) as usize;
        let eofs = (pos & (self.vol.block_size() - 1)) as u64;
        let base = align_down(eofs, group) as usize;
        let mut i = ((eofs as usize - base) >> amortizedshift) as i64;

        let (lo, ltype) = self.decode_compactedbits(base, encodebits * i as usize);
        self.ltype = ltype;
        if ltype == LCLUSTER_TYPE_NONHEAD {
            self.clusterofs = 1 << lclusterbits;
            if lo as u16 & LI_D0_CBLKCNT != 0 {
                if !big {
                    return Err(Error::bad_fs("bogus big pcluster"));
                }
                self.compressedblks = (lo as u16 & !LI_D0_CBLKCNT) as u64;
                self.delta[0] = 1;
                return Ok(());
            } else if (i + 1) as u64 != vcnt {
                self.delta[0] = lo as u16;
                return Ok(());
            }
            // The last entry of a group stores the lookback distance to
            // the group's head implicitly; recover it from its
            // neighbour.
            let (lo2, type2) = self.decode_compactedbits(base, encodebits * (i - 1) as usize);
            let lo2 = if type2 != LCLUSTER_TYPE_NONHEAD {
                0
            } else if lo2 as u16 & LI_D0_CBLKCNT != 0 {
                1
            } else {
                lo2
            };
            self.delta[0] = lo2 as u16 + 1;
            return Ok(());
        }

        self.clusterofs = lo;
        self.delta[0] = 0;
        let mut nblk: u64;
        if !big {
            nblk = 1;
            while i > 0 {
                i -= 1;
                let (lo, t) = self.decode_compactedbits(base, encodebits * i as usize);
                if t == LCLUSTER_TYPE_NONHEAD {
                    i -= lo as i64;
                }
                if i >= 0 {
                    nblk += 1;
                }
            }
        } else {
            nblk = 0;
            while i > 0 {
                i -= 1;
                let (lo, t) = self.decode_compactedbits(base, encodebits * i as usize);
                if t == LCLUSTER_TYPE_NONHEAD {
                    if lo as u16 & LI_D0_CBLKCNT != 0 {
                        i -= 1;
                        nblk += (lo as u16 & !LI_D0_CBLKCNT) as u64;
                        continue;
                    }
                    if lo <= 1 {
                        return Err(Error::bad_fs("bogus lookback in compact index"));
                    }
                    i -= lo as i64 - 2;
                    continue;
                }
                nblk += 1;
            }
        }
        let blk_at = base + (group - 4) as usize;
        let raw: [u8; 4] = self.mpage.data[blk_at..blk_at + 4].try_into().unwrap();
        self.pblk = u32::from_le_bytes(raw) as u64 + nblk;
        Ok(())
    }

    fn load_compact(&mut self, lcn: u64) -> Result<()> {
        let ebase = align_up(self.index_base(), 8) + Z_HEADER_SIZE;
        let totalidx = self.vol.inode_nblocks(self.inode);
        if self.lclusterbits != 12 || lcn >= totalidx {
            return Err(Error::bad_fs("compact index out of bounds"));
        }
        self.lcn = lcn;

        let mut compacted_4b_initial = (32 - ebase % 32) / 4;
        if compacted_4b_initial == 32 / 4 {
            compacted_4b_initial = 0;
        }
        let compacted_2b = if self.advise & Z_ADVISE_COMPACTED_2B != 0
            && compacted_4b_initial < totalidx
        {
            align_down(totalidx - compacted_4b_initial, 16)
        } else {
            0
        };

        let mut pos = ebase;
        let mut lcn = lcn;
        let amortizedshift;
        if lcn < compacted_4b_initial {
            amortizedshift = 2;
        } else {
            pos += compacted_4b_initial * 4;
            lcn -= compacted_4b_initial;
            if lcn < compacted_2b {
                amortizedshift = 1;
            } else {
                pos += compacted_2b * 2;
                lcn -= compacted_2b;
                amortizedshift = 2;
            }
        }
        pos += lcn << amortizedshift;
        self.mpage.load(self.vol, pos >> self.vol.sb.log2_blksz)?;
        self.unpack_compacted(amortizedshift, pos)
    }

    fn load_cluster(&mut self, lcn: u64) -> Result<()> {
        match self.inode.datalayout {
            DATALAYOUT_COMPRESSED_FULL => self.load_full(lcn),
            DATALAYOUT_COMPRESSED_COMPACT => self.load_compact(lcn),
            _ => Err(Error::bad_fs("z map on non-compressed inode")),
        }
    }

    fn extent_lookback(&mut self, map: &mut MapBlocks, distance: u16) -> Result<()> {
        let mut distance = distance as u64;
        loop {
            if self.lcn < distance {
                return Err(Error::bad_fs(format!(
                    "bogus lookback distance @ inode {}",
                    self.inode.nid
                )));
            }
            let lcn = self.lcn - distance;
            self.load_cluster(lcn)?;
            match self.ltype {
                LCLUSTER_TYPE_NONHEAD => {
                    if self.delta[0] == 0 {
                        return Err(Error::bad_fs(format!(
                            "invalid lookback distance 0 @ inode {}",
                            self.inode.nid
                        )));
                    }
                    distance = self.delta[0] as u64;
                }
                LCLUSTER_TYPE_PLAIN | LCLUSTER_TYPE_HEAD1 | LCLUSTER_TYPE_HEAD2 => {
                    self.headtype = self.ltype;
                    map.m_la = (lcn << self.lclusterbits) | self.clusterofs as u64;
                    return Ok(());
                }
                other => {
                    return Err(Error::bad_fs(format!(
                        "unknown lcluster type {other} @ inode {}",
                        self.inode.nid
                    )));
                }
            }
        }
    }

    fn extent_compressed_len(&mut self, map: &mut MapBlocks) -> Result<()> {
        if self.headtype == LCLUSTER_TYPE_PLAIN || self.advise & Z_ADVISE_BIG_PCLUSTER_1 == 0 {
            map.m_plen = 1 << self.lclusterbits;
            return Ok(());
        }
        let lcn = self.lcn + 1;
        if self.compressedblks == 0 {
            self.load_cluster(lcn)?;
            match self.ltype {
                LCLUSTER_TYPE_PLAIN | LCLUSTER_TYPE_HEAD1 | LCLUSTER_TYPE_HEAD2 => {
                    self.compressedblks = 1 << (self.lclusterbits - self.vol.sb.log2_blksz);
                }
                LCLUSTER_TYPE_NONHEAD => {
                    if self.delta[0] != 1 || self.compressedblks == 0 {
                        return Err(Error::bad_fs(format!(
                            "bogus CBLKCNT of lcn {lcn} @ inode {}",
                            self.inode.nid
                        )));
                    }
                }
                _ => {
                    return Err(Error::bad_fs(format!(
                        "cannot find CBLKCNT of lcn {lcn} @ inode {}",
                        self.inode.nid
                    )));
                }
            }
        }
        map.m_plen = self.compressedblks << self.vol.sb.log2_blksz;
        Ok(())
    }
}

/// Flag equivalent: locate the tail extent while reading the Z header.
const GET_BLOCKS_FINDTAIL: bool = true;

pub fn read_z_header(vol: &Volume, inode: &Inode, mpage: &mut MetaPage) -> Result<ZInfo> {
    let pos = align_up(
        vol.iloc(inode.nid) + inode.on_disk_size() + inode.xattr_ibody_size(),
        8,
    );
    let mut raw = [0u8; 8];
    vol.disk.read_at(pos, &mut raw)?;
    let h: ZHeader = bytemuck::cast(raw);

    let mut z = ZInfo::default();

    // Bit 7 of h_clusterbits: the whole file lives in the packed inode;
    // the header itself then holds the 63-bit fragment offset.
    if h.h_clusterbits >> Z_FRAGMENT_INODE_BIT != 0 {
        z.advise = Z_ADVISE_FRAGMENT_PCLUSTER;
        z.fragment_off = u64::from_le_bytes(raw) ^ (1u64 << 63);
        z.tailextent_headlcn = 0;
        return Ok(z);
    }

    z.advise = h.h_advise.get();
    z.algorithm = [h.h_algorithmtype & 0x0f, (h.h_algorithmtype >> 4) & 0x0f];
    if z.algorithm[0] >= COMPRESSION_MAX {
        return Err(Error::unsupported(format!(
            "compression algorithm {}",
            z.algorithm[0]
        )));
    }
    z.log2_lclustersize = vol.sb.log2_blksz + (h.h_clusterbits & 0x7);

    if z.advise & Z_ADVISE_INLINE_PCLUSTER != 0 {
        z.idatasize = (h.h_fragmentoff.get() >> 16) as u16;
        let mut map = MapBlocks::default();
        do_map_blocks(vol, inode, &mut z, mpage, &mut map, 0, GET_BLOCKS_FINDTAIL)?;
    }
    if z.advise & Z_ADVISE_FRAGMENT_PCLUSTER != 0 {
        z.fragment_off = h.h_fragmentoff.get() as u64;
        let mut map = MapBlocks::default();
        do_map_blocks(vol, inode, &mut z, mpage, &mut map, 0, GET_BLOCKS_FINDTAIL)?;
    }
    Ok(z)
}

pub fn do_map_blocks(
    vol: &Volume,
    inode: &Inode,
    z: &mut ZInfo,
    mpage: &mut MetaPage,
    map: &mut MapBlocks,
    la: u64,
    findtail: bool,
) -> Result<()> {
    let ztailpacking = z.advise & Z_ADVISE_INLINE_PCLUSTER != 0;
    let fragment = z.advise & Z_ADVISE_FRAGMENT_PCLUSTER != 0;
    let file_size = inode.file_size;
    let lclusterbits = z.log2_lclustersize;

    let ofs = if findtail { file_size - 1 } else { la };
    let initial_lcn = ofs >> lclusterbits;
    let endoff = ofs & ((1u64 << lclusterbits) - 1);

    let mut m = MapRecorder::new(vol, inode, z, mpage);
    m.load_cluster(initial_lcn)?;

    if ztailpacking && findtail {
        z.idataoff = m.nextpackoff;
    }

    map.m_flags = MAP_MAPPED;
    let mut end = (m.lcn + 1) << lclusterbits;
    match m.ltype {
        LCLUSTER_TYPE_PLAIN | LCLUSTER_TYPE_HEAD1 | LCLUSTER_TYPE_HEAD2 => {
            if endoff >= m.clusterofs as u64 {
                m.headtype = m.ltype;
                map.m_la = (m.lcn << lclusterbits) | m.clusterofs as u64;
                if ztailpacking && end > file_size {
                    end = file_size;
                }
            } else {
                if m.lcn == 0 {
                    return Err(Error::bad_fs(format!(
                        "invalid logical cluster 0 @ inode {}",
                        inode.nid
                    )));
                }
                end = (m.lcn << lclusterbits) | m.clusterofs as u64;
                map.m_flags |= MAP_FULL_MAPPED;
                m.delta[0] = 1;
                m.extent_lookback(map, 1)?;
            }
        }
        LCLUSTER_TYPE_NONHEAD => {
            let delta = m.delta[0];
            m.extent_lookback(map, delta)?;
        }
        other => {
            return Err(Error::bad_fs(format!(
                "unknown lcluster type {other} @ inode {}",
                inode.nid
            )));
        }
    }

    if m.partialref {
        map.m_flags |= MAP_PARTIAL_REF;
    }
    map.m_llen = end - map.m_la;

    if findtail {
        z.tailextent_headlcn = m.lcn;
        if fragment && inode.datalayout == DATALAYOUT_COMPRESSED_FULL {
            z.fragment_off |= m.pblk << 32;
        }
    }

    if ztailpacking && m.lcn == z.tailextent_headlcn {
        map.m_pa = z.idataoff;
        map.m_plen = z.idatasize as u64;
    } else if fragment && m.lcn == z.tailextent_headlcn {
        map.m_flags |= MAP_FRAGMENT;
    } else {
        map.m_pa = m.pblk << vol.sb.log2_blksz;
        m.extent_compressed_len(map)?;
    }

    if m.headtype == LCLUSTER_TYPE_PLAIN {
        if map.m_llen > map.m_plen {
            return Err(Error::bad_fs(format!(
                "invalid extent length @ inode {}",
                inode.nid
            )));
        }
        map.m_algorithm = if z.advise & Z_ADVISE_INTERLACED_PCLUSTER != 0 {
            COMPRESSION_INTERLACED
        } else {
            COMPRESSION_SHIFTED
        };
    } else {
        map.m_algorithm = z.algorithm[if m.headtype == LCLUSTER_TYPE_HEAD2 { 1 } else { 0 }];
    }
    Ok(())
}

pub fn map_blocks_iter(
    vol: &Volume,
    inode: &Inode,
    z: &mut ZInfo,
    mpage: &mut MetaPage,
    map: &mut MapBlocks,
    la: u64,
) -> Result<()> {
    let file_size = inode.file_size;
    if la >= file_size {
        map.m_llen = la + 1 - file_size;
        map.m_la = file_size;
        map.m_flags = 0;
        return Ok(());
    }

    if z.advise & Z_ADVISE_FRAGMENT_PCLUSTER != 0 && z.tailextent_headlcn == 0 {
        map.m_la = 0;
        map.m_llen = file_size;
        map.m_flags = MAP_MAPPED | MAP_FULL_MAPPED | MAP_FRAGMENT;
        return Ok(());
    }

    do_map_blocks(vol, inode, z, mpage, map, la, false)
}
