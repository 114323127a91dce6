//! On-disk EROFS structures. All fields little-endian.

use bytemuck::{Pod, Zeroable};
use strata_core::types::{U16Le, U32Le, U64Le};

pub const SUPER_OFFSET: u64 = 1024;
pub const SUPER_MAGIC: u32 = 0xE0F5_E1E2;
/// Inodes are addressed in 32-byte slots.
pub const ISLOT_BITS: u64 = 5;
pub const MAX_BLOCK_SIZE: u32 = 4096;
pub const NULL_ADDR: u32 = u32::MAX;

pub const FEATURE_INCOMPAT_ZERO_PADDING: u32 = 0x0000_0001;
pub const FEATURE_INCOMPAT_BIG_PCLUSTER: u32 = 0x0000_0002;
pub const FEATURE_INCOMPAT_CHUNKED_FILE: u32 = 0x0000_0004;
pub const FEATURE_INCOMPAT_ZTAILPACKING: u32 = 0x0000_0010;
pub const FEATURE_INCOMPAT_FRAGMENTS: u32 = 0x0000_0020;
pub const ALL_FEATURE_INCOMPAT: u32 = FEATURE_INCOMPAT_ZERO_PADDING
    | FEATURE_INCOMPAT_BIG_PCLUSTER
    | FEATURE_INCOMPAT_CHUNKED_FILE
    | FEATURE_INCOMPAT_ZTAILPACKING
    | FEATURE_INCOMPAT_FRAGMENTS;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SuperBlock {
    pub magic: U32Le,
    pub checksum: U32Le,
    pub feature_compat: U32Le,
    pub log2_blksz: u8,
    pub sb_extslots: u8,
    pub root_nid: U16Le,
    pub inos: U64Le,
    pub build_time: U64Le,
    pub build_time_nsec: U32Le,
    pub blocks: U32Le,
    pub meta_blkaddr: U32Le,
    pub xattr_blkaddr: U32Le,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub feature_incompat: U32Le,
    pub available_compr_algs: U16Le,
    pub extra_devices: U16Le,
    pub devt_slotoff: U16Le,
    pub log2_dirblksz: u8,
    pub xattr_prefix_count: u8,
    pub xattr_prefix_start: U32Le,
    pub packed_nid: U64Le,
    pub reserved2: [u8; 24],
}

pub const INODE_LAYOUT_COMPACT: u8 = 0;
pub const INODE_LAYOUT_EXTENDED: u8 = 1;

pub const DATALAYOUT_FLAT_PLAIN: u8 = 0;
pub const DATALAYOUT_COMPRESSED_FULL: u8 = 1;
pub const DATALAYOUT_FLAT_INLINE: u8 = 2;
pub const DATALAYOUT_COMPRESSED_COMPACT: u8 = 3;
pub const DATALAYOUT_CHUNK_BASED: u8 = 4;

pub const I_VERSION_BIT: u16 = 0;
pub const I_VERSION_MASK: u16 = 0x01;
pub const I_DATALAYOUT_BIT: u16 = 1;
pub const I_DATALAYOUT_MASK: u16 = 0x07;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InodeCompact {
    pub i_format: U16Le,
    pub i_xattr_icount: U16Le,
    pub i_mode: U16Le,
    pub i_nlink: U16Le,
    pub i_size: U32Le,
    pub i_reserved: U32Le,
    pub i_u: U32Le,
    pub i_ino: U32Le,
    pub i_uid: U16Le,
    pub i_gid: U16Le,
    pub i_reserved2: U32Le,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InodeExtended {
    pub i_format: U16Le,
    pub i_xattr_icount: U16Le,
    pub i_mode: U16Le,
    pub i_reserved: U16Le,
    pub i_size: U64Le,
    pub i_u: U32Le,
    pub i_ino: U32Le,
    pub i_uid: U32Le,
    pub i_gid: U32Le,
    pub i_mtime: U64Le,
    pub i_mtime_nsec: U32Le,
    pub i_nlink: U32Le,
    pub i_reserved2: [u8; 16],
}

pub const XATTR_IBODY_HEADER_SIZE: u32 = 12;

// File-mode type bits.
pub const S_IFMT: u16 = 0xF000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFLNK: u16 = 0xA000;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Dirent {
    pub nid: U64Le,
    pub nameoff: U16Le,
    pub file_type: u8,
    pub reserved: u8,
}

pub const DIRENT_SIZE: usize = core::mem::size_of::<Dirent>();
pub const NAME_MAX: usize = 255;

pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_SYMLINK: u8 = 7;

// Chunk-based layout.
pub const CHUNK_FORMAT_BLKBITS_MASK: u16 = 0x001F;
pub const CHUNK_FORMAT_INDEXES: u16 = 0x0020;
pub const BLOCK_MAP_ENTRY_SIZE: u64 = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ChunkIndex {
    pub advise: U16Le,
    pub device_id: U16Le,
    pub blkaddr: U32Le,
}

// Compression (z) metadata.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ZHeader {
    /// Fragment offset, or `(reserved, idata_size)` for tailpacking.
    pub h_fragmentoff: U32Le,
    pub h_advise: U16Le,
    /// Bits 0-3: algorithm of head 1; bits 4-7: algorithm of head 2.
    pub h_algorithmtype: u8,
    /// Bits 0-2: logical cluster bits - 12; bit 7: whole file lives in
    /// the packed inode.
    pub h_clusterbits: u8,
}

pub const Z_HEADER_SIZE: u64 = core::mem::size_of::<ZHeader>() as u64;
pub const Z_FRAGMENT_INODE_BIT: u8 = 7;

pub const Z_ADVISE_COMPACTED_2B: u16 = 0x0001;
pub const Z_ADVISE_BIG_PCLUSTER_1: u16 = 0x0002;
pub const Z_ADVISE_INLINE_PCLUSTER: u16 = 0x0008;
pub const Z_ADVISE_INTERLACED_PCLUSTER: u16 = 0x0010;
pub const Z_ADVISE_FRAGMENT_PCLUSTER: u16 = 0x0020;

pub const COMPRESSION_LZ4: u8 = 0;
pub const COMPRESSION_MAX: u8 = 1;
/// Runtime-only pseudo algorithms for plain pclusters.
pub const COMPRESSION_SHIFTED: u8 = COMPRESSION_MAX;
pub const COMPRESSION_INTERLACED: u8 = COMPRESSION_MAX + 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LclusterIndex {
    pub di_advise: U16Le,
    pub di_clusterofs: U16Le,
    /// Block address for HEAD lclusters, `delta[2]` for NONHEAD.
    pub di_u: [U16Le; 2],
}

pub const LCLUSTER_INDEX_SIZE: u64 = core::mem::size_of::<LclusterIndex>() as u64;

pub const LCLUSTER_TYPE_PLAIN: u8 = 0;
pub const LCLUSTER_TYPE_HEAD1: u8 = 1;
pub const LCLUSTER_TYPE_NONHEAD: u8 = 2;
pub const LCLUSTER_TYPE_HEAD2: u8 = 3;

pub const LI_LCLUSTER_TYPE_MASK: u16 = 0x03;
pub const LI_LCLUSTER_TYPE_BIT: u16 = 0;
/// (non-compact HEAD) the pcluster holds partially decompressed data.
pub const LI_PARTIAL_REF: u16 = 1 << 15;
/// Marked on the first NONHEAD lcluster to carry the pcluster's
/// compressed block count.
pub const LI_D0_CBLKCNT: u16 = 1 << 11;

pub const MAP_MAPPED: u32 = 1 << 1;
pub const MAP_FULL_MAPPED: u32 = 1 << 3;
pub const MAP_FRAGMENT: u32 = 1 << 4;
pub const MAP_PARTIAL_REF: u32 = 1 << 5;

/// Byte position of the full lcluster index array, given the end of the
/// inode (+xattrs).
pub fn full_index_start(inode_end: u64) -> u64 {
    align_up(inode_end, 8) + Z_HEADER_SIZE + 8
}

pub fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

pub fn align_down(value: u64, align: u64) -> u64 {
    value - value % align
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::const_assert_eq!(core::mem::size_of::<SuperBlock>(), 128);
    static_assertions::const_assert_eq!(core::mem::size_of::<InodeCompact>(), 32);
    static_assertions::const_assert_eq!(core::mem::size_of::<InodeExtended>(), 64);
    static_assertions::const_assert_eq!(core::mem::size_of::<Dirent>(), 12);
    static_assertions::const_assert_eq!(core::mem::size_of::<ZHeader>(), 8);
    static_assertions::const_assert_eq!(core::mem::size_of::<LclusterIndex>(), 8);
    static_assertions::const_assert_eq!(core::mem::size_of::<ChunkIndex>(), 8);

    #[test]
    fn index_alignment() {
        assert_eq!(full_index_start(4512), 4528);
        assert_eq!(full_index_start(4513), 4536);
        assert_eq!(align_down(4100, 8), 4096);
    }
}
