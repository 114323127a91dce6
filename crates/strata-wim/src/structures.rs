//! On-disk WIM structures. All integers little-endian.

use bytemuck::{Pod, Zeroable};
use strata_core::types::{U16Le, U32Le, U64Le};

pub const WIM_SIGNATURE: [u8; 8] = *b"MSWIM\0\0\0";
pub const WIM_CHUNK_LEN: u64 = 32768;

// Resource flags, packed into the top byte of `zlen__flags`.
pub const RESHDR_ZLEN_MASK: u64 = 0x00ff_ffff_ffff_ffff;
pub const RESHDR_METADATA: u64 = 0x02 << 56;
pub const RESHDR_COMPRESSED: u64 = 0x04 << 56;
pub const RESHDR_PACKED_STREAMS: u64 = 0x10 << 56;

// Header flags.
pub const HDR_COMPRESS_XPRESS: u32 = 0x0002_0000;
pub const HDR_COMPRESS_LZX: u32 = 0x0004_0000;
pub const HDR_COMPRESS_LZMS: u32 = 0x0008_0000;

// Directory-entry attributes.
pub const ATTR_DIRECTORY: u32 = 0x0000_0010;
pub const ATTR_REPARSE_POINT: u32 = 0x0000_0400;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ResourceHeader {
    /// Compressed length in the low 56 bits, flags in the top byte.
    pub zlen_flags: U64Le,
    pub offset: U64Le,
    pub len: U64Le,
}

impl ResourceHeader {
    pub fn zlen(&self) -> u64 {
        self.zlen_flags.get() & RESHDR_ZLEN_MASK
    }

    pub fn flags(&self) -> u64 {
        self.zlen_flags.get()
    }

    pub fn is_compressed(&self) -> bool {
        self.flags() & (RESHDR_COMPRESSED | RESHDR_PACKED_STREAMS) != 0
    }

    pub fn is_metadata(&self) -> bool {
        self.flags() & RESHDR_METADATA != 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct WimHeader {
    pub signature: [u8; 8],
    pub header_len: U32Le,
    pub version: U32Le,
    pub flags: U32Le,
    pub chunk_len: U32Le,
    pub guid: [u8; 16],
    pub part: U16Le,
    pub parts: U16Le,
    pub images: U32Le,
    pub lookup: ResourceHeader,
    pub xml: ResourceHeader,
    pub boot: ResourceHeader,
    pub boot_index: U32Le,
    pub integrity: ResourceHeader,
    pub reserved: [u8; 60],
}

pub const WIM_HEADER_SIZE: usize = core::mem::size_of::<WimHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SecurityHeader {
    pub len: U32Le,
    pub count: U32Le,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DirectoryEntry {
    pub len: U64Le,
    pub attributes: U32Le,
    pub security: U32Le,
    /// Offset of this entry's children within the metadata resource.
    pub subdir: U64Le,
    pub reserved1: [u8; 16],
    pub ctime: U64Le,
    pub atime: U64Le,
    pub mtime: U64Le,
    pub hash: [u8; 20],
    pub reserved2: [u8; 12],
    pub streams: U16Le,
    pub short_name_len: U16Le,
    pub name_len: U16Le,
}

pub const DIRECTORY_ENTRY_SIZE: usize = core::mem::size_of::<DirectoryEntry>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LookupEntry {
    pub resource: ResourceHeader,
    pub part: U16Le,
    pub refcnt: U32Le,
    pub hash: [u8; 20],
}

pub const LOOKUP_ENTRY_SIZE: usize = core::mem::size_of::<LookupEntry>();

#[cfg(test)]
mod tests {
    static_assertions::const_assert_eq!(super::WIM_HEADER_SIZE, 208);
    static_assertions::const_assert_eq!(super::DIRECTORY_ENTRY_SIZE, 102);
    static_assertions::const_assert_eq!(super::LOOKUP_ENTRY_SIZE, 50);
    static_assertions::const_assert_eq!(core::mem::size_of::<super::ResourceHeader>(), 24);
}
