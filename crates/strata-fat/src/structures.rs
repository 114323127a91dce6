//! FAT on-disk structures.

use bytemuck::{Pod, Zeroable};
use strata_core::types::{U16Le, U32Le};

pub const DIR_ENTRY_SIZE: usize = 32;
pub const ENTRY_END: u8 = 0x00;
pub const ENTRY_DELETED: u8 = 0xE5;
/// A real leading 0xE5 is stored as 0x05.
pub const ENTRY_E5_ESCAPE: u8 = 0x05;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

pub const ATTR_LONG_NAME: u8 = 0x0F;
pub const LFN_SEQ_LAST: u8 = 0x40;

/// The common BPB plus both the FAT12/16 and FAT32 extensions; which
/// extension applies follows from the cluster count.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BiosParameterBlock {
    pub jump: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: U16Le,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: U16Le,
    pub fat_count: u8,
    pub root_entry_count: U16Le,
    pub total_sectors_16: U16Le,
    pub media: u8,
    pub sectors_per_fat_16: U16Le,
    pub sectors_per_track: U16Le,
    pub head_count: U16Le,
    pub hidden_sectors: U32Le,
    pub total_sectors_32: U32Le,
    // FAT32 extension (overlays the FAT12/16 one).
    pub sectors_per_fat_32: U32Le,
    pub ext_flags: U16Le,
    pub fs_version: U16Le,
    pub root_cluster: U32Le,
    pub fs_info_sector: U16Le,
    pub backup_boot_sector: U16Le,
    pub reserved: [u8; 12],
    pub drive_number: u8,
    pub reserved1: u8,
    pub boot_signature: u8,
    pub volume_id: U32Le,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DirEntryRaw {
    pub name: [u8; 11],
    pub attributes: u8,
    pub nt_reserved: u8,
    pub creation_time_tenths: u8,
    pub creation_time: U16Le,
    pub creation_date: U16Le,
    pub access_date: U16Le,
    pub first_cluster_hi: U16Le,
    pub write_time: U16Le,
    pub write_date: U16Le,
    pub first_cluster_lo: U16Le,
    pub size: U32Le,
}

impl DirEntryRaw {
    pub fn first_cluster(&self) -> u32 {
        ((self.first_cluster_hi.get() as u32) << 16) | self.first_cluster_lo.get() as u32
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LfnEntryRaw {
    pub sequence: u8,
    pub name1: [u8; 10],
    pub attributes: u8,
    pub entry_type: u8,
    pub checksum: u8,
    pub name2: [u8; 12],
    pub first_cluster: U16Le,
    pub name3: [u8; 4],
}

/// The 8.3 short-name checksum stored in every LFN entry.
pub fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    short_name
        .iter()
        .fold(0u8, |sum, &b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b))
}
