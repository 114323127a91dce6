//! Classic MBR ("msdos") partition tables, including the extended
//! partition chain for logical partitions.

use bytemuck::{Pod, Zeroable};
use strata_core::types::U32Le;
use strata_core::{Disk, Error, PartitionEntry, PartitionMapDriver, Result};

pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

const TYPE_EMPTY: u8 = 0x00;
const TYPE_EXTENDED: u8 = 0x05;
const TYPE_EXTENDED_LBA: u8 = 0x0F;
const TYPE_EXTENDED_LINUX: u8 = 0x85;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MbrSlot {
    pub boot_indicator: u8,
    pub start_chs: [u8; 3],
    pub part_type: u8,
    pub end_chs: [u8; 3],
    pub start_sector: U32Le,
    pub num_sectors: U32Le,
}

impl MbrSlot {
    /// Only the type byte decides emptiness; a lenient check keeps
    /// slightly malformed tables browsable.
    pub fn is_empty(&self) -> bool {
        self.part_type == TYPE_EMPTY
    }

    pub fn is_extended(&self) -> bool {
        matches!(
            self.part_type,
            TYPE_EXTENDED | TYPE_EXTENDED_LBA | TYPE_EXTENDED_LINUX
        )
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MbrSector {
    bootstrap: [u8; 446],
    slots: [MbrSlot; 4],
    signature: [u8; 2],
}

fn read_table(disk: &Disk, sector: u64) -> Result<[MbrSlot; 4]> {
    let mut raw = [0u8; 512];
    disk.read(sector, 0, &mut raw)?;
    let parsed: MbrSector = bytemuck::cast(raw);
    if parsed.signature != BOOT_SIGNATURE {
        return Err(Error::bad_fs("missing 0x55aa boot signature"));
    }
    Ok(parsed.slots)
}

/// The "msdos" partition map. Primary partitions take numbers 1..=4 by
/// slot; logical partitions inside an extended container are numbered
/// from 5 in chain order, the way the fdisk family numbers them.
pub struct MsdosPartitionMap;

impl PartitionMapDriver for MsdosPartitionMap {
    fn name(&self) -> &'static str {
        "msdos"
    }

    fn entries(&self, disk: &Disk) -> Result<Vec<PartitionEntry>> {
        let slots = read_table(disk, 0)?;
        // A protective MBR means the real map is GPT.
        if slots.iter().any(|s| s.part_type == 0xEE) {
            return Err(Error::bad_fs("protective MBR"));
        }
        if slots.iter().all(|s| s.is_empty()) {
            return Err(Error::bad_fs("empty partition table"));
        }

        let mut entries = Vec::new();
        let mut extended_start = None;
        for (slot_index, slot) in slots.iter().enumerate() {
            if slot.is_empty() {
                continue;
            }
            if slot.is_extended() {
                if extended_start.is_none() {
                    extended_start = Some(slot.start_sector.get() as u64);
                }
                continue;
            }
            entries.push(PartitionEntry {
                index: slot_index as u32,
                number: slot_index as u32 + 1,
                start_sector: slot.start_sector.get() as u64,
                num_sectors: slot.num_sectors.get() as u64,
                type_tag: format!("0x{:02x}", slot.part_type),
            });
        }

        if let Some(ext_base) = extended_start {
            walk_extended(disk, ext_base, &mut entries)?;
        }
        Ok(entries)
    }
}

/// Walks the EBR chain. The first slot of each EBR is a logical
/// partition relative to that EBR; the second links to the next EBR
/// relative to the extended container's base.
fn walk_extended(disk: &Disk, ext_base: u64, entries: &mut Vec<PartitionEntry>) -> Result<()> {
    let mut ebr = ext_base;
    let mut number = 5u32;
    // Chain length bounded to keep corrupt links from looping.
    for _ in 0..128 {
        let slots = match read_table(disk, ebr) {
            Ok(slots) => slots,
            Err(err) => {
                log::warn!(target: "part", "broken EBR chain at sector {}: {}", ebr, err);
                return Ok(());
            }
        };
        let logical = &slots[0];
        if !logical.is_empty() && !logical.is_extended() {
            entries.push(PartitionEntry {
                index: number - 1,
                number,
                start_sector: ebr + logical.start_sector.get() as u64,
                num_sectors: logical.num_sectors.get() as u64,
                type_tag: format!("0x{:02x}", logical.part_type),
            });
            number += 1;
        }
        let link = &slots[1];
        if link.is_empty() || !link.is_extended() {
            return Ok(());
        }
        ebr = ext_base + link.start_sector.get() as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::source::{MemSource, share};

    static_assertions::const_assert_eq!(core::mem::size_of::<MbrSector>(), 512);

    fn put_slot(image: &mut [u8], sector: usize, slot: usize, ptype: u8, start: u32, len: u32) {
        let base = sector * 512 + 446 + slot * 16;
        image[base + 4] = ptype;
        image[base + 8..base + 12].copy_from_slice(&start.to_le_bytes());
        image[base + 12..base + 16].copy_from_slice(&len.to_le_bytes());
    }

    fn sign(image: &mut [u8], sector: usize) {
        image[sector * 512 + 510] = 0x55;
        image[sector * 512 + 511] = 0xAA;
    }

    #[test]
    fn primary_and_logical_numbering() {
        let mut image = vec![0u8; 512 * 64];
        // Primary FAT at 8..16, extended container at 16..48.
        put_slot(&mut image, 0, 0, 0x0c, 8, 8);
        put_slot(&mut image, 0, 1, 0x05, 16, 32);
        sign(&mut image, 0);
        // EBR at 16: logical at +2 (abs 18), link to next EBR at +16.
        put_slot(&mut image, 16, 0, 0x83, 2, 8);
        put_slot(&mut image, 16, 1, 0x05, 16, 16);
        sign(&mut image, 16);
        // EBR at 32: last logical at +2 (abs 34).
        put_slot(&mut image, 32, 0, 0x83, 2, 8);
        sign(&mut image, 32);

        let disk = Disk::new("hd0", share(MemSource::new(image)));
        let entries = MsdosPartitionMap.entries(&disk).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!((entries[0].number, entries[0].start_sector), (1, 8));
        assert_eq!((entries[1].number, entries[1].start_sector), (5, 18));
        assert_eq!((entries[2].number, entries[2].start_sector), (6, 34));
    }

    #[test]
    fn protective_mbr_is_rejected() {
        let mut image = vec![0u8; 512];
        put_slot(&mut image, 0, 0, 0xEE, 1, 0xFFFF_FFFF);
        sign(&mut image, 0);
        let disk = Disk::new("hd0", share(MemSource::new(image)));
        assert!(MsdosPartitionMap.entries(&disk).is_err());
    }

    #[test]
    fn unsigned_sector_is_rejected() {
        let disk = Disk::new("hd0", share(MemSource::new(vec![0u8; 512])));
        assert!(MsdosPartitionMap.entries(&disk).is_err());
    }
}
