//! GUID partition tables.

use bytemuck::{Pod, Zeroable};
use crc::{CRC_32_ISO_HDLC, Crc};
use strata_core::types::{U32Le, U64Le};
use strata_core::{Disk, Error, PartitionEntry, PartitionMapDriver, Result};

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: U32Le,
    pub header_size: U32Le,
    pub header_crc32: U32Le,
    pub reserved: U32Le,
    pub current_lba: U64Le,
    pub backup_lba: U64Le,
    pub first_usable_lba: U64Le,
    pub last_usable_lba: U64Le,
    pub disk_guid: [u8; 16],
    pub entries_lba: U64Le,
    pub num_entries: U32Le,
    pub entry_size: U32Le,
    pub entries_crc32: U32Le,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GptEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: U64Le,
    pub last_lba: U64Le,
    pub attributes: U64Le,
    pub name_utf16: [u8; 72],
}

impl GptEntry {
    pub fn is_empty(&self) -> bool {
        self.type_guid == [0u8; 16]
    }
}

/// Renders a mixed-endian on-disk GUID in canonical text form.
pub fn format_guid(guid: &[u8; 16]) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        u32::from_le_bytes([guid[0], guid[1], guid[2], guid[3]]),
        u16::from_le_bytes([guid[4], guid[5]]),
        u16::from_le_bytes([guid[6], guid[7]]),
        guid[8],
        guid[9],
        guid[10],
        guid[11],
        guid[12],
        guid[13],
        guid[14],
        guid[15],
    )
}

pub struct GptPartitionMap;

impl PartitionMapDriver for GptPartitionMap {
    fn name(&self) -> &'static str {
        "gpt"
    }

    fn entries(&self, disk: &Disk) -> Result<Vec<PartitionEntry>> {
        let mut raw = [0u8; 512];
        disk.read(1, 0, &mut raw)?;
        let header: GptHeader = bytemuck::cast_slice::<u8, GptHeader>(&raw[..92])[0];
        if header.signature != GPT_SIGNATURE {
            return Err(Error::bad_fs("missing GPT signature"));
        }
        let header_size = header.header_size.get();
        if !(92..=512).contains(&header_size) {
            return Err(Error::bad_fs("bad GPT header size"));
        }

        // Header CRC is computed with its own field zeroed.
        let mut crc_input = raw[..header_size as usize].to_vec();
        crc_input[16..20].fill(0);
        if CRC32.checksum(&crc_input) != header.header_crc32.get() {
            return Err(Error::bad_fs("GPT header CRC mismatch"));
        }

        let num_entries = header.num_entries.get();
        let entry_size = header.entry_size.get();
        if entry_size < 128 || !entry_size.is_power_of_two() || num_entries > 1024 {
            return Err(Error::bad_fs("bad GPT entry geometry"));
        }

        let table_len = num_entries as usize * entry_size as usize;
        let mut table = vec![0u8; table_len];
        disk.read(header.entries_lba.get(), 0, &mut table)?;
        if CRC32.checksum(&table) != header.entries_crc32.get() {
            return Err(Error::bad_fs("GPT entry array CRC mismatch"));
        }

        let mut entries = Vec::new();
        for index in 0..num_entries {
            let base = index as usize * entry_size as usize;
            let entry: GptEntry =
                bytemuck::cast_slice::<u8, GptEntry>(&table[base..base + 128])[0];
            if entry.is_empty() {
                continue;
            }
            let first = entry.first_lba.get();
            let last = entry.last_lba.get();
            if last < first {
                return Err(Error::bad_fs("GPT entry with negative extent"));
            }
            entries.push(PartitionEntry {
                index,
                number: index + 1,
                start_sector: first,
                num_sectors: last - first + 1,
                type_tag: format_guid(&entry.type_guid),
            });
        }
        Ok(entries)
    }
}
