//! Read-only FAT12/16/32 driver with long file names.
//!
//! The variant is decided by cluster count, the way the specification's
//! reference algorithm does it, never by the `fs_type` string.

pub mod structures;

use chrono::NaiveDate;

use strata_core::{
    DirEntry, Disk, EntryInfo, Error, FileHandle, FileKind, FileReader, FilesystemDriver, NodeOps,
    Result, WalkConfig, WalkEntry, find_file,
};

use structures::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatKind {
    Fat12,
    Fat16,
    Fat32,
}

impl FatKind {
    fn end_of_chain(self, entry: u32) -> bool {
        match self {
            FatKind::Fat12 => entry >= 0xFF8,
            FatKind::Fat16 => entry >= 0xFFF8,
            FatKind::Fat32 => entry >= 0x0FFF_FFF8,
        }
    }
}

#[derive(Clone)]
pub struct FatVolume {
    disk: Disk,
    kind: FatKind,
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    fat_start: u64,
    root_dir_start: u64,
    root_dir_sectors: u32,
    data_start: u64,
    cluster_count: u32,
    root_cluster: u32,
    volume_id: u32,
    bpb_label: [u8; 11],
}

impl FatVolume {
    pub fn mount(disk: &Disk) -> Result<Self> {
        let mut sector = [0u8; 512];
        disk.read(0, 0, &mut sector)
            .map_err(|_| Error::bad_fs("not a FAT filesystem"))?;
        if sector[510..512] != [0x55, 0xAA] {
            return Err(Error::bad_fs("missing FAT boot signature"));
        }
        let bpb: BiosParameterBlock =
            bytemuck::cast_slice::<u8, BiosParameterBlock>(&sector[..90])[0];
        if !matches!(bpb.jump[0], 0xEB | 0xE9) {
            return Err(Error::bad_fs("implausible FAT jump instruction"));
        }
        let bytes_per_sector = bpb.bytes_per_sector.get() as u32;
        if !(512..=4096).contains(&bytes_per_sector) || !bytes_per_sector.is_power_of_two() {
            return Err(Error::bad_fs("bad FAT sector size"));
        }
        let sectors_per_cluster = bpb.sectors_per_cluster as u32;
        if sectors_per_cluster == 0
            || sectors_per_cluster > 128
            || !sectors_per_cluster.is_power_of_two()
        {
            return Err(Error::bad_fs("bad FAT cluster size"));
        }
        let reserved = bpb.reserved_sectors.get() as u32;
        let fat_count = bpb.fat_count as u32;
        if reserved == 0 || !(1..=2).contains(&fat_count) {
            return Err(Error::bad_fs("bad FAT reserved/fat counts"));
        }

        let total_sectors = if bpb.total_sectors_16.get() != 0 {
            bpb.total_sectors_16.get() as u32
        } else {
            bpb.total_sectors_32.get()
        };
        let sectors_per_fat = if bpb.sectors_per_fat_16.get() != 0 {
            bpb.sectors_per_fat_16.get() as u32
        } else {
            bpb.sectors_per_fat_32.get()
        };
        if total_sectors == 0 || sectors_per_fat == 0 {
            return Err(Error::bad_fs("zero-sized FAT geometry"));
        }

        let root_entries = bpb.root_entry_count.get() as u32;
        let root_dir_sectors = (root_entries * 32).div_ceil(bytes_per_sector);
        let fat_start = reserved as u64;
        let root_dir_start = fat_start + (fat_count * sectors_per_fat) as u64;
        let data_start = root_dir_start + root_dir_sectors as u64;
        if data_start >= total_sectors as u64 {
            return Err(Error::bad_fs("FAT data area beyond volume"));
        }
        let cluster_count = (total_sectors - data_start as u32) / sectors_per_cluster;

        let kind = if cluster_count < 4085 {
            FatKind::Fat12
        } else if cluster_count < 65525 {
            FatKind::Fat16
        } else {
            FatKind::Fat32
        };
        if kind == FatKind::Fat32 && root_entries != 0 {
            return Err(Error::bad_fs("FAT32 with a fixed root directory"));
        }

        let volume_id = if kind == FatKind::Fat32 {
            bpb.volume_id.get()
        } else {
            // The FAT12/16 extension sits where the FAT32 one begins.
            u32::from_le_bytes(sector[39..43].try_into().unwrap())
        };
        let bpb_label = if kind == FatKind::Fat32 {
            bpb.volume_label
        } else {
            sector[43..54].try_into().unwrap()
        };

        log::trace!(
            target: "fat",
            "mounted {:?}: {} clusters of {} bytes",
            kind,
            cluster_count,
            sectors_per_cluster * bytes_per_sector
        );
        Ok(Self {
            disk: disk.clone(),
            kind,
            bytes_per_sector,
            sectors_per_cluster,
            fat_start,
            root_dir_start,
            root_dir_sectors,
            data_start,
            cluster_count,
            root_cluster: bpb.root_cluster.get(),
            volume_id,
            bpb_label,
        })
    }

    pub fn kind(&self) -> FatKind {
        self.kind
    }

    fn cluster_bytes(&self) -> u32 {
        self.sectors_per_cluster * self.bytes_per_sector
    }

    /// Next cluster in the chain, or `None` at end of chain.
    fn next_cluster(&self, cluster: u32) -> Result<Option<u32>> {
        if cluster < 2 || cluster - 2 >= self.cluster_count {
            return Err(Error::bad_fs(format!("cluster {cluster} out of range")));
        }
        let fat_base = self.fat_start * self.bytes_per_sector as u64;
        let entry = match self.kind {
            FatKind::Fat12 => {
                let off = fat_base + cluster as u64 * 3 / 2;
                let mut raw = [0u8; 2];
                self.disk.read_at(off, &mut raw)?;
                let packed = u16::from_le_bytes(raw);
                if cluster % 2 == 0 {
                    (packed & 0x0FFF) as u32
                } else {
                    (packed >> 4) as u32
                }
            }
            FatKind::Fat16 => {
                let mut raw = [0u8; 2];
                self.disk.read_at(fat_base + cluster as u64 * 2, &mut raw)?;
                u16::from_le_bytes(raw) as u32
            }
            FatKind::Fat32 => {
                let mut raw = [0u8; 4];
                self.disk.read_at(fat_base + cluster as u64 * 4, &mut raw)?;
                u32::from_le_bytes(raw) & 0x0FFF_FFFF
            }
        };
        if self.kind.end_of_chain(entry) {
            Ok(None)
        } else {
            Ok(Some(entry))
        }
    }

    /// Collects a cluster chain, bounded by the cluster count to survive
    /// loops in corrupt tables.
    fn chain(&self, first: u32) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        let mut cluster = first;
        loop {
            clusters.push(cluster);
            if clusters.len() > self.cluster_count as usize {
                return Err(Error::bad_fs("cluster chain loops"));
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(clusters),
            }
        }
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        (self.data_start + (cluster as u64 - 2) * self.sectors_per_cluster as u64)
            * self.bytes_per_sector as u64
    }

    /// Raw bytes of a directory: either the fixed FAT12/16 root region
    /// or a cluster chain.
    fn dir_bytes(&self, node: &FatNode) -> Result<Vec<u8>> {
        if node.is_fixed_root {
            let mut data = vec![0u8; (self.root_dir_sectors * self.bytes_per_sector) as usize];
            self.disk
                .read_at(self.root_dir_start * self.bytes_per_sector as u64, &mut data)?;
            return Ok(data);
        }
        let chain = self.chain(node.first_cluster)?;
        let csize = self.cluster_bytes() as usize;
        let mut data = vec![0u8; chain.len() * csize];
        for (i, &cluster) in chain.iter().enumerate() {
            self.disk
                .read_at(self.cluster_offset(cluster), &mut data[i * csize..(i + 1) * csize])?;
        }
        Ok(data)
    }

    fn root_node(&self) -> FatNode {
        match self.kind {
            FatKind::Fat32 => FatNode {
                first_cluster: self.root_cluster,
                size: 0,
                attributes: FileAttributes::DIRECTORY,
                is_fixed_root: false,
                mtime: None,
            },
            _ => FatNode {
                first_cluster: 0,
                size: 0,
                attributes: FileAttributes::DIRECTORY,
                is_fixed_root: true,
                mtime: None,
            },
        }
    }

    /// Decodes the entries of a directory, assembling long names.
    fn iterate_dir(&self, node: &FatNode) -> Result<Vec<(String, FatNode)>> {
        let data = self.dir_bytes(node)?;
        let mut entries = Vec::new();
        let mut lfn_parts: Vec<(u8, Vec<u16>)> = Vec::new();
        let mut lfn_checksum_seen = None;

        for raw in data.chunks_exact(DIR_ENTRY_SIZE) {
            let first = raw[0];
            if first == ENTRY_END {
                break;
            }
            if first == ENTRY_DELETED {
                lfn_parts.clear();
                continue;
            }
            if raw[11] == ATTR_LONG_NAME {
                let lfn: LfnEntryRaw =
                    bytemuck::cast_slice::<u8, LfnEntryRaw>(raw)[0];
                if lfn.sequence & LFN_SEQ_LAST != 0 {
                    lfn_parts.clear();
                }
                lfn_checksum_seen = Some(lfn.checksum);
                let mut units = Vec::with_capacity(13);
                for pair in lfn
                    .name1
                    .chunks(2)
                    .chain(lfn.name2.chunks(2))
                    .chain(lfn.name3.chunks(2))
                {
                    units.push(u16::from_le_bytes([pair[0], pair[1]]));
                }
                lfn_parts.push((lfn.sequence & 0x1F, units));
                continue;
            }

            let entry: DirEntryRaw = bytemuck::cast_slice::<u8, DirEntryRaw>(raw)[0];
            let attributes = FileAttributes::from_bits_truncate(entry.attributes);
            if attributes.contains(FileAttributes::VOLUME_ID) {
                lfn_parts.clear();
                continue;
            }

            let long_name = assemble_lfn(&mut lfn_parts, lfn_checksum_seen, &entry.name);
            let name = long_name.unwrap_or_else(|| short_name(&entry));
            if name.is_empty() {
                continue;
            }
            let mut node = FatNode {
                first_cluster: entry.first_cluster(),
                size: entry.size.get(),
                attributes,
                is_fixed_root: false,
                mtime: decode_time(entry.write_date.get(), entry.write_time.get()),
            };
            // A directory entry with cluster 0 refers to the root; `..`
            // inside a first-level directory is stored this way.
            if attributes.contains(FileAttributes::DIRECTORY) && node.first_cluster == 0 {
                node = FatNode {
                    mtime: node.mtime,
                    ..self.root_node()
                };
            }
            entries.push((name, node));
        }
        Ok(entries)
    }

    fn volume_label(&self) -> Result<String> {
        let root = self.root_node();
        let data = self.dir_bytes(&root)?;
        for raw in data.chunks_exact(DIR_ENTRY_SIZE) {
            if raw[0] == ENTRY_END {
                break;
            }
            if raw[0] == ENTRY_DELETED || raw[11] == ATTR_LONG_NAME {
                continue;
            }
            let attributes = FileAttributes::from_bits_truncate(raw[11]);
            if attributes.contains(FileAttributes::VOLUME_ID) {
                return Ok(String::from_utf8_lossy(&raw[..11]).trim_end().to_string());
            }
        }
        Ok(String::from_utf8_lossy(&self.bpb_label).trim_end().to_string())
    }
}

fn assemble_lfn(
    parts: &mut Vec<(u8, Vec<u16>)>,
    checksum: Option<u8>,
    short: &[u8; 11],
) -> Option<String> {
    if parts.is_empty() {
        return None;
    }
    let collected = std::mem::take(parts);
    if checksum != Some(lfn_checksum(short)) {
        return None;
    }
    let mut ordered = collected;
    ordered.sort_by_key(|(seq, _)| *seq);
    let mut units = Vec::new();
    for (_, part) in ordered {
        units.extend(part);
    }
    while matches!(units.last(), Some(&0) | Some(&0xFFFF)) {
        units.pop();
    }
    Some(String::from_utf16_lossy(&units))
}

fn short_name(entry: &DirEntryRaw) -> String {
    let mut base = String::from_utf8_lossy(&entry.name[..8]).trim_end().to_string();
    let mut ext = String::from_utf8_lossy(&entry.name[8..]).trim_end().to_string();
    if base.starts_with(ENTRY_E5_ESCAPE as char) {
        base.replace_range(..1, "\u{e5}");
    }
    // NT flags: bit 3 lowers the base name, bit 4 the extension.
    if entry.nt_reserved & 0x08 != 0 {
        base.make_ascii_lowercase();
    }
    if entry.nt_reserved & 0x10 != 0 {
        ext.make_ascii_lowercase();
    }
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

fn decode_time(date: u16, time: u16) -> Option<i64> {
    let day = NaiveDate::from_ymd_opt(
        1980 + (date >> 9) as i32,
        ((date >> 5) & 0x0F) as u32,
        (date & 0x1F) as u32,
    )?;
    let moment = day.and_hms_opt(
        (time >> 11) as u32,
        ((time >> 5) & 0x3F) as u32,
        ((time & 0x1F) * 2) as u32,
    )?;
    Some(moment.and_utc().timestamp())
}

#[derive(Clone)]
pub struct FatNode {
    first_cluster: u32,
    size: u32,
    attributes: FileAttributes,
    is_fixed_root: bool,
    mtime: Option<i64>,
}

impl FatNode {
    fn kind(&self) -> FileKind {
        if self.attributes.contains(FileAttributes::DIRECTORY) {
            FileKind::Directory
        } else {
            FileKind::Regular
        }
    }
}

struct Ops<'a> {
    vol: &'a FatVolume,
}

impl NodeOps for Ops<'_> {
    type Node = FatNode;

    fn read_dir_node(&mut self, dir: &FatNode) -> Result<Vec<WalkEntry<FatNode>>> {
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

struct FatFileReader {
    vol: FatVolume,
    chain: Vec<u32>,
}

impl FileReader for FatFileReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let csize = self.vol.cluster_bytes() as u64;
        let mut offset = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let index = (offset / csize) as usize;
            let within = offset % csize;
            let Some(&cluster) = self.chain.get(index) else {
                return Err(Error::bad_fs("file size beyond its cluster chain"));
            };
            let run = ((csize - within) as usize).min(buf.len() - done);
            self.vol.disk.read_at(
                self.vol.cluster_offset(cluster) + within,
                &mut buf[done..done + run],
            )?;
            done += run;
            offset += run as u64;
        }
        Ok(done)
    }
}

pub struct FatDriver;

impl FilesystemDriver for FatDriver {
    fn name(&self) -> &'static str {
        "fat"
    }

    fn probe(&self, disk: &Disk) -> Result<()> {
        FatVolume::mount(disk).map(|_| ())
    }

    fn open(&self, disk: &Disk, path: &str, cfg: &WalkConfig) -> Result<FileHandle> {
        let vol = FatVolume::mount(disk)?;
        let root = vol.root_node();
        let node = find_file(&mut Ops { vol: &vol }, &root, path, FileKind::Regular, cfg)?;
        let chain = if node.size == 0 {
            Vec::new()
        } else {
            vol.chain(node.first_cluster)?
        };
        Ok(FileHandle::new(
            node.size as u64,
            Box::new(FatFileReader { vol, chain }),
        )
        .with_hook_slot(disk.hook_slot()))
    }

    fn read_dir(&self, disk: &Disk, path: &str, cfg: &WalkConfig) -> Result<Vec<DirEntry>> {
        let vol = FatVolume::mount(disk)?;
        let root = vol.root_node();
        let dir = find_file(&mut Ops { vol: &vol }, &root, path, FileKind::Directory, cfg)?;
        Ok(vol
            .iterate_dir(&dir)?
            .into_iter()
            .map(|(name, node)| DirEntry {
                info: EntryInfo {
                    kind: node.kind(),
                    case_insensitive: true,
                    mtime: node.mtime,
                    size: Some(node.size as u64),
                    inode: Some(node.first_cluster as u64),
                },
                name,
            })
            .collect())
    }

    fn uuid(&self, disk: &Disk) -> Result<String> {
        let vol = FatVolume::mount(disk)?;
        Ok(format!(
            "{:04X}-{:04X}",
            vol.volume_id >> 16,
            vol.volume_id & 0xFFFF
        ))
    }

    fn label(&self, disk: &Disk) -> Result<String> {
        let vol = FatVolume::mount(disk)?;
        vol.volume_label()
    }
}
