//! Read-only ISO9660 driver.
//!
//! Volume descriptors are scanned from sector 16; a Joliet
//! supplementary descriptor, when present, supplies the name tree the
//! driver exposes. Version suffixes (`;1`) and trailing dots of
//! primary-level names are stripped.

pub mod structures;

use chrono::NaiveDate;

use strata_core::{
    DirEntry, Disk, EntryInfo, Error, FileHandle, FileKind, FileReader, FilesystemDriver, NodeOps,
    Result, WalkConfig, WalkEntry, find_file,
};

use structures::*;

#[derive(Debug, Clone)]
pub struct IsoNode {
    pub extent: u64,
    pub size: u64,
    pub is_dir: bool,
    pub mtime: Option<i64>,
}

#[derive(Clone)]
pub struct IsoVolume {
    disk: Disk,
    root: IsoNode,
    joliet: bool,
    label: String,
}

impl IsoVolume {
    pub fn mount(disk: &Disk) -> Result<Self> {
        let mut primary: Option<(IsoNode, String)> = None;
        let mut joliet: Option<(IsoNode, String)> = None;

        for sector in 16..16 + 64u64 {
            let mut raw = vec![0u8; SECTOR_SIZE];
            if disk.read_at(sector * SECTOR_SIZE as u64, &mut raw).is_err() {
                break;
            }
            if &raw[1..6] != VOLUME_ID {
                if sector == 16 {
                    return Err(Error::bad_fs("not an iso9660 filesystem"));
                }
                break;
            }
            match raw[0] {
                VD_PRIMARY => {
                    primary = Some(Self::parse_descriptor(&raw, false)?);
                }
                VD_SUPPLEMENTARY => {
                    // Joliet is signalled by a UCS-2 escape sequence.
                    let escape = &raw[88..91];
                    if matches!(escape, b"%/@" | b"%/C" | b"%/E") {
                        joliet = Some(Self::parse_descriptor(&raw, true)?);
                    }
                }
                VD_TERMINATOR => break,
                _ => {}
            }
        }

        let use_joliet = joliet.is_some();
        let (root, label) = joliet
            .or(primary)
            .ok_or_else(|| Error::bad_fs("iso9660 without a primary descriptor"))?;
        log::trace!(target: "iso", "mounted, joliet={}, root extent {}", use_joliet, root.extent);
        Ok(Self {
            disk: disk.clone(),
            root,
            joliet: use_joliet,
            label,
        })
    }

    fn parse_descriptor(raw: &[u8], joliet: bool) -> Result<(IsoNode, String)> {
        let record = parse_record(&raw[ROOT_RECORD_OFFSET..ROOT_RECORD_OFFSET + 34])?
            .ok_or_else(|| Error::bad_fs("empty root directory record"))?;
        let label_raw = &raw[40..72];
        let label = if joliet {
            utf16be_string(label_raw)
        } else {
            String::from_utf8_lossy(label_raw).into_owned()
        };
        Ok((record.node, label.trim_end_matches(['\0', ' ']).to_string()))
    }

    fn iterate_dir(&self, dir: &IsoNode) -> Result<Vec<(String, IsoNode)>> {
        let mut data = vec![0u8; dir.size as usize];
        self.disk.read_at(dir.extent * SECTOR_SIZE as u64, &mut data)?;

        let mut entries = Vec::new();
        for sector in data.chunks(SECTOR_SIZE) {
            let mut pos = 0usize;
            while pos < sector.len() {
                let len = sector[pos] as usize;
                if len == 0 {
                    // Records do not straddle sector boundaries.
                    break;
                }
                if len < 34 || pos + len > sector.len() {
                    return Err(Error::bad_fs("malformed directory record"));
                }
                let Some(record) = parse_record(&sector[pos..pos + len])? else {
                    pos += len;
                    continue;
                };
                let name = decode_name(&record.name, self.joliet);
                entries.push((name, record.node));
                pos += len;
            }
        }
        Ok(entries)
    }
}

struct ParsedRecord {
    node: IsoNode,
    name: Vec<u8>,
}

fn parse_record(raw: &[u8]) -> Result<Option<ParsedRecord>> {
    let len = raw[0] as usize;
    if len == 0 {
        return Ok(None);
    }
    let name_len = raw[32] as usize;
    if 33 + name_len > raw.len() {
        return Err(Error::bad_fs("directory record name overruns record"));
    }
    let flags = raw[25];
    if flags & FLAG_MULTI_EXTENT != 0 {
        return Err(Error::unsupported("multi-extent iso9660 file"));
    }
    let extent = u32::from_le_bytes(raw[2..6].try_into().unwrap()) as u64;
    let size = u32::from_le_bytes(raw[10..14].try_into().unwrap()) as u64;
    let mtime = decode_time(&raw[18..25]);
    Ok(Some(ParsedRecord {
        node: IsoNode {
            extent,
            size,
            is_dir: flags & FLAG_DIRECTORY != 0,
            mtime,
        },
        name: raw[33..33 + name_len].to_vec(),
    }))
}

fn utf16be_string(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn decode_name(raw: &[u8], joliet: bool) -> String {
    match raw {
        [0x00] => return ".".to_string(),
        [0x01] => return "..".to_string(),
        _ => {}
    }
    let mut name = if joliet {
        utf16be_string(raw)
    } else {
        String::from_utf8_lossy(raw).into_owned()
    };
    // Strip the ";1" version and a trailing dot of extension-less names.
    if let Some(at) = name.rfind(';') {
        name.truncate(at);
    }
    if name.ends_with('.') {
        name.pop();
    }
    name
}

fn decode_time(raw: &[u8]) -> Option<i64> {
    let day = NaiveDate::from_ymd_opt(1900 + raw[0] as i32, raw[1] as u32, raw[2] as u32)?;
    let moment = day.and_hms_opt(raw[3] as u32, raw[4] as u32, raw[5] as u32)?;
    // raw[6] is the timezone offset in 15-minute steps from -48 to +52.
    let tz_seconds = (raw[6] as i8) as i64 * 15 * 60;
    Some(moment.and_utc().timestamp() - tz_seconds)
}

struct Ops<'a> {
    vol: &'a IsoVolume,
}

impl NodeOps for Ops<'_> {
    type Node = IsoNode;

    fn read_dir_node(&mut self, dir: &IsoNode) -> Result<Vec<WalkEntry<IsoNode>>> {
        if !dir.is_dir {
            return Err(Error::bad_fs("walking through an iso9660 file"));
        }
        Ok(self
            .vol
            .iterate_dir(dir)?
            .into_iter()
            .map(|(name, node)| WalkEntry {
                kind: if node.is_dir {
                    FileKind::Directory
                } else {
                    FileKind::Regular
                },
                name,
                node,
                case_insensitive: true,
            })
            .collect())
    }
}

struct IsoFileReader {
    vol: IsoVolume,
    extent: u64,
}

impl FileReader for IsoFileReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.vol
            .disk
            .read_at(self.extent * SECTOR_SIZE as u64 + offset, buf)?;
        Ok(buf.len())
    }
}

pub struct IsoDriver;

impl FilesystemDriver for IsoDriver {
    fn name(&self) -> &'static str {
        "iso9660"
    }

    fn probe(&self, disk: &Disk) -> Result<()> {
        IsoVolume::mount(disk).map(|_| ())
    }

    fn open(&self, disk: &Disk, path: &str, cfg: &WalkConfig) -> Result<FileHandle> {
        let vol = IsoVolume::mount(disk)?;
        let root = vol.root.clone();
        let node = find_file(&mut Ops { vol: &vol }, &root, path, FileKind::Regular, cfg)?;
        let (size, extent) = (node.size, node.extent);
        Ok(FileHandle::new(size, Box::new(IsoFileReader { vol, extent }))
            .with_hook_slot(disk.hook_slot()))
    }

    fn read_dir(&self, disk: &Disk, path: &str, cfg: &WalkConfig) -> Result<Vec<DirEntry>> {
        let vol = IsoVolume::mount(disk)?;
        let root = vol.root.clone();
        let dir = find_file(&mut Ops { vol: &vol }, &root, path, FileKind::Directory, cfg)?;
        Ok(vol
            .iterate_dir(&dir)?
            .into_iter()
            .map(|(name, node)| DirEntry {
                info: EntryInfo {
                    kind: if node.is_dir {
                        FileKind::Directory
                    } else {
                        FileKind::Regular
                    },
                    case_insensitive: true,
                    mtime: node.mtime,
                    size: Some(node.size),
                    inode: Some(node.extent),
                },
                name,
            })
            .collect())
    }

    fn label(&self, disk: &Disk) -> Result<String> {
        Ok(IsoVolume::mount(disk)?.label)
    }
}
