//! Read-only tar driver (POSIX ustar plus GNU long names).
//!
//! The archive is indexed once per mount by walking the 512-byte header
//! blocks; file contents are then served straight from their regions.

use strata_core::{
    DirEntry, Disk, EntryInfo, Error, FileHandle, FileKind, FileReader, FilesystemDriver, Result,
    WalkConfig,
};

const BLOCK: u64 = 512;
const USTAR_MAGIC: &[u8; 5] = b"ustar";

const TYPE_REGULAR: u8 = b'0';
const TYPE_REGULAR_ALT: u8 = 0;
const TYPE_SYMLINK: u8 = b'2';
const TYPE_DIRECTORY: u8 = b'5';
const TYPE_GNU_LONGNAME: u8 = b'L';
const TYPE_PAX_EXTENDED: u8 = b'x';
const TYPE_PAX_GLOBAL: u8 = b'g';

#[derive(Debug, Clone)]
struct TarEntry {
    name: String,
    kind: FileKind,
    offset: u64,
    size: u64,
    mtime: i64,
    link_target: String,
}

/// Octal, or GNU base-256 when the top bit of the first byte is set.
fn numeric_field(raw: &[u8]) -> Result<u64> {
    if raw.first().is_some_and(|&b| b & 0x80 != 0) {
        let mut value: u64 = (raw[0] & 0x7f) as u64;
        for &b in &raw[1..] {
            value = value
                .checked_mul(256)
                .and_then(|v| v.checked_add(b as u64))
                .ok_or_else(|| Error::bad_fs("tar base-256 field overflow"))?;
        }
        return Ok(value);
    }
    let text = raw
        .iter()
        .take_while(|&&b| b != 0 && b != b' ')
        .copied()
        .collect::<Vec<u8>>();
    let mut value = 0u64;
    for b in text {
        if !(b'0'..=b'7').contains(&b) {
            return Err(Error::bad_fs("non-octal tar numeric field"));
        }
        value = value
            .checked_mul(8)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or_else(|| Error::bad_fs("tar numeric field overflow"))?;
    }
    Ok(value)
}

fn header_checksum_ok(block: &[u8; 512]) -> bool {
    let stored = match numeric_field(&block[148..156]) {
        Ok(v) => v,
        Err(_) => return false,
    };
    let mut sum = 0u64;
    for (i, &b) in block.iter().enumerate() {
        sum += if (148..156).contains(&i) { b' ' as u64 } else { b as u64 };
    }
    sum == stored
}

fn cstr(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Collapses duplicate slashes and `.` components; strips `./` prefixes
/// GNU tar likes to record.
fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub struct TarVolume {
    disk: Disk,
    entries: Vec<TarEntry>,
}

impl TarVolume {
    pub fn mount(disk: &Disk) -> Result<Self> {
        let mut block = [0u8; 512];
        disk.read(0, 0, &mut block)
            .map_err(|_| Error::bad_fs("not a tar archive"))?;
        if &block[257..262] != USTAR_MAGIC {
            return Err(Error::bad_fs("not a tar archive"));
        }

        let mut entries = Vec::new();
        let mut offset = 0u64;
        let mut pending_longname: Option<String> = None;
        let total = disk.total_bytes();

        while offset + BLOCK <= total {
            disk.read_at(offset, &mut block)?;
            if block.iter().all(|&b| b == 0) {
                break;
            }
            if !header_checksum_ok(&block) {
                return Err(Error::bad_fs("tar header checksum mismatch"));
            }
            let size = numeric_field(&block[124..136])?;
            let mtime = numeric_field(&block[136..148])? as i64;
            let typeflag = block[156];
            let data_offset = offset + BLOCK;
            let data_blocks = size.div_ceil(BLOCK);
            offset = data_offset + data_blocks * BLOCK;

            match typeflag {
                TYPE_GNU_LONGNAME => {
                    let mut raw = vec![0u8; size as usize];
                    disk.read_at(data_offset, &mut raw)?;
                    pending_longname = Some(cstr(&raw));
                    continue;
                }
                TYPE_PAX_EXTENDED | TYPE_PAX_GLOBAL => {
                    // Pax keywords are skipped as opaque data.
                    pending_longname = None;
                    continue;
                }
                _ => {}
            }

            let name = pending_longname.take().unwrap_or_else(|| {
                let mut name = cstr(&block[..100]);
                let prefix = cstr(&block[345..500]);
                if !prefix.is_empty() {
                    name = format!("{prefix}/{name}");
                }
                name
            });
            let name = normalize(&name);
            if name.is_empty() {
                continue;
            }
            let kind = match typeflag {
                TYPE_DIRECTORY => FileKind::Directory,
                TYPE_SYMLINK => FileKind::Symlink,
                TYPE_REGULAR | TYPE_REGULAR_ALT => FileKind::Regular,
                other => {
                    log::trace!(target: "tar", "skipping typeflag {:?} for {}", other as char, name);
                    continue;
                }
            };
            entries.push(TarEntry {
                name,
                kind,
                offset: data_offset,
                size,
                mtime,
                link_target: cstr(&block[157..257]),
            });
        }
        Ok(Self {
            disk: disk.clone(),
            entries,
        })
    }

    fn lookup(&self, path: &str, mut link_depth: u32) -> Result<&TarEntry> {
        let mut wanted = normalize(path);
        loop {
            let entry = self
                .entries
                .iter()
                .find(|e| e.name == wanted)
                .ok_or_else(|| Error::NotFound(wanted.clone()))?;
            if entry.kind != FileKind::Symlink {
                return Ok(entry);
            }
            if link_depth == 0 {
                return Err(Error::TooManyLinks);
            }
            link_depth -= 1;
            wanted = if entry.link_target.starts_with('/') {
                normalize(&entry.link_target)
            } else {
                let relative = match wanted.rsplit_once('/') {
                    Some((parent, _)) => format!("{parent}/{}", entry.link_target),
                    None => entry.link_target.clone(),
                };
                normalize(&relative)
            };
        }
    }
}

struct TarFileReader {
    disk: Disk,
    offset: u64,
}

impl FileReader for TarFileReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.disk.read_at(self.offset + offset, buf)?;
        Ok(buf.len())
    }
}

pub struct TarDriver;

impl FilesystemDriver for TarDriver {
    fn name(&self) -> &'static str {
        "tarfs"
    }

    fn probe(&self, disk: &Disk) -> Result<()> {
        TarVolume::mount(disk).map(|_| ())
    }

    fn open(&self, disk: &Disk, path: &str, cfg: &WalkConfig) -> Result<FileHandle> {
        let vol = TarVolume::mount(disk)?;
        let entry = vol.lookup(path, cfg.max_symlink_depth)?;
        if entry.kind != FileKind::Regular {
            return Err(Error::NotAFile(path.to_string()));
        }
        Ok(FileHandle::new(
            entry.size,
            Box::new(TarFileReader {
                disk: disk.clone(),
                offset: entry.offset,
            }),
        )
        .with_hook_slot(disk.hook_slot()))
    }

    fn read_dir(&self, disk: &Disk, path: &str, _cfg: &WalkConfig) -> Result<Vec<DirEntry>> {
        let vol = TarVolume::mount(disk)?;
        let prefix = normalize(path);
        let prefix = prefix.as_str();
        if !prefix.is_empty() {
            match vol.entries.iter().find(|e| e.name == prefix) {
                Some(e) if e.kind == FileKind::Directory => {}
                Some(_) => return Err(Error::NotADirectory(path.to_string())),
                None => {}
            }
        }

        let mut out: Vec<DirEntry> = Vec::new();
        for entry in &vol.entries {
            let remainder = if prefix.is_empty() {
                entry.name.as_str()
            } else {
                match entry.name.strip_prefix(prefix) {
                    Some(rest) if rest.starts_with('/') => &rest[1..],
                    _ => continue,
                }
            };
            if remainder.is_empty() {
                continue;
            }
            let (child, deeper) = match remainder.split_once('/') {
                Some((child, _)) => (child, true),
                None => (remainder, false),
            };
            if out.iter().any(|e| e.name == child) {
                continue;
            }
            out.push(DirEntry {
                name: child.to_string(),
                info: EntryInfo {
                    kind: if deeper { FileKind::Directory } else { entry.kind },
                    mtime: Some(entry.mtime),
                    size: (entry.kind == FileKind::Regular && !deeper).then_some(entry.size),
                    ..Default::default()
                },
            });
        }
        if out.is_empty() && !prefix.is_empty() {
            return Err(Error::NotFound(path.to_string()));
        }
        Ok(out)
    }
}
