//! Read-only ZIP driver.
//!
//! The central directory (located through the end-of-central-directory
//! record in the trailing 64 KiB) is the single source of truth; local
//! headers are only consulted for the data offset. Entries decode
//! eagerly on open, so handles over compressed members stay seekable.

use std::io::Read;

use chrono::NaiveDate;

use strata_core::{
    DirEntry, Disk, EntryInfo, Error, FileHandle, FileKind, FilesystemDriver, MemReader, Result,
    WalkConfig,
};

const EOCD_SIG: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
const CENTRAL_SIG: [u8; 4] = [0x50, 0x4b, 0x01, 0x02];
const LOCAL_SIG: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const EOCD_MIN: usize = 22;
const CENTRAL_MIN: usize = 46;
const LOCAL_MIN: usize = 30;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

#[derive(Debug, Clone)]
struct ZipEntry {
    name: String,
    is_dir: bool,
    method: u16,
    compressed_size: u64,
    uncompressed_size: u64,
    local_offset: u64,
    crc32: u32,
    mtime: Option<i64>,
}

pub struct ZipVolume {
    disk: Disk,
    entries: Vec<ZipEntry>,
}

fn normalize(path: &str) -> String {
    path.split('/').filter(|c| !c.is_empty()).collect::<Vec<_>>().join("/")
}

fn dos_time(date: u16, time: u16) -> Option<i64> {
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

impl ZipVolume {
    pub fn mount(disk: &Disk) -> Result<Self> {
        // The cheap magic check first, as the probe path.
        let mut magic = [0u8; 4];
        disk.read_at(0, &mut magic)
            .map_err(|_| Error::bad_fs("not a zip archive"))?;
        if magic != LOCAL_SIG {
            return Err(Error::bad_fs("not a zip archive"));
        }

        let size = disk.total_bytes();
        let window = size.min(65536 + EOCD_MIN as u64);
        let mut tail = vec![0u8; window as usize];
        disk.read_at(size - window, &mut tail)?;

        let eocd_at = (0..=tail.len().saturating_sub(EOCD_MIN))
            .rev()
            .find(|&i| tail[i..i + 4] == EOCD_SIG)
            .ok_or_else(|| Error::bad_fs("zip end-of-central-directory not found"))?;
        let eocd = &tail[eocd_at..];
        let total_entries = u16::from_le_bytes(eocd[10..12].try_into().unwrap());
        let cd_size = u32::from_le_bytes(eocd[12..16].try_into().unwrap());
        let cd_offset = u32::from_le_bytes(eocd[16..20].try_into().unwrap());
        if total_entries == u16::MAX || cd_size == u32::MAX || cd_offset == u32::MAX {
            return Err(Error::unsupported("zip64 archive"));
        }

        let mut cd = vec![0u8; cd_size as usize];
        disk.read_at(cd_offset as u64, &mut cd)?;

        let mut entries = Vec::with_capacity(total_entries as usize);
        let mut at = 0usize;
        for _ in 0..total_entries {
            if at + CENTRAL_MIN > cd.len() || cd[at..at + 4] != CENTRAL_SIG {
                return Err(Error::bad_fs("malformed zip central directory"));
            }
            let u16_at = |off: usize| u16::from_le_bytes(cd[at + off..at + off + 2].try_into().unwrap());
            let u32_at = |off: usize| u32::from_le_bytes(cd[at + off..at + off + 4].try_into().unwrap());
            let method = u16_at(10);
            let time = u16_at(12);
            let date = u16_at(14);
            let crc32 = u32_at(16);
            let compressed_size = u32_at(20) as u64;
            let uncompressed_size = u32_at(24) as u64;
            let name_len = u16_at(28) as usize;
            let extra_len = u16_at(30) as usize;
            let comment_len = u16_at(32) as usize;
            let local_offset = u32_at(42) as u64;
            let name_raw = cd
                .get(at + CENTRAL_MIN..at + CENTRAL_MIN + name_len)
                .ok_or_else(|| Error::bad_fs("zip name overruns central directory"))?;
            let raw_name = String::from_utf8_lossy(name_raw).into_owned();
            let is_dir = raw_name.ends_with('/');
            entries.push(ZipEntry {
                name: normalize(&raw_name),
                is_dir,
                method,
                compressed_size,
                uncompressed_size,
                local_offset,
                crc32,
                mtime: dos_time(date, time),
            });
            at += CENTRAL_MIN + name_len + extra_len + comment_len;
        }
        log::trace!(target: "zip", "{} central directory entries", entries.len());
        Ok(Self {
            disk: disk.clone(),
            entries,
        })
    }

    fn find(&self, path: &str) -> Option<&ZipEntry> {
        let wanted = normalize(path);
        self.entries.iter().find(|e| e.name == wanted)
    }

    /// Decodes a member into memory.
    fn extract(&self, entry: &ZipEntry) -> Result<Vec<u8>> {
        let mut local = [0u8; LOCAL_MIN];
        self.disk.read_at(entry.local_offset, &mut local)?;
        if local[..4] != LOCAL_SIG {
            return Err(Error::bad_fs("zip local header signature mismatch"));
        }
        let name_len = u16::from_le_bytes(local[26..28].try_into().unwrap()) as u64;
        let extra_len = u16::from_le_bytes(local[28..30].try_into().unwrap()) as u64;
        let data_at = entry.local_offset + LOCAL_MIN as u64 + name_len + extra_len;

        let mut compressed = vec![0u8; entry.compressed_size as usize];
        self.disk.read_at(data_at, &mut compressed)?;

        match entry.method {
            METHOD_STORED => Ok(compressed),
            METHOD_DEFLATE => {
                let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
                flate2::read::DeflateDecoder::new(&compressed[..])
                    .read_to_end(&mut out)
                    .map_err(|e| Error::bad_fs(format!("zip deflate: {e}")))?;
                if out.len() as u64 != entry.uncompressed_size {
                    return Err(Error::bad_fs("zip member size mismatch"));
                }
                Ok(out)
            }
            other => Err(Error::unsupported(format!("zip compression method {other}"))),
        }
    }
}

pub struct ZipDriver;

impl FilesystemDriver for ZipDriver {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn probe(&self, disk: &Disk) -> Result<()> {
        ZipVolume::mount(disk).map(|_| ())
    }

    fn open(&self, disk: &Disk, path: &str, _cfg: &WalkConfig) -> Result<FileHandle> {
        let vol = ZipVolume::mount(disk)?;
        let entry = vol
            .find(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if entry.is_dir {
            return Err(Error::NotAFile(path.to_string()));
        }
        let data = vol.extract(entry)?;
        Ok(MemReader::new(data).into_handle())
    }

    fn read_dir(&self, disk: &Disk, path: &str, _cfg: &WalkConfig) -> Result<Vec<DirEntry>> {
        let vol = ZipVolume::mount(disk)?;
        let prefix = normalize(path);
        if !prefix.is_empty() {
            match vol.find(&prefix) {
                Some(entry) if entry.is_dir => {}
                // Archives often omit explicit directory entries; accept
                // any prefix that has children.
                Some(_) => return Err(Error::NotADirectory(path.to_string())),
                None => {}
            }
        }

        let mut out: Vec<DirEntry> = Vec::new();
        for entry in &vol.entries {
            let remainder = if prefix.is_empty() {
                entry.name.as_str()
            } else {
                match entry.name.strip_prefix(&prefix) {
                    Some(rest) => rest.trim_start_matches('/'),
                    None => continue,
                }
            };
            if remainder.is_empty() {
                continue;
            }
            let (child, deeper) = match remainder.split_once('/') {
                Some((child, rest)) => (child, !rest.is_empty()),
                None => (remainder, false),
            };
            // Only direct children; deeper paths surface their ancestor
            // directory once.
            let is_dir = entry.is_dir || deeper;
            if out.iter().any(|e| e.name == child) {
                continue;
            }
            out.push(DirEntry {
                name: child.to_string(),
                info: EntryInfo {
                    kind: if is_dir {
                        FileKind::Directory
                    } else {
                        FileKind::Regular
                    },
                    mtime: entry.mtime,
                    size: (!is_dir).then_some(entry.uncompressed_size),
                    inode: Some(entry.crc32 as u64),
                    ..Default::default()
                },
            });
        }
        if out.is_empty() && !prefix.is_empty() && vol.find(&prefix).is_none() {
            return Err(Error::NotFound(path.to_string()));
        }
        Ok(out)
    }

    fn label(&self, disk: &Disk) -> Result<String> {
        // The name of the first local header, the way the original tool
        // labelled zip "volumes".
        let mut local = [0u8; LOCAL_MIN];
        disk.read_at(0, &mut local)?;
        if local[..4] != LOCAL_SIG {
            return Err(Error::bad_fs("not a zip archive"));
        }
        let name_len = u16::from_le_bytes(local[26..28].try_into().unwrap()) as usize;
        let mut name = vec![0u8; name_len];
        disk.read_at(LOCAL_MIN as u64, &mut name)?;
        Ok(String::from_utf8_lossy(&name).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use strata_core::source::{MemSource, share};

    /// A tiny zip writer for fixtures: stored or deflate members.
    struct ZipBuilder {
        data: Vec<u8>,
        central: Vec<u8>,
        count: u16,
    }

    impl ZipBuilder {
        fn new() -> Self {
            Self {
                data: Vec::new(),
                central: Vec::new(),
                count: 0,
            }
        }

        fn add(&mut self, name: &str, contents: &[u8], deflate: bool) {
            let offset = self.data.len() as u32;
            let (method, payload) = if deflate {
                let mut enc = flate2::write::DeflateEncoder::new(
                    Vec::new(),
                    flate2::Compression::default(),
                );
                enc.write_all(contents).unwrap();
                (METHOD_DEFLATE, enc.finish().unwrap())
            } else {
                (METHOD_STORED, contents.to_vec())
            };
            let crc = {
                let mut h = flate2::Crc::new();
                h.update(contents);
                h.sum()
            };

            self.data.extend_from_slice(&LOCAL_SIG);
            self.data.extend_from_slice(&20u16.to_le_bytes()); // version
            self.data.extend_from_slice(&0u16.to_le_bytes()); // flags
            self.data.extend_from_slice(&method.to_le_bytes());
            self.data.extend_from_slice(&0x5000u16.to_le_bytes()); // time 10:00
            self.data.extend_from_slice(&0x52A4u16.to_le_bytes()); // 2021-05-04
            self.data.extend_from_slice(&crc.to_le_bytes());
            self.data
                .extend_from_slice(&(payload.len() as u32).to_le_bytes());
            self.data
                .extend_from_slice(&(contents.len() as u32).to_le_bytes());
            self.data
                .extend_from_slice(&(name.len() as u16).to_le_bytes());
            self.data.extend_from_slice(&0u16.to_le_bytes()); // extra
            self.data.extend_from_slice(name.as_bytes());
            self.data.extend_from_slice(&payload);

            self.central.extend_from_slice(&CENTRAL_SIG);
            self.central.extend_from_slice(&20u16.to_le_bytes());
            self.central.extend_from_slice(&20u16.to_le_bytes());
            self.central.extend_from_slice(&0u16.to_le_bytes());
            self.central.extend_from_slice(&method.to_le_bytes());
            self.central.extend_from_slice(&0x5000u16.to_le_bytes());
            self.central.extend_from_slice(&0x52A4u16.to_le_bytes());
            self.central.extend_from_slice(&crc.to_le_bytes());
            self.central
                .extend_from_slice(&(payload.len() as u32).to_le_bytes());
            self.central
                .extend_from_slice(&(contents.len() as u32).to_le_bytes());
            self.central
                .extend_from_slice(&(name.len() as u16).to_le_bytes());
            // extra_len, comment_len, disk, internal attrs, external attrs
            self.central.extend_from_slice(&[0u8; 12]);
            self.central.extend_from_slice(&offset.to_le_bytes());
            self.central.extend_from_slice(name.as_bytes());
            self.count += 1;
        }

        fn finish(mut self) -> Vec<u8> {
            let cd_offset = self.data.len() as u32;
            let cd_size = self.central.len() as u32;
            self.data.extend_from_slice(&self.central);
            self.data.extend_from_slice(&EOCD_SIG);
            self.data.extend_from_slice(&[0u8; 4]); // disk numbers
            self.data.extend_from_slice(&self.count.to_le_bytes());
            self.data.extend_from_slice(&self.count.to_le_bytes());
            self.data.extend_from_slice(&cd_size.to_le_bytes());
            self.data.extend_from_slice(&cd_offset.to_le_bytes());
            self.data.extend_from_slice(&0u16.to_le_bytes()); // comment
            self.data
        }
    }

    fn sample() -> Disk {
        let mut b = ZipBuilder::new();
        b.add("hello.txt", b"hello zip", false);
        b.add("dir/", b"", false);
        b.add("dir/nested.bin", &[7u8; 5000], true);
        Disk::new("zip0", share(MemSource::new(b.finish())))
    }

    fn cfg() -> WalkConfig {
        WalkConfig::default()
    }

    #[test]
    fn probes_and_lists_root() {
        let disk = sample();
        ZipDriver.probe(&disk).unwrap();
        let entries = ZipDriver.read_dir(&disk, "/", &cfg()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["hello.txt", "dir"]);
        assert_eq!(entries[0].info.kind, FileKind::Regular);
        assert_eq!(entries[1].info.kind, FileKind::Directory);
    }

    #[test]
    fn stored_and_deflated_members_read() {
        let disk = sample();
        let mut handle = ZipDriver.open(&disk, "/hello.txt", &cfg()).unwrap();
        assert_eq!(handle.read_to_end().unwrap(), b"hello zip");

        let mut handle = ZipDriver.open(&disk, "/dir/nested.bin", &cfg()).unwrap();
        assert_eq!(handle.size(), 5000);
        assert_eq!(handle.read_to_end().unwrap(), vec![7u8; 5000]);
    }

    #[test]
    fn double_slash_resolves() {
        let disk = sample();
        let mut handle = ZipDriver.open(&disk, "/dir//nested.bin", &cfg()).unwrap();
        assert_eq!(handle.size(), 5000);
    }

    #[test]
    fn subdirectory_listing() {
        let disk = sample();
        let entries = ZipDriver.read_dir(&disk, "/dir", &cfg()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["nested.bin"]);
        assert_eq!(entries[0].info.size, Some(5000));
    }

    #[test]
    fn missing_member_errors() {
        let disk = sample();
        assert!(ZipDriver.open(&disk, "/absent", &cfg()).is_err());
        assert!(ZipDriver.read_dir(&disk, "/absent", &cfg()).is_err());
        assert!(ZipDriver.open(&disk, "/dir", &cfg()).is_err());
    }

    #[test]
    fn label_is_first_member_name() {
        let disk = sample();
        assert_eq!(ZipDriver.label(&disk).unwrap(), "hello.txt");
    }
}
