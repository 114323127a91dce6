//! Reads over a hand-built FAT16 image.

use strata_core::source::{MemSource, share};
use strata_core::{Disk, FileKind, FilesystemDriver, WalkConfig};
use strata_fat::{FatDriver, FatKind, FatVolume};
use strata_fat::structures::lfn_checksum;

const BPS: usize = 512;
const TOTAL_SECTORS: usize = 16384;
const RESERVED: usize = 1;
const FAT_SECTORS: usize = 64;
const ROOT_ENTRIES: usize = 512;
const ROOT_SECTORS: usize = ROOT_ENTRIES * 32 / BPS; // 32
const DATA_START: usize = RESERVED + FAT_SECTORS + ROOT_SECTORS;

struct Fat16Builder {
    image: Vec<u8>,
}

impl Fat16Builder {
    fn new() -> Self {
        let mut image = vec![0u8; TOTAL_SECTORS * BPS];
        image[0] = 0xEB;
        image[1] = 0x3C;
        image[2] = 0x90;
        image[3..11].copy_from_slice(b"strata  ");
        image[11..13].copy_from_slice(&(BPS as u16).to_le_bytes());
        image[13] = 1; // sectors per cluster
        image[14..16].copy_from_slice(&(RESERVED as u16).to_le_bytes());
        image[16] = 1; // one FAT
        image[17..19].copy_from_slice(&(ROOT_ENTRIES as u16).to_le_bytes());
        image[19..21].copy_from_slice(&(TOTAL_SECTORS as u16).to_le_bytes());
        image[21] = 0xF8;
        image[22..24].copy_from_slice(&(FAT_SECTORS as u16).to_le_bytes());
        image[38] = 0x29; // boot signature
        image[39..43].copy_from_slice(&0x1234_ABCDu32.to_le_bytes());
        image[43..54].copy_from_slice(b"NO NAME    ");
        image[510] = 0x55;
        image[511] = 0xAA;
        // FAT[0], FAT[1] reserved.
        let fat = RESERVED * BPS;
        image[fat..fat + 2].copy_from_slice(&0xFFF8u16.to_le_bytes());
        image[fat + 2..fat + 4].copy_from_slice(&0xFFFFu16.to_le_bytes());
        Self { image }
    }

    fn set_fat(&mut self, cluster: u16, value: u16) {
        let at = RESERVED * BPS + cluster as usize * 2;
        self.image[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn cluster_at(cluster: u16) -> usize {
        (DATA_START + (cluster as usize - 2)) * BPS
    }

    fn put_cluster(&mut self, cluster: u16, data: &[u8]) {
        let at = Self::cluster_at(cluster);
        self.image[at..at + data.len()].copy_from_slice(data);
    }

    fn root_entry(&mut self, slot: usize, entry: &[u8; 32]) {
        let at = (RESERVED + FAT_SECTORS) * BPS + slot * 32;
        self.image[at..at + 32].copy_from_slice(entry);
    }

    fn disk(self) -> Disk {
        Disk::new("fat0", share(MemSource::new(self.image)))
    }
}

fn short_entry(name: &[u8; 11], attrs: u8, cluster: u16, size: u32) -> [u8; 32] {
    let mut raw = [0u8; 32];
    raw[..11].copy_from_slice(name);
    raw[11] = attrs;
    // write date: 2021-06-15, write time: 10:30:00.
    let date: u16 = ((2021 - 1980) << 9) | (6 << 5) | 15;
    let time: u16 = (10 << 11) | (30 << 5);
    raw[22..24].copy_from_slice(&time.to_le_bytes());
    raw[24..26].copy_from_slice(&date.to_le_bytes());
    raw[26..28].copy_from_slice(&cluster.to_le_bytes());
    raw[28..32].copy_from_slice(&size.to_le_bytes());
    raw
}

fn lfn_entries(long_name: &str, short: &[u8; 11]) -> Vec<[u8; 32]> {
    let mut units: Vec<u16> = long_name.encode_utf16().collect();
    units.push(0);
    while units.len() % 13 != 0 {
        units.push(0xFFFF);
    }
    let checksum = lfn_checksum(short);
    let total = units.len() / 13;
    let mut out = Vec::new();
    for part in (1..=total).rev() {
        let mut raw = [0u8; 32];
        raw[0] = part as u8 | if part == total { 0x40 } else { 0 };
        raw[11] = 0x0F;
        raw[13] = checksum;
        let slice = &units[(part - 1) * 13..part * 13];
        for (i, unit) in slice[..5].iter().enumerate() {
            raw[1 + i * 2..3 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        for (i, unit) in slice[5..11].iter().enumerate() {
            raw[14 + i * 2..16 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        for (i, unit) in slice[11..].iter().enumerate() {
            raw[28 + i * 2..30 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        out.push(raw);
    }
    out
}

fn build() -> Disk {
    let mut b = Fat16Builder::new();

    // Volume label entry first.
    b.root_entry(0, &short_entry(b"TESTVOL    ", 0x08, 0, 0));

    // HELLO.TXT in cluster 3.
    b.root_entry(1, &short_entry(b"HELLO   TXT", 0x20, 3, 11));
    b.set_fat(3, 0xFFFF);
    b.put_cluster(3, b"hello world");

    // A long-named file spanning two clusters (4 -> 5).
    let short = *b"LONGFI~1TXT";
    let mut slot = 2;
    for lfn in lfn_entries("Long File Name.txt", &short) {
        b.root_entry(slot, &lfn);
        slot += 1;
    }
    let payload: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
    b.root_entry(slot, &short_entry(&short, 0x20, 4, payload.len() as u32));
    b.set_fat(4, 5);
    b.set_fat(5, 0xFFFF);
    b.put_cluster(4, &payload[..512]);
    b.put_cluster(5, &payload[512..]);

    // SUB directory in cluster 6 holding INNER.TXT in cluster 7.
    b.root_entry(slot + 1, &short_entry(b"SUB        ", 0x10, 6, 0));
    b.set_fat(6, 0xFFFF);
    let mut subdir = Vec::new();
    subdir.extend_from_slice(&short_entry(b".          ", 0x10, 6, 0));
    subdir.extend_from_slice(&short_entry(b"..         ", 0x10, 0, 0));
    subdir.extend_from_slice(&short_entry(b"INNER   TXT", 0x20, 7, 5));
    b.put_cluster(6, &subdir);
    b.set_fat(7, 0xFFFF);
    b.put_cluster(7, b"inner");

    b.disk()
}

fn cfg() -> WalkConfig {
    WalkConfig::default()
}

#[test]
fn mounts_as_fat16() {
    let disk = build();
    let vol = FatVolume::mount(&disk).unwrap();
    assert_eq!(vol.kind(), FatKind::Fat16);
    FatDriver.probe(&disk).unwrap();
}

#[test]
fn probe_rejects_garbage() {
    let disk = Disk::new("junk", share(MemSource::new(vec![0u8; 4096])));
    assert!(FatDriver.probe(&disk).is_err());
}

#[test]
fn label_and_uuid() {
    let disk = build();
    assert_eq!(FatDriver.label(&disk).unwrap(), "TESTVOL");
    assert_eq!(FatDriver.uuid(&disk).unwrap(), "1234-ABCD");
}

#[test]
fn root_listing_hides_label_and_lfn_entries() {
    let disk = build();
    let entries = FatDriver.read_dir(&disk, "/", &cfg()).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["HELLO.TXT", "Long File Name.txt", "SUB"]);
    assert!(entries.iter().all(|e| e.info.case_insensitive));
    assert_eq!(entries[0].info.size, Some(11));
    // 2021-06-15 10:30:00 UTC.
    assert_eq!(entries[0].info.mtime, Some(1_623_753_000));
    assert_eq!(entries[2].info.kind, FileKind::Directory);
}

#[test]
fn reads_files_and_chains() {
    let disk = build();
    let mut handle = FatDriver.open(&disk, "/HELLO.TXT", &cfg()).unwrap();
    assert_eq!(handle.read_to_end().unwrap(), b"hello world");

    // The two-cluster file comes back intact, including across the
    // cluster boundary.
    let mut handle = FatDriver.open(&disk, "/Long File Name.txt", &cfg()).unwrap();
    assert_eq!(handle.size(), 700);
    let all = handle.read_to_end().unwrap();
    let expect: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(all, expect);

    let mut buf = [0u8; 20];
    handle.seek(500);
    handle.read(&mut buf).unwrap();
    assert_eq!(&buf[..], &expect[500..520]);
}

#[test]
fn case_insensitive_walks() {
    let disk = build();
    let mut handle = FatDriver.open(&disk, "/hello.txt", &cfg()).unwrap();
    assert_eq!(handle.read_to_end().unwrap(), b"hello world");
    let mut handle = FatDriver.open(&disk, "/sub/inner.txt", &cfg()).unwrap();
    assert_eq!(handle.read_to_end().unwrap(), b"inner");
    let mut handle = FatDriver
        .open(&disk, "/long file name.TXT", &cfg())
        .unwrap();
    assert_eq!(handle.size(), 700);
}

#[test]
fn dot_entries_walk_upward() {
    let disk = build();
    let mut handle = FatDriver.open(&disk, "/SUB/../HELLO.TXT", &cfg()).unwrap();
    assert_eq!(handle.read_to_end().unwrap(), b"hello world");
}

#[test]
fn missing_files_are_not_found() {
    let disk = build();
    assert!(FatDriver.open(&disk, "/NOPE.TXT", &cfg()).is_err());
    assert!(FatDriver.open(&disk, "/SUB", &cfg()).is_err()); // directory
}
