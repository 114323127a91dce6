//! Reads over synthetic WIM images.

use strata_core::source::{MemSource, share};
use strata_core::{Disk, FileKind, FilesystemDriver, WalkConfig};
use strata_wim::WimDriver;
use strata_wim::structures::*;

const HELLO: &[u8] = b"hello from a wim";

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn reshdr(buf: &mut [u8], at: usize, offset: u64, len: u64, zlen: u64, flags: u64) {
    put_u64(buf, at, zlen | flags);
    put_u64(buf, at + 8, offset);
    put_u64(buf, at + 16, len);
}

/// A directory entry blob; returns (bytes, aligned length).
fn dirent(name: &str, attributes: u32, subdir: u64, hash: [u8; 20], mtime: u64) -> Vec<u8> {
    let name_utf16: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let len = ((DIRECTORY_ENTRY_SIZE + name_utf16.len()) as u64).next_multiple_of(8);
    let mut raw = vec![0u8; len as usize];
    put_u64(&mut raw, 0, len);
    put_u32(&mut raw, 8, attributes);
    put_u64(&mut raw, 16, subdir);
    put_u64(&mut raw, 56, mtime); // mtime field at 40+16
    raw[64..84].copy_from_slice(&hash);
    put_u16(&mut raw, 100, name_utf16.len() as u16);
    raw[DIRECTORY_ENTRY_SIZE..DIRECTORY_ENTRY_SIZE + name_utf16.len()]
        .copy_from_slice(&name_utf16);
    raw
}

/// One image, one file (`hello.txt`) plus a subdirectory holding
/// `inner.txt` with the same contents.
fn build_wim() -> Vec<u8> {
    let mut image = vec![0u8; 8192];
    let file_hash = [0xAAu8; 20];
    let mtime = (1_600_000_000i64 + 11_644_473_600) as u64 * 10_000_000;

    // Metadata resource at 512.
    let meta_at = 512usize;
    let mut meta = Vec::new();
    // Security header: 8-byte table with zero descriptors.
    let mut sec = [0u8; 8];
    put_u32(&mut sec, 0, 8);
    meta.extend_from_slice(&sec);
    // Root entry at 8; children start after root entry + terminator no,
    // directly after the root entry.
    let root = dirent("", ATTR_DIRECTORY, 0, [0; 20], mtime);
    let children_at = (8 + root.len()) as u64;
    let root = dirent("", ATTR_DIRECTORY, children_at, [0; 20], mtime);
    meta.extend_from_slice(&root);
    let hello = dirent("hello.txt", 0, 0, file_hash, mtime);
    let sub_placeholder = dirent("sub", ATTR_DIRECTORY, 0, [0; 20], mtime);
    let sub_children_at = children_at + (hello.len() + sub_placeholder.len()) as u64 + 8;
    let sub = dirent("sub", ATTR_DIRECTORY, sub_children_at, [0; 20], mtime);
    meta.extend_from_slice(&hello);
    meta.extend_from_slice(&sub);
    meta.extend_from_slice(&[0u8; 8]); // terminator of the root chain
    let inner = dirent("inner.txt", 0, 0, file_hash, mtime);
    meta.extend_from_slice(&inner);
    meta.extend_from_slice(&[0u8; 8]);
    image[meta_at..meta_at + meta.len()].copy_from_slice(&meta);

    // File contents at 2048.
    let content_at = 2048usize;
    image[content_at..content_at + HELLO.len()].copy_from_slice(HELLO);

    // Lookup table at 4096: the metadata entry and the file entry.
    let lookup_at = 4096usize;
    {
        let entry = &mut image[lookup_at..];
        reshdr(entry, 0, meta_at as u64, meta.len() as u64, meta.len() as u64, RESHDR_METADATA);
        put_u16(entry, 24, 1);
        put_u32(entry, 26, 1);
        // metadata entries carry a hash too; leave it zero.
    }
    {
        let entry = &mut image[lookup_at + LOOKUP_ENTRY_SIZE..];
        reshdr(entry, 0, content_at as u64, HELLO.len() as u64, HELLO.len() as u64, 0);
        put_u16(entry, 24, 1);
        put_u32(entry, 26, 1);
        entry[30..50].copy_from_slice(&file_hash);
    }

    // Header.
    image[..8].copy_from_slice(&WIM_SIGNATURE);
    put_u32(&mut image, 8, WIM_HEADER_SIZE as u32);
    put_u32(&mut image, 12, 0x000d_00); // version, value irrelevant here
    put_u32(&mut image, 16, 0); // flags: uncompressed
    put_u32(&mut image, 20, WIM_CHUNK_LEN as u32);
    put_u16(&mut image, 40, 1); // part
    put_u16(&mut image, 42, 1); // parts
    put_u32(&mut image, 44, 1); // images
    // lookup resource header at offset 48.
    let lookup_len = (2 * LOOKUP_ENTRY_SIZE) as u64;
    reshdr(&mut image, 48, lookup_at as u64, lookup_len, lookup_len, 0);
    // boot metadata at offset 96.
    reshdr(&mut image, 96, meta_at as u64, meta.len() as u64, meta.len() as u64, RESHDR_METADATA);
    put_u32(&mut image, 120, 1); // boot_index
    image
}

fn wim_disk() -> Disk {
    Disk::new("wim0", share(MemSource::new(build_wim())))
}

fn cfg() -> WalkConfig {
    WalkConfig::default()
}

#[test]
fn probe_and_uuid() {
    let disk = wim_disk();
    WimDriver.probe(&disk).unwrap();
    assert!(WimDriver.uuid(&disk).is_ok());

    let garbage = Disk::new("x", share(MemSource::new(vec![0u8; 4096])));
    assert!(WimDriver.probe(&garbage).is_err());
}

#[test]
fn root_lists_images() {
    let disk = wim_disk();
    let entries = WimDriver.read_dir(&disk, "/", &cfg()).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    // boot_index is set, so image 0 (the boot alias) is listed too.
    assert_eq!(names, vec!["0", "1"]);
    assert!(entries.iter().all(|e| e.info.kind == FileKind::Directory));
}

#[test]
fn image_listing_and_kinds() {
    let disk = wim_disk();
    let entries = WimDriver.read_dir(&disk, "/1", &cfg()).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["hello.txt", "sub"]);
    assert_eq!(entries[0].info.kind, FileKind::Regular);
    assert_eq!(entries[0].info.size, Some(HELLO.len() as u64));
    assert_eq!(entries[0].info.mtime, Some(1_600_000_000));
    assert!(entries[0].info.case_insensitive);
    assert_eq!(entries[1].info.kind, FileKind::Directory);
}

#[test]
fn file_contents_found_by_hash() {
    let disk = wim_disk();
    let mut handle = WimDriver.open(&disk, "/1/hello.txt", &cfg()).unwrap();
    assert_eq!(handle.size(), HELLO.len() as u64);
    assert_eq!(handle.read_to_end().unwrap(), HELLO);

    // The nested file shares the stream by hash.
    let mut handle = WimDriver.open(&disk, "/1/sub/inner.txt", &cfg()).unwrap();
    assert_eq!(handle.read_to_end().unwrap(), HELLO);
}

#[test]
fn case_insensitive_paths() {
    let disk = wim_disk();
    let mut handle = WimDriver.open(&disk, "/1/HELLO.TXT", &cfg()).unwrap();
    assert_eq!(handle.read_to_end().unwrap(), HELLO);
    // Image 0 aliases the boot image.
    assert!(WimDriver.open(&disk, "/0/hello.txt", &cfg()).is_ok());
}

#[test]
fn missing_paths_error() {
    let disk = wim_disk();
    assert!(WimDriver.open(&disk, "/1/absent.txt", &cfg()).is_err());
    assert!(WimDriver.open(&disk, "/2/hello.txt", &cfg()).is_err());
}

/// A "compressed" resource whose chunks are all stored raw (compressed
/// length == expected length) exercises the chunk table arithmetic and
/// the one-chunk cache without involving a compressor.
#[test]
fn chunked_resource_reads() {
    let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
    let chunks = payload.len().div_ceil(WIM_CHUNK_LEN as usize);
    assert_eq!(chunks, 2);

    let mut image = build_wim();
    let res_at = image.len();
    let mut resource = Vec::new();
    // Chunk table: one 4-byte entry, the offset of chunk 1.
    resource.extend_from_slice(&(WIM_CHUNK_LEN as u32).to_le_bytes());
    resource.extend_from_slice(&payload);
    image.extend_from_slice(&resource);

    // Swap the content lookup entry for the chunked resource and mark
    // the header XPRESS-compressed.
    let lookup_at = 4096 + LOOKUP_ENTRY_SIZE;
    let zlen = resource.len() as u64;
    reshdr(
        &mut image[lookup_at..],
        0,
        res_at as u64,
        payload.len() as u64,
        zlen,
        RESHDR_COMPRESSED,
    );
    put_u32(&mut image, 16, HDR_COMPRESS_XPRESS);

    let disk = Disk::new("wim0", share(MemSource::new(image)));
    let mut handle = WimDriver.open(&disk, "/1/hello.txt", &cfg()).unwrap();
    assert_eq!(handle.size(), payload.len() as u64);
    assert_eq!(handle.read_to_end().unwrap(), payload);

    // A read crossing the chunk boundary.
    let mut cross = vec![0u8; 64];
    handle.read_at(WIM_CHUNK_LEN - 32, &mut cross).unwrap();
    assert_eq!(
        cross,
        payload[WIM_CHUNK_LEN as usize - 32..WIM_CHUNK_LEN as usize + 32]
    );
}
