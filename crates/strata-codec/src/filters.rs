//! Transparent file filters over whole-file compression formats.
//!
//! Filters decode eagerly into memory when wrapped, which keeps the
//! returned handle seekable and makes the decoded bytes independent of
//! the buffer sizes the caller later reads with. A size cap guards
//! against decompression bombs; hitting it reports the file as
//! unsupported rather than truncating it silently.

use std::io::Read;

use strata_core::{Error, FileFilter, FileHandle, MemReader, Result};

use crate::lzfse::lzfse_decompress;

/// 1 GiB decoded ceiling for in-memory filters.
pub const DECODED_SIZE_CAP: u64 = 1 << 30;

struct HandleReadAdapter {
    handle: FileHandle,
}

impl Read for HandleReadAdapter {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.handle.read(buf).map_err(std::io::Error::other)
    }
}

fn decode_with<R: Read>(mut decoder: R, name: &'static str) -> Result<FileHandle> {
    let mut out = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let got = decoder
            .read(&mut chunk)
            .map_err(|e| Error::bad_fs(format!("{name}: {e}")))?;
        if got == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..got]);
        if out.len() as u64 > DECODED_SIZE_CAP {
            return Err(Error::unsupported(format!(
                "{name} stream larger than the decoded-size cap"
            )));
        }
    }
    log::trace!(target: "filter", "{} decoded {} bytes", name, out.len());
    Ok(MemReader::new(out).into_handle())
}

fn extension_is(name: &str, ext: &str) -> bool {
    name.rsplit('.')
        .next()
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

pub struct GzipFilter;

impl FileFilter for GzipFilter {
    fn name(&self) -> &'static str {
        "gzio"
    }

    fn matches(&self, _name: &str, magic: &[u8]) -> bool {
        magic.starts_with(&[0x1f, 0x8b])
    }

    fn wrap(&self, inner: FileHandle) -> Result<FileHandle> {
        decode_with(
            flate2::read::MultiGzDecoder::new(HandleReadAdapter { handle: inner }),
            "gzio",
        )
    }
}

pub struct XzFilter;

impl FileFilter for XzFilter {
    fn name(&self) -> &'static str {
        "xzio"
    }

    fn matches(&self, _name: &str, magic: &[u8]) -> bool {
        magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00])
    }

    fn wrap(&self, inner: FileHandle) -> Result<FileHandle> {
        decode_with(
            xz2::read::XzDecoder::new(HandleReadAdapter { handle: inner }),
            "xzio",
        )
    }
}

/// Raw `.lzma` (lzma_alone) files. The format's magic is weak — a
/// properties byte that is almost always 0x5d — so the extension is
/// required as well.
pub struct LzmaFilter;

impl FileFilter for LzmaFilter {
    fn name(&self) -> &'static str {
        "lzmaio"
    }

    fn matches(&self, name: &str, magic: &[u8]) -> bool {
        extension_is(name, "lzma") && magic.first() == Some(&0x5d)
    }

    fn wrap(&self, inner: FileHandle) -> Result<FileHandle> {
        let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
            .map_err(|e| Error::bad_fs(format!("lzmaio: {e}")))?;
        decode_with(
            xz2::read::XzDecoder::new_stream(HandleReadAdapter { handle: inner }, stream),
            "lzmaio",
        )
    }
}

pub struct ZstdFilter;

impl FileFilter for ZstdFilter {
    fn name(&self) -> &'static str {
        "zstdio"
    }

    fn matches(&self, _name: &str, magic: &[u8]) -> bool {
        magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd])
    }

    fn wrap(&self, inner: FileHandle) -> Result<FileHandle> {
        let decoder = zstd::stream::read::Decoder::new(HandleReadAdapter { handle: inner })
            .map_err(|e| Error::bad_fs(format!("zstdio: {e}")))?;
        decode_with(decoder, "zstdio")
    }
}

pub struct Lz4Filter;

impl FileFilter for Lz4Filter {
    fn name(&self) -> &'static str {
        "lz4io"
    }

    fn matches(&self, _name: &str, magic: &[u8]) -> bool {
        magic.starts_with(&[0x04, 0x22, 0x4d, 0x18])
    }

    fn wrap(&self, inner: FileHandle) -> Result<FileHandle> {
        decode_with(
            lz4_flex::frame::FrameDecoder::new(HandleReadAdapter { handle: inner }),
            "lz4io",
        )
    }
}

pub struct LzfseFilter;

impl FileFilter for LzfseFilter {
    fn name(&self) -> &'static str {
        "lzfseio"
    }

    fn matches(&self, _name: &str, magic: &[u8]) -> bool {
        magic.len() >= 4
            && magic.starts_with(b"bvx")
            && matches!(magic[3], b'-' | b'1' | b'2' | b'n' | b'$')
    }

    fn wrap(&self, mut inner: FileHandle) -> Result<FileHandle> {
        if inner.size() > DECODED_SIZE_CAP {
            return Err(Error::unsupported("lzfse input larger than the cap"));
        }
        inner.seek(0);
        let src = inner.read_to_end()?;
        let out = lzfse_decompress(&src)?;
        Ok(MemReader::new(out).into_handle())
    }
}

/// The default filter chain, in match order.
pub fn default_filters() -> Vec<Box<dyn FileFilter>> {
    vec![
        Box::new(GzipFilter),
        Box::new(XzFilter),
        Box::new(ZstdFilter),
        Box::new(Lz4Filter),
        Box::new(LzfseFilter),
        Box::new(LzmaFilter),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn handle_of(data: Vec<u8>) -> FileHandle {
        MemReader::new(data).into_handle()
    }

    #[test]
    fn gzip_roundtrip() {
        let payload = b"transparent decompression".repeat(100);
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&payload).unwrap();
        let compressed = enc.finish().unwrap();

        assert!(GzipFilter.matches("f.gz", &compressed[..8]));
        let mut wrapped = GzipFilter.wrap(handle_of(compressed)).unwrap();
        assert_eq!(wrapped.size(), payload.len() as u64);
        assert_eq!(wrapped.read_to_end().unwrap(), payload);
    }

    #[test]
    fn xz_roundtrip() {
        let payload = b"xz stream".repeat(50);
        let mut enc = xz2::write::XzEncoder::new(Vec::new(), 3);
        enc.write_all(&payload).unwrap();
        let compressed = enc.finish().unwrap();

        assert!(XzFilter.matches("f.xz", &compressed[..8]));
        let mut wrapped = XzFilter.wrap(handle_of(compressed)).unwrap();
        assert_eq!(wrapped.read_to_end().unwrap(), payload);
    }

    #[test]
    fn zstd_roundtrip() {
        let payload = b"zstd stream".repeat(50);
        let compressed = zstd::stream::encode_all(&payload[..], 3).unwrap();
        assert!(ZstdFilter.matches("f.zst", &compressed[..8]));
        let mut wrapped = ZstdFilter.wrap(handle_of(compressed)).unwrap();
        assert_eq!(wrapped.read_to_end().unwrap(), payload);
    }

    #[test]
    fn lz4_frame_roundtrip() {
        let payload = b"lz4 frame".repeat(50);
        let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
        enc.write_all(&payload).unwrap();
        let compressed = enc.finish().unwrap();
        assert!(Lz4Filter.matches("f.lz4", &compressed[..8]));
        let mut wrapped = Lz4Filter.wrap(handle_of(compressed)).unwrap();
        assert_eq!(wrapped.read_to_end().unwrap(), payload);
    }

    #[test]
    fn decode_is_buffer_size_independent() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(&payload).unwrap();
        let compressed = enc.finish().unwrap();

        let mut a = GzipFilter.wrap(handle_of(compressed.clone())).unwrap();
        let mut b = GzipFilter.wrap(handle_of(compressed)).unwrap();

        let whole = a.read_to_end().unwrap();
        let mut dribbled = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let got = b.read(&mut buf).unwrap();
            if got == 0 {
                break;
            }
            dribbled.extend_from_slice(&buf[..got]);
        }
        assert_eq!(whole, dribbled);
        assert_eq!(whole, payload);
    }

    #[test]
    fn magic_mismatch_not_wrapped() {
        assert!(!GzipFilter.matches("f.gz", b"PK\x03\x04"));
        assert!(!LzfseFilter.matches("f", b"bvxq1234"));
        assert!(LzfseFilter.matches("f", b"bvx20000"));
    }
}
