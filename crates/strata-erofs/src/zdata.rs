//! Reading compressed inode data.
//!
//! The read loop walks the request back to front: map the extent
//! containing the last byte, decompress the overlap, then step backward
//! to the extent's logical start. Fragment extents recurse into the
//! packed inode.

use strata_core::{Error, Result};
use strata_codec::lz4_decompress_block;

use crate::structures::*;
use crate::volume::{Inode, MapBlocks, Volume};
use crate::zmap::{MetaPage, ZInfo, map_blocks_iter, read_z_header};

/// Lazily initialised compression state of one open inode.
pub struct ZState {
    pub z: ZInfo,
    pub mpage: MetaPage,
}

impl ZState {
    pub fn read(vol: &Volume, inode: &Inode) -> Result<Self> {
        let mut mpage = MetaPage::new(vol.block_size());
        let z = read_z_header(vol, inode, &mut mpage)?;
        Ok(Self { z, mpage })
    }
}

/// Reads `buf.len()` bytes at `offset`, whatever the inode's layout.
pub fn pread(
    vol: &Volume,
    inode: &Inode,
    zstate: &mut Option<ZState>,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    match inode.datalayout {
        DATALAYOUT_FLAT_PLAIN | DATALAYOUT_FLAT_INLINE | DATALAYOUT_CHUNK_BASED => {
            vol.read_raw_data(inode, offset, buf)
        }
        DATALAYOUT_COMPRESSED_FULL | DATALAYOUT_COMPRESSED_COMPACT => {
            if zstate.is_none() {
                *zstate = Some(ZState::read(vol, inode)?);
            }
            let state = zstate.as_mut().unwrap();
            z_read(vol, inode, &mut state.z, &mut state.mpage, offset, buf)
        }
        other => Err(Error::bad_fs(format!(
            "unknown data layout {other} @ inode {}",
            inode.nid
        ))),
    }
}

struct DecompressReq<'a> {
    input: &'a [u8],
    out: &'a mut [u8],
    skip: u64,
    decoded_len: u64,
    interlaced_offset: u64,
    algorithm: u8,
    partial: bool,
}

fn z_read(
    vol: &Volume,
    inode: &Inode,
    z: &mut ZInfo,
    mpage: &mut MetaPage,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let mut end = offset + buf.len() as u64;
    let mut raw: Vec<u8> = Vec::new();

    while end > offset {
        let mut map = MapBlocks::default();
        map_blocks_iter(vol, inode, z, mpage, &mut map, end - 1)?;

        let (length, trimmed) = if end < map.m_la + map.m_llen {
            (end - map.m_la, true)
        } else {
            (map.m_llen, false)
        };
        let (skip, new_end) = if map.m_la < offset {
            (offset - map.m_la, offset)
        } else {
            (0, map.m_la)
        };
        end = new_end;
        let out_start = (end - offset) as usize;
        let out_len = (length - skip) as usize;

        if map.m_flags & MAP_MAPPED == 0 {
            buf[out_start..out_start + out_len].fill(0);
            continue;
        }

        if map.m_flags & MAP_FRAGMENT != 0 {
            // The tail lives in the shared packed inode.
            let packed_nid = vol.sb.packed_nid.get();
            let packed = vol.read_inode(packed_nid)?;
            let mut packed_state = None;
            pread(
                vol,
                &packed,
                &mut packed_state,
                z.fragment_off + skip,
                &mut buf[out_start..out_start + out_len],
            )?;
            continue;
        }

        if raw.len() < map.m_plen as usize {
            raw.resize(map.m_plen as usize, 0);
        }
        vol.disk
            .read_at(map.m_pa, &mut raw[..map.m_plen as usize])?;

        let req = DecompressReq {
            input: &raw[..map.m_plen as usize],
            out: &mut buf[out_start..out_start + out_len],
            skip,
            decoded_len: length,
            interlaced_offset: if map.m_algorithm == COMPRESSION_INTERLACED {
                map.m_la & (vol.block_size() - 1)
            } else {
                0
            },
            algorithm: map.m_algorithm,
            partial: trimmed
                || map.m_flags & MAP_FULL_MAPPED == 0
                || map.m_flags & MAP_PARTIAL_REF != 0,
        };
        decompress(vol, req)?;
    }
    Ok(())
}

fn decompress(vol: &Volume, req: DecompressReq<'_>) -> Result<()> {
    let blocksz = vol.block_size();
    match req.algorithm {
        COMPRESSION_SHIFTED => {
            if req.decoded_len > req.input.len() as u64 {
                return Err(Error::bad_fs("invalid decompress request"));
            }
            req.out
                .copy_from_slice(&req.input[req.skip as usize..req.decoded_len as usize]);
            Ok(())
        }
        COMPRESSION_INTERLACED => {
            // Valid data starts mid-block and wraps around.
            if req.input.len() as u64 > blocksz || req.decoded_len > blocksz {
                return Err(Error::bad_fs("invalid decompress request"));
            }
            let count = (req.decoded_len - req.skip) as usize;
            let start = ((req.interlaced_offset + req.skip) & (blocksz - 1)) as usize;
            let rightpart = ((blocksz as usize) - start).min(count);
            if start + rightpart > req.input.len() || count - rightpart > req.input.len() {
                return Err(Error::bad_fs("invalid decompress request"));
            }
            req.out[..rightpart].copy_from_slice(&req.input[start..start + rightpart]);
            req.out[rightpart..count].copy_from_slice(&req.input[..count - rightpart]);
            Ok(())
        }
        COMPRESSION_LZ4 => decompress_lz4(vol, req),
        other => Err(Error::bad_fs(format!("unknown compression alg {other}"))),
    }
}

fn decompress_lz4(vol: &Volume, req: DecompressReq<'_>) -> Result<()> {
    let zero_padding = vol.has_feature(FEATURE_INCOMPAT_ZERO_PADDING);
    let mut margin = 0usize;
    if zero_padding {
        // Compressed data is right-aligned within its first block.
        let scan_end = req.input.len().min(vol.block_size() as usize);
        while margin < scan_end && req.input[margin] == 0 {
            margin += 1;
        }
        if margin >= req.input.len() {
            return Err(Error::bad_fs(format!("invalid lz4 inputmargin {margin}")));
        }
    }

    // Without zero padding the input may carry slack after the
    // compressed data, so a strict whole-input decode is only possible
    // for full extents of padded filesystems.
    let allow_unconsumed_input = req.partial || !zero_padding;
    let src = &req.input[margin..];
    if req.skip > 0 {
        let mut scratch = vec![0u8; req.decoded_len as usize];
        let got = lz4_decompress_block(src, &mut scratch, allow_unconsumed_input)?;
        if got != scratch.len() {
            return Err(lz4_short(got, req.decoded_len));
        }
        req.out
            .copy_from_slice(&scratch[req.skip as usize..req.decoded_len as usize]);
    } else {
        let got = lz4_decompress_block(src, req.out, allow_unconsumed_input)?;
        if got != req.out.len() {
            return Err(lz4_short(got, req.decoded_len));
        }
    }
    Ok(())
}

fn lz4_short(got: usize, expected: u64) -> Error {
    Error::bad_fs(format!("lz4 decompress failed: got {got}, expected {expected}"))
}
