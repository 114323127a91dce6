//! LZX decompression for WIM chunked resources.
//!
//! This is the WIM flavour: 32 KiB window, each chunk an independent
//! stream of verbatim/aligned/uncompressed blocks, and the decode-side
//! inverse of the x86 E8 call translation applied to every chunk with
//! the fixed WIM translation size.

use strata_core::{Error, Result};

use crate::bits::BitStream16;
use crate::huffman::HuffmanTable;

const NUM_CHARS: usize = 256;
const NUM_OFFSET_SLOTS: usize = 30; // 15-bit window
const NUM_MAIN_SYMBOLS: usize = NUM_CHARS + NUM_OFFSET_SLOTS * 8;
const NUM_LEN_SYMBOLS: usize = 249;
const NUM_PRECODE_SYMBOLS: usize = 20;
const NUM_ALIGNED_SYMBOLS: usize = 8;

const BLOCK_VERBATIM: u32 = 1;
const BLOCK_ALIGNED: u32 = 2;
const BLOCK_UNCOMPRESSED: u32 = 3;

const MIN_MATCH: usize = 2;
const OFFSET_ADJUSTMENT: usize = 2;
const DEFAULT_BLOCK_SIZE: usize = 32768;

/// The fixed "file size" constant of the WIM E8 translation.
const E8_FILE_SIZE: i32 = 12_000_000;

fn extra_offset_bits(slot: usize) -> u32 {
    if slot < 4 { 0 } else { ((slot / 2) - 1).min(17) as u32 }
}

fn offset_slot_base(slot: usize) -> usize {
    let mut base = 0usize;
    for s in 0..slot {
        base += 1 << extra_offset_bits(s);
    }
    base
}

/// Decompresses one chunk into exactly `out_len` bytes.
pub fn lzx_decompress(src: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let mut bs = BitStream16::new(src);
    let mut out = Vec::with_capacity(out_len);

    // Main and length code lengths persist across blocks of one chunk.
    let mut main_lens = [0u8; NUM_MAIN_SYMBOLS];
    let mut len_lens = [0u8; NUM_LEN_SYMBOLS];
    let mut recent = [1usize, 1, 1];

    while out.len() < out_len {
        let block_type = bs.read_bits(3);
        let block_size = if bs.read_bits(1) == 1 {
            DEFAULT_BLOCK_SIZE
        } else {
            bs.read_bits(16) as usize
        };
        if block_size == 0 || out.len() + block_size > out_len {
            return Err(Error::bad_fs("lzx block overruns chunk"));
        }

        match block_type {
            BLOCK_UNCOMPRESSED => {
                bs.align_skip_padding();
                for r in recent.iter_mut() {
                    let mut raw = [0u8; 4];
                    bs.copy_bytes(&mut raw)?;
                    *r = u32::from_le_bytes(raw) as usize;
                    if *r == 0 {
                        return Err(Error::bad_fs("lzx zero recent offset"));
                    }
                }
                let start = out.len();
                out.resize(start + block_size, 0);
                bs.copy_bytes(&mut out[start..])?;
                if block_size % 2 == 1 {
                    let _ = bs.read_byte();
                }
            }
            BLOCK_VERBATIM | BLOCK_ALIGNED => {
                let aligned_table = if block_type == BLOCK_ALIGNED {
                    let mut lens = [0u8; NUM_ALIGNED_SYMBOLS];
                    for len in lens.iter_mut() {
                        *len = bs.read_bits(3) as u8;
                    }
                    Some(HuffmanTable::new(&lens)?)
                } else {
                    None
                };

                read_code_lengths(&mut bs, &mut main_lens[..NUM_CHARS])?;
                {
                    let (_, rest) = main_lens.split_at_mut(NUM_CHARS);
                    read_code_lengths(&mut bs, rest)?;
                }
                read_code_lengths(&mut bs, &mut len_lens)?;
                let main_table = HuffmanTable::new(&main_lens)?;
                let len_table = HuffmanTable::new(&len_lens)?;

                decode_block(
                    &mut bs,
                    &main_table,
                    &len_table,
                    aligned_table.as_ref(),
                    &mut recent,
                    block_size,
                    &mut out,
                )?;
            }
            _ => return Err(Error::bad_fs("unknown lzx block type")),
        }
        if bs.overrun() {
            return Err(Error::bad_fs("lzx stream truncated"));
        }
    }

    undo_e8_translation(&mut out);
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn decode_block(
    bs: &mut BitStream16<'_>,
    main_table: &HuffmanTable,
    len_table: &HuffmanTable,
    aligned_table: Option<&HuffmanTable>,
    recent: &mut [usize; 3],
    block_size: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    let block_end = out.len() + block_size;
    while out.len() < block_end {
        let mainsym = main_table.decode(bs)? as usize;
        if mainsym < NUM_CHARS {
            out.push(mainsym as u8);
            continue;
        }

        let mainsym = mainsym - NUM_CHARS;
        let offset_slot = mainsym >> 3;
        let len_header = mainsym & 7;
        let match_len = if len_header == 7 {
            7 + len_table.decode(bs)? as usize + MIN_MATCH
        } else {
            len_header + MIN_MATCH
        };

        let offset = if offset_slot < recent.len() {
            let offset = recent[offset_slot];
            recent[offset_slot] = recent[0];
            recent[0] = offset;
            offset
        } else {
            let extra = extra_offset_bits(offset_slot);
            let base = offset_slot_base(offset_slot);
            let offset = match aligned_table {
                Some(aligned) if extra >= 3 => {
                    let verbatim = (bs.read_bits(extra - 3) as usize) << 3;
                    base + verbatim + aligned.decode(bs)? as usize
                }
                _ => base + bs.read_bits(extra) as usize,
            } - OFFSET_ADJUSTMENT;
            recent[2] = recent[1];
            recent[1] = recent[0];
            recent[0] = offset;
            offset
        };

        if offset == 0 || offset > out.len() {
            return Err(Error::bad_fs("lzx match before start of chunk"));
        }
        if out.len() + match_len > block_end {
            return Err(Error::bad_fs("lzx match overruns block"));
        }
        let mut from = out.len() - offset;
        for _ in 0..match_len {
            let byte = out[from];
            out.push(byte);
            from += 1;
        }
    }
    Ok(())
}

/// Delta-decodes one run of code lengths against their previous-block
/// values, driven by the 20-symbol precode.
fn read_code_lengths(bs: &mut BitStream16<'_>, lens: &mut [u8]) -> Result<()> {
    let mut pre_lens = [0u8; NUM_PRECODE_SYMBOLS];
    for len in pre_lens.iter_mut() {
        *len = bs.read_bits(4) as u8;
    }
    let precode = HuffmanTable::new(&pre_lens)?;

    let mut i = 0usize;
    while i < lens.len() {
        match precode.decode(bs)? {
            17 => {
                let zeros = 4 + bs.read_bits(4) as usize;
                run(lens, &mut i, zeros, |_| 0)?;
            }
            18 => {
                let zeros = 20 + bs.read_bits(5) as usize;
                run(lens, &mut i, zeros, |_| 0)?;
            }
            19 => {
                let count = 4 + bs.read_bits(1) as usize;
                let sym = precode.decode(bs)?;
                if sym > 16 {
                    return Err(Error::bad_fs("lzx precode run of runs"));
                }
                run(lens, &mut i, count, |prev| (prev + 17 - sym as u8) % 17)?;
            }
            sym => {
                lens[i] = (lens[i] + 17 - sym as u8) % 17;
                i += 1;
            }
        }
    }
    Ok(())
}

fn run(
    lens: &mut [u8],
    i: &mut usize,
    count: usize,
    value: impl Fn(u8) -> u8,
) -> Result<()> {
    if *i + count > lens.len() {
        return Err(Error::bad_fs("lzx code length run overruns table"));
    }
    for _ in 0..count {
        lens[*i] = value(lens[*i]);
        *i += 1;
    }
    Ok(())
}

/// Inverse of the encoder's E8 call-target translation, applied per
/// chunk with positions relative to the chunk start.
fn undo_e8_translation(data: &mut [u8]) {
    if data.len() <= 10 {
        return;
    }
    let mut i = 0usize;
    while i < data.len() - 10 {
        if data[i] != 0xE8 {
            i += 1;
            continue;
        }
        let pos = i as i32;
        let abs = i32::from_le_bytes(data[i + 1..i + 5].try_into().unwrap());
        if abs >= 0 {
            if abs < E8_FILE_SIZE {
                let rel = abs.wrapping_sub(pos);
                data[i + 1..i + 5].copy_from_slice(&rel.to_le_bytes());
            }
        } else if abs >= -pos {
            let rel = abs.wrapping_add(E8_FILE_SIZE);
            data[i + 1..i + 5].copy_from_slice(&rel.to_le_bytes());
        }
        i += 5;
    }
}
