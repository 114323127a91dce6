//! Raw LZ4 block decompression with partial-output support.
//!
//! EROFS pclusters need two things the frame-level crates do not offer:
//! decoding may legitimately stop once the caller's window is full (a
//! pcluster can back a partial extent whose full decoded length is not
//! recorded), and the compressed block may carry a zero-padding prefix
//! when the filesystem's 0padding feature bit is set.

use strata_core::{Error, Result};

/// Decompresses an LZ4 block into `out`. Returns the number of bytes
/// produced.
///
/// With `partial` set, filling `out` completely is success even if input
/// remains; otherwise the input must end exactly as `out` fills.
pub fn lz4_decompress_block(src: &[u8], out: &mut [u8], partial: bool) -> Result<usize> {
    let mut sp = 0usize;
    let mut op = 0usize;

    loop {
        let token = *src.get(sp).ok_or_else(corrupt)?;
        sp += 1;

        // Literal run.
        let mut lit_len = (token >> 4) as usize;
        if lit_len == 15 {
            lit_len += read_len_continuation(src, &mut sp)?;
        }
        let lit_end = sp.checked_add(lit_len).ok_or_else(corrupt)?;
        if lit_end > src.len() {
            return Err(corrupt());
        }
        let copy = lit_len.min(out.len() - op);
        out[op..op + copy].copy_from_slice(&src[sp..sp + copy]);
        op += copy;
        if copy < lit_len {
            return if partial { Ok(op) } else { Err(corrupt()) };
        }
        sp = lit_end;

        // The last sequence is literals only.
        if sp == src.len() {
            return if op == out.len() || partial {
                Ok(op)
            } else {
                Err(corrupt())
            };
        }

        let offset = u16::from_le_bytes(
            src.get(sp..sp + 2)
                .ok_or_else(corrupt)?
                .try_into()
                .unwrap(),
        ) as usize;
        sp += 2;
        if offset == 0 || offset > op {
            return Err(corrupt());
        }

        let mut match_len = (token & 0x0f) as usize;
        if match_len == 15 {
            match_len += read_len_continuation(src, &mut sp)?;
        }
        match_len += 4;

        let copy = match_len.min(out.len() - op);
        let mut from = op - offset;
        for _ in 0..copy {
            out[op] = out[from];
            op += 1;
            from += 1;
        }
        if copy < match_len {
            return if partial { Ok(op) } else { Err(corrupt()) };
        }
        if op == out.len() {
            // A well-formed full block ends on a literal-only sequence,
            // but a partial decode may stop here.
            if partial || sp == src.len() {
                return Ok(op);
            }
            return Err(corrupt());
        }
    }
}

fn read_len_continuation(src: &[u8], sp: &mut usize) -> Result<usize> {
    let mut extra = 0usize;
    loop {
        let byte = *src.get(*sp).ok_or_else(corrupt)?;
        *sp += 1;
        extra = extra.checked_add(byte as usize).ok_or_else(corrupt)?;
        if byte != 255 {
            return Ok(extra);
        }
    }
}

fn corrupt() -> Error {
    Error::bad_fs("corrupt lz4 block")
}
