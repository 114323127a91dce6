//! Stateless decompressors and the transparent file-filter set.
//!
//! The hand-written decoders (LZFSE/LZVN, LZX, XPRESS, ADC, raw LZ4
//! blocks) exist because the formats strata reads embed them with
//! parameters no ecosystem crate exposes — chunk-reset LZX streams
//! inside WIM resources, partial-output LZ4 blocks inside EROFS
//! pclusters, and so on. Whole-file compression (gzip, xz, zstd, lz4
//! frames) goes through the usual crates via [`filters`].

pub mod adc;
pub mod bits;
pub mod filters;
pub mod huffman;
pub mod lz4;
pub mod lzfse;
pub mod lzvn;
pub mod lzx;
pub mod xpress;

pub use adc::adc_decompress;
pub use lz4::lz4_decompress_block;
pub use lzfse::lzfse_decompress;
pub use lzvn::lzvn_decompress;
pub use lzx::lzx_decompress;
pub use xpress::xpress_decompress;
