//! Transparent decompression filters.
//!
//! A filter wraps an opened [`FileHandle`] with one whose reads yield the
//! decoded bytes. Selection is by magic bytes with the file extension as
//! a tie breaker, mirroring how the compressed-stream io layer of the
//! original tool picked its wrapper.

use crate::error::Result;
use crate::file::FileHandle;

/// How many leading bytes the filter chain hands to `matches`.
pub const MAGIC_PROBE_LEN: usize = 8;

pub trait FileFilter {
    fn name(&self) -> &'static str;

    /// `name` is the final path component (lowercased extension lookup is
    /// the implementation's business), `magic` the first bytes of the
    /// file, zero padded if the file is shorter.
    fn matches(&self, name: &str, magic: &[u8]) -> bool;

    /// Consumes `inner` and returns a handle over the decoded stream.
    fn wrap(&self, inner: FileHandle) -> Result<FileHandle>;
}
