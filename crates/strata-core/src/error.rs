use std::io;

pub type Result<T> = core::result::Result<T, Error>;

/// Error kinds surfaced by the core and the format drivers.
///
/// Format readers never panic on untrusted input; every bounds violation
/// while parsing on-disk metadata maps to [`Error::BadFs`]. The path
/// walker reports a missing component as [`Error::NotFound`] but keeps
/// `BadFs` when corruption is hit mid-walk.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The path string cannot be parsed.
    #[error("malformed path `{0}`")]
    BadFilename(String),

    /// No disk image or loopback device with this name.
    #[error("no such device `{0}`")]
    NoSuchDevice(String),

    /// The selected partition map has no entry with this number.
    #[error("no such partition `{0}`")]
    NoSuchPartition(String),

    /// A format violation while parsing on-disk metadata.
    #[error("bad filesystem: {0}")]
    BadFs(String),

    /// No registered filesystem recognised the disk.
    #[error("no filesystem recognised the disk")]
    UnknownFs,

    /// A path component does not exist.
    #[error("`{0}` not found")]
    NotFound(String),

    /// A file was expected but the path names a directory.
    #[error("`{0}` is a directory")]
    NotAFile(String),

    /// A directory was expected but the path names a file.
    #[error("`{0}` is not a directory")]
    NotADirectory(String),

    /// The underlying byte source rejected a read.
    #[error("read error: {0}")]
    Io(#[from] io::Error),

    /// Arithmetic overflow or an offset beyond the source bounds.
    #[error("offset out of range")]
    OutOfRange,

    /// A recognised feature the reader does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The cooperative cancellation flag was observed.
    #[error("cancelled")]
    Cancelled,

    /// A loopback device is still referenced by an open handle.
    #[error("device `{0}` is in use")]
    InUse(String),

    /// Symlink resolution exceeded the configured depth.
    #[error("too many levels of symbolic links")]
    TooManyLinks,
}

impl Error {
    pub fn bad_fs(msg: impl Into<String>) -> Self {
        Error::BadFs(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }
}
