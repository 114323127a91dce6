//! Strata core
//!
//! The plumbing shared by every strata format crate: byte sources and
//! disks, the composite `(device,partmap1)/sub/path` resolver, the
//! loopback table, the driver traits (filesystems, partition maps, disk
//! filters, file filters) and the path walker. Format crates implement
//! the traits; the `strata` umbrella crate assembles them into a [`Vfs`].

pub mod cancel;
pub mod disk;
pub mod error;
pub mod file;
pub mod filter;
pub mod fsdriver;
pub mod loopback;
pub mod resolver;
pub mod source;
pub mod types;
pub mod vfs;
pub mod walker;

pub use cancel::CancelToken;
pub use disk::{Disk, ReadHook, ReadHookSlot};
pub use error::{Error, Result};
pub use file::{DirEntry, EntryInfo, FileHandle, FileReader, MemReader};
pub use filter::FileFilter;
pub use fsdriver::{DiskFilterDriver, FilesystemDriver, PartitionEntry, PartitionMapDriver};
pub use loopback::LoopbackTable;
pub use resolver::{DeviceSpec, PartSelector};
pub use source::{ByteSource, FileSource, HandleSource, MemSource, SharedSource};
pub use vfs::{Vfs, VfsOptions};
pub use walker::{FileKind, NodeOps, WalkConfig, WalkEntry, find_file};
