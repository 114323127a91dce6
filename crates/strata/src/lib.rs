//! Strata — a read-only, multi-format virtual filesystem.
//!
//! One composite path resolves through the whole stack:
//!
//! ```text
//! (hd0,gpt2)/backups/img.iso        disk image -> GPT slice -> fs -> file
//! (iso)/EFI/BOOT/BOOTX64.EFI        the same file loopback-mounted
//! (hd0)/logs/messages.gz            transparently de-gzipped on open
//! ```
//!
//! ```no_run
//! use strata::default_vfs;
//!
//! let mut vfs = default_vfs(Default::default());
//! vfs.add_image("hd0", "/tmp/disk.img")?;
//! for entry in vfs.read_dir("(hd0,gpt1)/")? {
//!     println!("{}", entry.name);
//! }
//! let mut file = vfs.open("(hd0,gpt1)/EFI/BOOT/BOOTX64.EFI")?;
//! let bytes = file.read_to_end()?;
//! # Ok::<(), strata::Error>(())
//! ```

pub use strata_core::{
    ByteSource, CancelToken, DirEntry, Disk, EntryInfo, Error, FileFilter, FileHandle, FileKind,
    FileReader, FileSource, FilesystemDriver, HandleSource, LoopbackTable, MemReader, MemSource,
    PartitionEntry, PartitionMapDriver, Result, SharedSource, Vfs, VfsOptions, WalkConfig,
};

pub use strata_codec as codec;
pub use strata_erofs::ErofsDriver;
pub use strata_fat::FatDriver;
pub use strata_iso::IsoDriver;
pub use strata_part::{GptPartitionMap, MdRaidFilter, MsdosPartitionMap};
pub use strata_tar::TarDriver;
pub use strata_usn as usn;
pub use strata_wim::WimDriver;
pub use strata_zip::ZipDriver;

/// A [`Vfs`] with every built-in module registered.
///
/// Filesystems are registered strongest-magic first, so formats with
/// weak signatures (FAT) only claim a disk nothing else recognised.
pub fn default_vfs(options: VfsOptions) -> Vfs {
    let mut vfs = Vfs::new(options);

    vfs.register_partition_map(Box::new(MsdosPartitionMap));
    vfs.register_partition_map(Box::new(GptPartitionMap));

    vfs.register_disk_filter(Box::new(MdRaidFilter));

    vfs.register_filesystem(Box::new(ErofsDriver));
    vfs.register_filesystem(Box::new(IsoDriver));
    vfs.register_filesystem(Box::new(WimDriver));
    vfs.register_filesystem(Box::new(ZipDriver));
    vfs.register_filesystem(Box::new(TarDriver));
    vfs.register_filesystem(Box::new(FatDriver));

    for filter in strata_codec::filters::default_filters() {
        vfs.register_filter(filter);
    }
    vfs
}
