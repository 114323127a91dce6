//! Partition maps and disk filters.
//!
//! The two partition-map drivers here ("msdos" for classic MBR tables,
//! "gpt") turn a disk into `(index, number, start, length)` entries for
//! the resolver; the md-raid disk filter assembles Linux software RAID
//! members into virtual disks.

pub mod gpt;
pub mod mbr;
pub mod md;

pub use gpt::GptPartitionMap;
pub use mbr::MsdosPartitionMap;
pub use md::MdRaidFilter;
