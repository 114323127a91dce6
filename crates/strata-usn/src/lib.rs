//! USN change-journal records and FILETIME conversion.

pub mod filetime;
pub mod record;

pub use filetime::{DateTime, filetime_to_datetime, filetime_to_unix};
pub use record::{FileReference, RecordIter, SourceFlags, UsnReasonFlags, UsnRecord};
