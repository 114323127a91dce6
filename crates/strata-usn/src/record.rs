//! USN change-journal record parsing (version 2 records).

use strata_core::{Error, Result};

pub const RECORD_HEADER_SIZE: usize = 60;

bitflags::bitflags! {
    /// Reason flags of a journal record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsnReasonFlags: u32 {
        const DATA_OVERWRITE = 0x0000_0001;
        const DATA_EXTEND = 0x0000_0002;
        const DATA_TRUNCATION = 0x0000_0004;
        const NAMED_DATA_OVERWRITE = 0x0000_0010;
        const NAMED_DATA_EXTEND = 0x0000_0020;
        const NAMED_DATA_TRUNCATION = 0x0000_0040;
        const FILE_CREATE = 0x0000_0100;
        const FILE_DELETE = 0x0000_0200;
        const EA_CHANGE = 0x0000_0400;
        const SECURITY_CHANGE = 0x0000_0800;
        const RENAME_OLD_NAME = 0x0000_1000;
        const RENAME_NEW_NAME = 0x0000_2000;
        const INDEXABLE_CHANGE = 0x0000_4000;
        const BASIC_INFO_CHANGE = 0x0000_8000;
        const HARD_LINK_CHANGE = 0x0001_0000;
        const COMPRESSION_CHANGE = 0x0002_0000;
        const ENCRYPTION_CHANGE = 0x0004_0000;
        const OBJECT_ID_CHANGE = 0x0008_0000;
        const REPARSE_POINT_CHANGE = 0x0010_0000;
        const STREAM_CHANGE = 0x0020_0000;
        const TRANSACTED_CHANGE = 0x0040_0000;
        const CLOSE = 0x8000_0000;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceFlags: u32 {
        const DATA_MANAGEMENT = 0x0000_0001;
        const AUXILIARY_DATA = 0x0000_0002;
        const REPLICATION_MANAGEMENT = 0x0000_0004;
    }
}

/// An NTFS file reference: 48-bit MFT entry plus 16-bit sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileReference(pub u64);

impl FileReference {
    pub fn mft_entry(self) -> u64 {
        self.0 & 0x0000_ffff_ffff_ffff
    }

    pub fn sequence(self) -> u16 {
        (self.0 >> 48) as u16
    }
}

#[derive(Debug, Clone)]
pub struct UsnRecord {
    pub size: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_reference: FileReference,
    pub parent_file_reference: FileReference,
    pub update_sequence_number: u64,
    /// FILETIME of the update.
    pub update_time: u64,
    pub reason_flags: UsnReasonFlags,
    pub source_flags: SourceFlags,
    pub security_identifier_index: u32,
    pub file_attribute_flags: u32,
    /// Raw UTF-16LE name bytes.
    pub name: Vec<u8>,
}

impl UsnRecord {
    /// Parses one record at the start of `stream`.
    pub fn parse(stream: &[u8]) -> Result<Self> {
        if stream.len() < RECORD_HEADER_SIZE {
            return Err(Error::bad_fs("usn record stream too small"));
        }
        let u16_at = |off: usize| u16::from_le_bytes(stream[off..off + 2].try_into().unwrap());
        let u32_at = |off: usize| u32::from_le_bytes(stream[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_le_bytes(stream[off..off + 8].try_into().unwrap());

        let size = u32_at(0);
        let major_version = u16_at(4);
        let minor_version = u16_at(6);
        let file_reference = FileReference(u64_at(8));
        let parent_file_reference = FileReference(u64_at(16));
        let update_sequence_number = u64_at(24);
        let update_time = u64_at(32);
        let reason_flags = UsnReasonFlags::from_bits_retain(u32_at(40));
        let source_flags = SourceFlags::from_bits_retain(u32_at(44));
        let security_identifier_index = u32_at(48);
        let file_attribute_flags = u32_at(52);
        let name_size = u16_at(56) as usize;
        let name_offset = u16_at(58) as usize;

        if major_version != 2 {
            return Err(Error::unsupported(format!(
                "usn record major version {major_version}"
            )));
        }
        if (size as usize) < RECORD_HEADER_SIZE || size as usize > stream.len() {
            return Err(Error::bad_fs("usn record size out of bounds"));
        }
        let mut name = Vec::new();
        if name_offset > 0 {
            if name_offset < RECORD_HEADER_SIZE || name_offset > size as usize {
                return Err(Error::bad_fs("usn name offset out of bounds"));
            }
            if name_size > size as usize - name_offset {
                return Err(Error::bad_fs("usn name size out of bounds"));
            }
            name.extend_from_slice(&stream[name_offset..name_offset + name_size]);
        }

        Ok(Self {
            size,
            major_version,
            minor_version,
            file_reference,
            parent_file_reference,
            update_sequence_number,
            update_time,
            reason_flags,
            source_flags,
            security_identifier_index,
            file_attribute_flags,
            name,
        })
    }

    pub fn name_size(&self) -> u16 {
        self.name.len() as u16
    }

    pub fn name_string(&self) -> String {
        let units: Vec<u16> = self
            .name
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    }

    pub fn update_unix_time(&self) -> i64 {
        crate::filetime::filetime_to_unix(self.update_time)
    }
}

/// Iterates records in a journal byte stream, skipping the zero fill
/// that pads the `$J` data between record runs.
pub struct RecordIter<'a> {
    stream: &'a [u8],
    pos: usize,
}

impl<'a> RecordIter<'a> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self { stream, pos: 0 }
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<UsnRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        // Records are 8-byte aligned; skip zero padding.
        while self.pos + RECORD_HEADER_SIZE <= self.stream.len()
            && self.stream[self.pos..self.pos + 4] == [0, 0, 0, 0]
        {
            self.pos += 8;
        }
        if self.pos + RECORD_HEADER_SIZE > self.stream.len() {
            return None;
        }
        match UsnRecord::parse(&self.stream[self.pos..]) {
            Ok(record) => {
                // Sizes are 8-byte aligned on disk; tolerate records that
                // forgot to round up.
                self.pos += (record.size as usize).next_multiple_of(8);
                Some(Ok(record))
            }
            Err(err) => {
                self.pos = self.stream.len();
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a v2 record with a UTF-16LE name and `pad` bytes of
    /// trailing data inside the record.
    fn sample_record_padded(name: &str, parent_mft: u64, pad: usize) -> Vec<u8> {
        let name_utf16: Vec<u8> = name
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        let size = ((RECORD_HEADER_SIZE + name_utf16.len() + pad) as u32).next_multiple_of(8);
        let mut raw = vec![0u8; size as usize];
        raw[0..4].copy_from_slice(&size.to_le_bytes());
        raw[4..6].copy_from_slice(&2u16.to_le_bytes());
        raw[8..16].copy_from_slice(&0x0005_0000_0000_002au64.to_le_bytes());
        raw[16..24].copy_from_slice(&parent_mft.to_le_bytes());
        raw[24..32].copy_from_slice(&0x1000u64.to_le_bytes());
        // 2004-02-29 (leap day) 12:00:00 UTC as FILETIME.
        let filetime = (1078056000i64 + 11_644_473_600) as u64 * 10_000_000;
        raw[32..40].copy_from_slice(&filetime.to_le_bytes());
        raw[40..44].copy_from_slice(&0x0000_0100u32.to_le_bytes()); // FILE_CREATE
        raw[56..58].copy_from_slice(&(name_utf16.len() as u16).to_le_bytes());
        raw[58..60].copy_from_slice(&60u16.to_le_bytes());
        raw[60..60 + name_utf16.len()].copy_from_slice(&name_utf16);
        raw
    }

    fn sample_record(name: &str, parent_mft: u64) -> Vec<u8> {
        sample_record_padded(name, parent_mft, 0)
    }

    #[test]
    fn parses_a_report_doc_record() {
        let raw = sample_record_padded("report.doc", 5, 16);
        assert_eq!(&raw[..6], &[0x60, 0, 0, 0, 0x02, 0]); // size 0x60, major 2
        let record = UsnRecord::parse(&raw).unwrap();
        assert_eq!(record.major_version, 2);
        assert_eq!(record.name_size(), 20);
        assert_eq!(record.name_string(), "report.doc");
        assert_eq!(record.parent_file_reference.mft_entry(), 5);
        assert_eq!(record.file_reference.mft_entry(), 0x2a);
        assert_eq!(record.file_reference.sequence(), 5);
        assert!(record.reason_flags.contains(UsnReasonFlags::FILE_CREATE));

        let dt = crate::filetime::filetime_to_datetime(record.update_time).unwrap();
        assert_eq!((dt.year, dt.month, dt.day), (2004, 2, 29));
        assert_eq!((dt.hours, dt.minutes, dt.seconds), (12, 0, 0));
    }

    #[test]
    fn wrong_major_version_rejected() {
        let mut raw = sample_record("x", 1);
        raw[4] = 3;
        assert!(UsnRecord::parse(&raw).is_err());
    }

    #[test]
    fn name_bounds_validated() {
        let mut raw = sample_record("report.doc", 5);
        raw[56..58].copy_from_slice(&200u16.to_le_bytes()); // name_size > size
        assert!(UsnRecord::parse(&raw).is_err());
        let mut raw = sample_record("report.doc", 5);
        raw[58..60].copy_from_slice(&8u16.to_le_bytes()); // offset < header
        assert!(UsnRecord::parse(&raw).is_err());
    }

    #[test]
    fn iterator_skips_padding() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&sample_record("a.txt", 5));
        stream.extend_from_slice(&[0u8; 32]);
        stream.extend_from_slice(&sample_record("b.txt", 5));
        let names: Vec<String> = RecordIter::new(&stream)
            .map(|r| r.unwrap().name_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }
}
