//! Composite path parsing.
//!
//! User-facing paths have the form `(device-spec)/sub/path` where
//! `device-spec` is a bare disk name or `disk,mapNAME<n>[,mapNAME<n>...]`
//! — e.g. `(hd0,msdos1)/boot/grub` or `(hd0,gpt2,msdos5)/`. The part in
//! parentheses selects a disk and a chain of partition-map entries; the
//! remainder is resolved by the mounted filesystem.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSelector {
    /// Partition-map name, e.g. `msdos` or `gpt`.
    pub map: String,
    /// 1-based partition number within that map.
    pub number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub disk: String,
    pub selectors: Vec<PartSelector>,
}

impl DeviceSpec {
    /// Parses a bare device spec (no parentheses), e.g. `hd0,gpt1`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split(',');
        let disk = parts.next().unwrap_or("");
        if disk.is_empty() {
            return Err(Error::BadFilename(spec.to_string()));
        }
        let mut selectors = Vec::new();
        for sel in parts {
            selectors.push(parse_selector(sel).ok_or_else(|| Error::BadFilename(spec.to_string()))?);
        }
        Ok(Self {
            disk: disk.to_string(),
            selectors,
        })
    }
}

fn parse_selector(sel: &str) -> Option<PartSelector> {
    let digits = sel.len() - sel.bytes().rev().take_while(|b| b.is_ascii_digit()).count();
    let (map, number) = sel.split_at(digits);
    if map.is_empty() || number.is_empty() {
        return None;
    }
    Some(PartSelector {
        map: map.to_string(),
        number: number.parse().ok()?,
    })
}

/// Splits a composite path into its device spec (if any) and the
/// filesystem-relative remainder.
pub fn split_path(path: &str) -> Result<(Option<DeviceSpec>, &str)> {
    if !path.starts_with('(') {
        return Ok((None, path));
    }
    let close = path
        .find(')')
        .ok_or_else(|| Error::BadFilename(path.to_string()))?;
    let spec = DeviceSpec::parse(&path[1..close])?;
    Ok((Some(spec), &path[close + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_disk() {
        let (spec, rest) = split_path("(hd0)/foo/bar").unwrap();
        let spec = spec.unwrap();
        assert_eq!(spec.disk, "hd0");
        assert!(spec.selectors.is_empty());
        assert_eq!(rest, "/foo/bar");
    }

    #[test]
    fn chained_selectors() {
        let (spec, rest) = split_path("(hd0,gpt2,msdos5)/x").unwrap();
        let spec = spec.unwrap();
        assert_eq!(spec.disk, "hd0");
        assert_eq!(
            spec.selectors,
            vec![
                PartSelector {
                    map: "gpt".into(),
                    number: 2
                },
                PartSelector {
                    map: "msdos".into(),
                    number: 5
                },
            ]
        );
        assert_eq!(rest, "/x");
    }

    #[test]
    fn loopback_names_with_dots() {
        let (spec, rest) = split_path("(boot.iso)/EFI").unwrap();
        assert_eq!(spec.unwrap().disk, "boot.iso");
        assert_eq!(rest, "/EFI");
    }

    #[test]
    fn malformed_specs() {
        assert!(matches!(split_path("(hd0/foo"), Err(Error::BadFilename(_))));
        assert!(matches!(split_path("()/"), Err(Error::BadFilename(_))));
        assert!(matches!(
            split_path("(hd0,msdos)/"),
            Err(Error::BadFilename(_))
        ));
        assert!(matches!(
            split_path("(hd0,5)/"),
            Err(Error::BadFilename(_))
        ));
    }

    #[test]
    fn device_less_path_passes_through() {
        let (spec, rest) = split_path("/plain").unwrap();
        assert!(spec.is_none());
        assert_eq!(rest, "/plain");
    }
}
