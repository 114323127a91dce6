//! Linux md-raid (v1.x superblock) disk filter.
//!
//! Members carry a superblock 4096 bytes into the device (minor version
//! 1.2, the mdadm default). Matching members are grouped by array UUID;
//! when enough of them are present for the level's redundancy policy the
//! array is exposed as a virtual disk. A single missing RAID5/6 member
//! is reconstructed from parity on every read that touches it.

use std::collections::HashMap;

use strata_core::source::share;
use strata_core::{ByteSource, Disk, DiskFilterDriver, Error, Result};

pub const MD_MAGIC: u32 = 0xa92b_4efc;
/// Byte offset of the v1.2 superblock within a member device.
pub const MD_SB_OFFSET: u64 = 4096;

const ROLE_SPARE: u16 = 0xFFFF;
const ROLE_FAULTY: u16 = 0xFFFE;

// raid5/6 algorithm numbers from the superblock layout field.
const ALG_LEFT_ASYMMETRIC: u32 = 0;
const ALG_RIGHT_ASYMMETRIC: u32 = 1;
const ALG_LEFT_SYMMETRIC: u32 = 2;
const ALG_RIGHT_SYMMETRIC: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
struct ArrayParams {
    uuid: [u8; 16],
    name: String,
    level: u32,
    layout: u32,
    chunk_sectors: u64,
    raid_disks: u32,
    size_sectors: u64,
}

#[derive(Clone)]
struct Member {
    disk: Disk,
    data_offset: u64,
    data_size: u64,
}

struct MemberSb {
    params: ArrayParams,
    role: u16,
    data_offset_sectors: u64,
    data_size_sectors: u64,
}

fn read_superblock(disk: &Disk) -> Result<Option<MemberSb>> {
    if disk.total_bytes() < MD_SB_OFFSET + 1024 {
        return Ok(None);
    }
    let mut sb = [0u8; 1024];
    disk.read_at(MD_SB_OFFSET, &mut sb)?;

    let u32_at = |off: usize| u32::from_le_bytes(sb[off..off + 4].try_into().unwrap());
    let u64_at = |off: usize| u64::from_le_bytes(sb[off..off + 8].try_into().unwrap());

    if u32_at(0) != MD_MAGIC {
        return Ok(None);
    }
    if u32_at(4) != 1 {
        return Err(Error::unsupported("md superblock major version"));
    }

    let raid_disks = u32_at(92);
    let max_dev = u32_at(220);
    let dev_number = u32_at(160);
    if raid_disks == 0 || raid_disks > 64 || max_dev > 384 || dev_number >= max_dev {
        return Err(Error::bad_fs("implausible md member counts"));
    }
    let role_off = 256 + dev_number as usize * 2;
    let role = u16::from_le_bytes(sb[role_off..role_off + 2].try_into().unwrap());

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&sb[16..32]);
    let raw_name: Vec<u8> = sb[32..64].iter().copied().take_while(|&b| b != 0).collect();
    let name = String::from_utf8_lossy(&raw_name).into_owned();

    Ok(Some(MemberSb {
        params: ArrayParams {
            uuid,
            name,
            level: u32_at(72),
            layout: u32_at(76),
            chunk_sectors: u32_at(88) as u64,
            raid_disks,
            size_sectors: u64_at(80),
        },
        role,
        data_offset_sectors: u64_at(128),
        data_size_sectors: u64_at(136),
    }))
}

/// Maps `stripe` data column `d` to a member index, for raid5/6.
/// Returns `(member_of_d, parity_member, q_member)`.
fn raid_columns(params: &ArrayParams, stripe: u64, d: u64) -> Result<(u64, u64, Option<u64>)> {
    let n = params.raid_disks as u64;
    match params.level {
        5 => {
            let pd = match params.layout {
                ALG_LEFT_ASYMMETRIC | ALG_LEFT_SYMMETRIC => n - 1 - stripe % n,
                ALG_RIGHT_ASYMMETRIC | ALG_RIGHT_SYMMETRIC => stripe % n,
                other => return Err(Error::unsupported(format!("raid5 layout {other}"))),
            };
            let dd = match params.layout {
                ALG_LEFT_SYMMETRIC | ALG_RIGHT_SYMMETRIC => (pd + 1 + d) % n,
                _ => {
                    if d < pd { d } else { d + 1 }
                }
            };
            Ok((dd, pd, None))
        }
        6 => {
            if params.layout != ALG_LEFT_SYMMETRIC {
                return Err(Error::unsupported(format!("raid6 layout {}", params.layout)));
            }
            let pd = n - 1 - stripe % n;
            let qd = (pd + 1) % n;
            Ok(((pd + 2 + d) % n, pd, Some(qd)))
        }
        _ => unreachable!(),
    }
}

struct RaidSource {
    params: ArrayParams,
    members: Vec<Option<Member>>,
    len: u64,
}

impl RaidSource {
    fn member_read(&self, member: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        let m = self.members[member as usize]
            .as_ref()
            .ok_or_else(|| Error::bad_fs("read from missing raid member"))?;
        if offset + buf.len() as u64 > m.data_size {
            return Err(Error::OutOfRange);
        }
        m.disk.read_at(m.data_offset + offset, buf)
    }

    /// Reconstructs `member`'s bytes at `offset` by XOR of every other
    /// column, parity included (RAID5) or excluding Q (RAID6).
    fn reconstruct(&self, member: u64, skip: Option<u64>, offset: u64, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        let mut column = vec![0u8; buf.len()];
        for other in 0..self.params.raid_disks as u64 {
            if other == member || Some(other) == skip {
                continue;
            }
            self.member_read(other, offset, &mut column)?;
            for (dst, src) in buf.iter_mut().zip(&column) {
                *dst ^= src;
            }
        }
        Ok(())
    }

    /// Reads one run that stays within a single chunk of the logical
    /// address space.
    fn read_run(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let chunk = self.params.chunk_sectors << 9;
        let n = self.params.raid_disks as u64;
        let chunk_index = offset / chunk;
        let in_chunk = offset % chunk;

        match self.params.level {
            0 => {
                let member = chunk_index % n;
                let member_off = (chunk_index / n) * chunk + in_chunk;
                self.member_read(member, member_off, buf)
            }
            1 => {
                let member = (0..n)
                    .find(|&i| self.members[i as usize].is_some())
                    .ok_or_else(|| Error::bad_fs("raid1 with no members"))?;
                self.member_read(member, offset, buf)
            }
            5 | 6 => {
                let data_disks = n - if self.params.level == 5 { 1 } else { 2 };
                let stripe = chunk_index / data_disks;
                let d = chunk_index % data_disks;
                let (member, _parity, q) = raid_columns(&self.params, stripe, d)?;
                let member_off = stripe * chunk + in_chunk;
                if self.members[member as usize].is_some() {
                    self.member_read(member, member_off, buf)
                } else {
                    // The missing column is the XOR of every survivor
                    // (parity included, Q excluded).
                    self.reconstruct(member, q, member_off, buf)
                }
            }
            other => Err(Error::unsupported(format!("raid level {other}"))),
        }
    }
}

impl ByteSource for RaidSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset.checked_add(buf.len() as u64).is_none_or(|end| end > self.len) {
            return Err(Error::OutOfRange);
        }
        let chunk = self.params.chunk_sectors << 9;
        let mut offset = offset;
        let mut buf = buf;
        while !buf.is_empty() {
            let in_chunk = (offset % chunk) as usize;
            let run = buf.len().min(chunk as usize - in_chunk);
            let (head, tail) = buf.split_at_mut(run);
            self.read_run(offset, head)?;
            offset += run as u64;
            buf = tail;
        }
        Ok(())
    }
}

pub struct MdRaidFilter;

impl DiskFilterDriver for MdRaidFilter {
    fn name(&self) -> &'static str {
        "mdraid1x"
    }

    fn assemble(&self, members: &[Disk]) -> Result<Vec<Disk>> {
        let mut groups: HashMap<[u8; 16], (ArrayParams, Vec<Option<Member>>)> = HashMap::new();

        for disk in members {
            let Some(sb) = read_superblock(disk)? else {
                continue;
            };
            if sb.role == ROLE_SPARE || sb.role == ROLE_FAULTY {
                log::debug!(target: "md", "{}: spare/faulty member, skipping", disk.name());
                continue;
            }
            if sb.role as u32 >= sb.params.raid_disks {
                return Err(Error::bad_fs("md member role out of range"));
            }
            let (params, slots) = groups
                .entry(sb.params.uuid)
                .or_insert_with(|| {
                    let slots = vec![None; sb.params.raid_disks as usize];
                    (sb.params.clone(), slots)
                });
            if *params != sb.params {
                return Err(Error::bad_fs("md members disagree about array geometry"));
            }
            let slot = &mut slots[sb.role as usize];
            if slot.is_some() {
                return Err(Error::bad_fs("duplicate md member role"));
            }
            *slot = Some(Member {
                disk: disk.clone(),
                data_offset: sb.data_offset_sectors << 9,
                data_size: sb.data_size_sectors << 9,
            });
        }

        let mut arrays = Vec::new();
        for (params, slots) in groups.into_values() {
            let present = slots.iter().filter(|m| m.is_some()).count() as u32;
            let missing = params.raid_disks - present;
            let tolerated = match params.level {
                0 => 0,
                1 => params.raid_disks - 1,
                5 | 6 => 1,
                other => {
                    log::warn!(target: "md", "array with unsupported level {other}");
                    continue;
                }
            };
            if missing > tolerated {
                log::warn!(
                    target: "md",
                    "array {} degraded beyond recovery ({} of {} members)",
                    params.name, present, params.raid_disks
                );
                continue;
            }

            let per_member = if params.size_sectors > 0 {
                params.size_sectors << 9
            } else {
                slots
                    .iter()
                    .flatten()
                    .map(|m| m.data_size)
                    .min()
                    .unwrap_or(0)
            };
            let n = params.raid_disks as u64;
            let len = match params.level {
                0 => per_member * n,
                1 => per_member,
                5 => per_member * (n - 1),
                6 => per_member * (n - 2),
                _ => unreachable!(),
            };
            if params.level != 1 && params.chunk_sectors == 0 {
                return Err(Error::bad_fs("striped md array with zero chunk size"));
            }

            let name = if params.name.is_empty() {
                format!(
                    "md/{:02x}{:02x}{:02x}{:02x}",
                    params.uuid[0], params.uuid[1], params.uuid[2], params.uuid[3]
                )
            } else {
                // mdadm names arrays "host:name"; keep the name part.
                params
                    .name
                    .rsplit(':')
                    .next()
                    .map(|n| format!("md/{n}"))
                    .unwrap()
            };
            log::debug!(
                target: "md",
                "assembled {} level={} members={}/{} len={}",
                name, params.level, present, params.raid_disks, len
            );
            let chunk_sectors = if params.level == 1 && params.chunk_sectors == 0 {
                // raid1 has no stripes; use a whole-disk chunk so the
                // run splitter degenerates to plain reads.
                1 << 32
            } else {
                params.chunk_sectors
            };
            let source = RaidSource {
                params: ArrayParams {
                    chunk_sectors,
                    ..params
                },
                members: slots,
                len,
            };
            arrays.push(Disk::new(name, share(source)));
        }
        Ok(arrays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::source::{MemSource, share};

    const CHUNK_SECTORS: u32 = 2; // 1 KiB chunks keep the fixtures small

    fn member_image(
        uuid: [u8; 16],
        level: u32,
        layout: u32,
        raid_disks: u32,
        dev_number: u32,
        role: u16,
        size_sectors: u64,
        data: &[u8],
    ) -> Vec<u8> {
        // 16 sectors of header space, then the data area.
        let data_offset_sectors = 16u64;
        let mut image = vec![0u8; (data_offset_sectors as usize) * 512 + data.len()];
        let sb = &mut image[MD_SB_OFFSET as usize..];
        sb[0..4].copy_from_slice(&MD_MAGIC.to_le_bytes());
        sb[4..8].copy_from_slice(&1u32.to_le_bytes());
        sb[16..32].copy_from_slice(&uuid);
        sb[32..36].copy_from_slice(b"t:a\0");
        sb[72..76].copy_from_slice(&level.to_le_bytes());
        sb[76..80].copy_from_slice(&layout.to_le_bytes());
        sb[80..88].copy_from_slice(&size_sectors.to_le_bytes());
        sb[88..92].copy_from_slice(&CHUNK_SECTORS.to_le_bytes());
        sb[92..96].copy_from_slice(&raid_disks.to_le_bytes());
        sb[128..136].copy_from_slice(&data_offset_sectors.to_le_bytes());
        sb[136..144].copy_from_slice(&(data.len() as u64 / 512).to_le_bytes());
        sb[160..164].copy_from_slice(&dev_number.to_le_bytes());
        sb[220..224].copy_from_slice(&raid_disks.to_le_bytes());
        for dev in 0..raid_disks {
            let off = 256 + dev as usize * 2;
            let r = if dev == dev_number { role } else { dev as u16 };
            sb[off..off + 2].copy_from_slice(&r.to_le_bytes());
        }
        image[data_offset_sectors as usize * 512..].copy_from_slice(data);
        image
    }

    fn disk(name: &str, image: Vec<u8>) -> Disk {
        Disk::new(name, share(MemSource::new(image)))
    }

    #[test]
    fn raid0_striping() {
        let chunk = CHUNK_SECTORS as usize * 512;
        let uuid = [7u8; 16];
        // Logical content: chunks 0,2 on member 0; chunks 1,3 on member 1.
        let m0: Vec<u8> = [vec![0u8; chunk], vec![2u8; chunk]].concat();
        let m1: Vec<u8> = [vec![1u8; chunk], vec![3u8; chunk]].concat();
        let members = vec![
            disk("a", member_image(uuid, 0, 0, 2, 0, 0, 4, &m0)),
            disk("b", member_image(uuid, 0, 0, 2, 1, 1, 4, &m1)),
        ];
        let arrays = MdRaidFilter.assemble(&members).unwrap();
        assert_eq!(arrays.len(), 1);
        let array = &arrays[0];
        assert_eq!(array.name(), "md/a");
        assert_eq!(array.total_bytes(), 4 * chunk as u64);

        let mut out = vec![0u8; 4 * chunk];
        array.read_at(0, &mut out).unwrap();
        for (i, chunk_data) in out.chunks(chunk).enumerate() {
            assert!(chunk_data.iter().all(|&b| b == i as u8));
        }

        // An unaligned read crossing a stripe boundary.
        let mut cross = vec![0u8; chunk];
        array.read_at(chunk as u64 / 2, &mut cross).unwrap();
        assert!(cross[..chunk / 2].iter().all(|&b| b == 0));
        assert!(cross[chunk / 2..].iter().all(|&b| b == 1));
    }

    #[test]
    fn raid5_degraded_reconstruction() {
        let chunk = CHUNK_SECTORS as usize * 512;
        let uuid = [9u8; 16];
        // 3 members, left-symmetric, 4 logical chunks (2 stripes).
        // Logical chunk c is filled with byte c+1.
        let logical: Vec<Vec<u8>> = (0..4).map(|c| vec![c as u8 + 1; chunk]).collect();
        // stripe 0: pd = 2, data d0 -> member 0, d1 -> member 1.
        // stripe 1: pd = 1, data d0 -> member 2, d1 -> member 0.
        let parity0: Vec<u8> = logical[0].iter().zip(&logical[1]).map(|(a, b)| a ^ b).collect();
        let parity1: Vec<u8> = logical[2].iter().zip(&logical[3]).map(|(a, b)| a ^ b).collect();
        let m0 = [logical[0].clone(), logical[3].clone()].concat();
        let m1 = [logical[1].clone(), parity1].concat();
        let m2 = [parity0, logical[2].clone()].concat();

        let build = |devnum: u32, role: u16, data: &[u8]| {
            member_image(uuid, 5, ALG_LEFT_SYMMETRIC, 3, devnum, role, 4, data)
        };
        let full = vec![
            disk("a", build(0, 0, &m0)),
            disk("b", build(1, 1, &m1)),
            disk("c", build(2, 2, &m2)),
        ];
        let arrays = MdRaidFilter.assemble(&full).unwrap();
        let array = &arrays[0];
        assert_eq!(array.total_bytes(), 4 * chunk as u64);
        let mut out = vec![0u8; 4 * chunk];
        array.read_at(0, &mut out).unwrap();
        for (c, data) in out.chunks(chunk).enumerate() {
            assert!(data.iter().all(|&b| b == c as u8 + 1), "chunk {c}");
        }

        // Drop member 1 and read again through parity.
        let degraded = vec![
            disk("a", build(0, 0, &m0)),
            disk("c", build(2, 2, &m2)),
        ];
        let arrays = MdRaidFilter.assemble(&degraded).unwrap();
        let mut rebuilt = vec![0u8; 4 * chunk];
        arrays[0].read_at(0, &mut rebuilt).unwrap();
        assert_eq!(rebuilt, out);
    }

    #[test]
    fn raid0_missing_member_refused() {
        let chunk = CHUNK_SECTORS as usize * 512;
        let uuid = [3u8; 16];
        let m0 = vec![0u8; 2 * chunk];
        let members = vec![disk("a", member_image(uuid, 0, 0, 2, 0, 0, 4, &m0))];
        let arrays = MdRaidFilter.assemble(&members).unwrap();
        assert!(arrays.is_empty());
    }
}
