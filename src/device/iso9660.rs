//! ISO9660 volume descriptor and directory record parsing (§4.3).
//!
//! Parses directly against raw sectors rather than delegating to an
//! external ISO crate, in the same hand-rolled, bounds-checked style as
//! [`crate::device::partition::mbr`] and [`crate::device::partition::gpt`].

use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{DeviceOps, DirEntry, EntryKind, FilePrivate, FsProbe, MountedFs};
use crate::error::{IoError, IoResult};

const SECTOR_SIZE: u64 = 2048;
const FIRST_DESCRIPTOR_LBA: u64 = 16;
const MAX_DESCRIPTORS: u64 = 128;

const TYPE_PRIMARY: u8 = 1;
const TYPE_SUPPLEMENTARY: u8 = 2;
const TYPE_TERMINATOR: u8 = 255;

const STANDARD_IDENTIFIER: &[u8; 5] = b"CD001";

fn read_sector(device: &dyn DeviceOps, lba: u64) -> IoResult<[u8; 2048]> {
    let mut buf = [0u8; 2048];
    device.read(&mut buf, lba * SECTOR_SIZE)?;
    Ok(buf)
}

struct DirectoryRecordRef {
    extent_lba: u32,
    data_length: u32,
}

struct VolumeInfo {
    root: DirectoryRecordRef,
    joliet: bool,
    uuid: String,
}

/// Extracts the 17-byte ASCII volume timestamp at `offset` in `sector`.
/// Per ECMA-119, "unset" is encoded as sixteen ASCII `'0'` digits and a
/// zero GMT offset byte, not an all-zero byte string.
fn timestamp_is_set(sector: &[u8; 2048], offset: usize) -> bool {
    let digits = &sector[offset..offset + 16];
    let gmt_offset = sector[offset + 16];
    !(digits.iter().all(|&b| b == b'0') && gmt_offset == 0)
}

fn format_timestamp(sector: &[u8; 2048], offset: usize) -> String {
    let field = |start: usize, len: usize| -> String {
        core::str::from_utf8(&sector[offset + start..offset + start + len])
            .unwrap_or("00")
            .to_string()
    };
    format!(
        "{}-{}-{}-{}-{}-{}-{}",
        field(0, 4),
        field(4, 2),
        field(6, 2),
        field(8, 2),
        field(10, 2),
        field(12, 2),
        field(14, 2)
    )
}

const CREATION_DATETIME_OFFSET: usize = 813;
const MODIFICATION_DATETIME_OFFSET: usize = 830;
const ROOT_DIR_RECORD_OFFSET: usize = 156;
const ESCAPE_SEQUENCE_OFFSET: usize = 88;

const JOLIET_LEVEL_BYTES: [u8; 3] = [0x25, 0x2F, 0]; // third byte varies, checked separately

fn parse_root_record(sector: &[u8; 2048]) -> DirectoryRecordRef {
    let base = ROOT_DIR_RECORD_OFFSET;
    DirectoryRecordRef {
        extent_lba: u32::from_le_bytes(sector[base + 2..base + 6].try_into().unwrap()),
        data_length: u32::from_le_bytes(sector[base + 10..base + 14].try_into().unwrap()),
    }
}

fn is_joliet_escape(sector: &[u8; 2048]) -> bool {
    let seq = &sector[ESCAPE_SEQUENCE_OFFSET..ESCAPE_SEQUENCE_OFFSET + 3];
    seq[0] == JOLIET_LEVEL_BYTES[0]
        && seq[1] == JOLIET_LEVEL_BYTES[1]
        && matches!(seq[2], 0x40 | 0x43 | 0x45)
}

/// Scans volume descriptors starting at LBA 16, up to 128 sectors, until a
/// terminator (type 255) or the scan limit. Requires a primary VD; prefers
/// a Joliet supplementary VD's root if one is present.
fn scan_volume_descriptors(device: &dyn DeviceOps) -> IoResult<VolumeInfo> {
    let mut primary: Option<[u8; 2048]> = None;
    let mut joliet_root: Option<DirectoryRecordRef> = None;

    for i in 0..MAX_DESCRIPTORS {
        let sector = read_sector(device, FIRST_DESCRIPTOR_LBA + i)?;
        if sector[1..6] != *STANDARD_IDENTIFIER {
            return Err(IoError::CorruptFs);
        }
        match sector[0] {
            TYPE_TERMINATOR => break,
            TYPE_PRIMARY if primary.is_none() => primary = Some(sector),
            TYPE_SUPPLEMENTARY if is_joliet_escape(&sector) => {
                joliet_root = Some(parse_root_record(&sector));
            }
            _ => {}
        }
    }

    let primary = primary.ok_or(IoError::CorruptFs)?;

    let uuid = if timestamp_is_set(&primary, MODIFICATION_DATETIME_OFFSET) {
        format_timestamp(&primary, MODIFICATION_DATETIME_OFFSET)
    } else {
        format_timestamp(&primary, CREATION_DATETIME_OFFSET)
    };

    if let Some(root) = joliet_root {
        return Ok(VolumeInfo {
            root,
            joliet: true,
            uuid,
        });
    }

    Ok(VolumeInfo {
        root: parse_root_record(&primary),
        joliet: false,
        uuid,
    })
}

/// Canonicalizes a raw directory-record file identifier: strips a
/// trailing `;VERSION` (only when `VERSION == 1`) and a trailing `.`, and
/// lowercases it when not read from a Joliet record (§4.3, property 8).
fn canonicalize_name(mut name: String, joliet: bool) -> String {
    if let Some(pos) = name.rfind(';') {
        if name[pos + 1..] == *"1" {
            name.truncate(pos);
        }
    }
    if name.ends_with('.') {
        name.pop();
    }
    if !joliet {
        name = name.to_lowercase();
    }
    name
}

fn decode_joliet_name(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let code = u16::from_be_bytes([pair[0], pair[1]]);
        s.push(char::from_u32(u32::from(code)).unwrap_or('\u{FFFD}'));
    }
    s
}

#[derive(Debug, Clone, Copy)]
struct RawRecord {
    extent_lba: u32,
    data_length: u32,
    flags: u8,
}

/// Iterates every directory record in the extent `[lba, lba + ceil(data_length/2048))`.
/// A zero record length mid-sector means "skip to the next sector boundary"
/// rather than a parse error.
fn iterate_records(
    device: &dyn DeviceOps,
    dir: &DirectoryRecordRef,
    joliet: bool,
    mut cb: impl FnMut(String, RawRecord),
) -> IoResult<()> {
    let sector_count = (u64::from(dir.data_length) + SECTOR_SIZE - 1) / SECTOR_SIZE;
    for s in 0..sector_count {
        let sector = read_sector(device, u64::from(dir.extent_lba) + s)?;
        let mut offset = 0usize;
        while offset < sector.len() {
            let record_len = sector[offset];
            if record_len == 0 {
                break; // advance to next sector boundary.
            }
            let end = offset + record_len as usize;
            if end > sector.len() {
                break;
            }
            let record = &sector[offset..end];
            let extent_lba = u32::from_le_bytes(record[2..6].try_into().unwrap());
            let data_length = u32::from_le_bytes(record[10..14].try_into().unwrap());
            let flags = record[25];
            let id_len = record[32] as usize;
            let id_bytes = &record[33..33 + id_len];

            let name = if id_len == 1 && (id_bytes[0] == 0x00 || id_bytes[0] == 0x01) {
                if id_bytes[0] == 0x00 { ".".to_string() } else { "..".to_string() }
            } else if joliet {
                canonicalize_name(decode_joliet_name(id_bytes), true)
            } else {
                let raw = core::str::from_utf8(id_bytes).unwrap_or("").to_string();
                canonicalize_name(raw, false)
            };

            cb(
                name,
                RawRecord {
                    extent_lba,
                    data_length,
                    flags,
                },
            );
            offset = end;
        }
    }
    Ok(())
}

const FLAG_HIDDEN: u8 = 0b0000_0001;
const FLAG_DIRECTORY: u8 = 0b0000_0010;

#[derive(Debug)]
struct Iso9660Private {
    extent_lba: u32,
}
impl FilePrivate for Iso9660Private {
    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

/// A mounted ISO9660 filesystem.
#[derive(Debug)]
pub struct Iso9660Fs {
    device: Arc<dyn DeviceOps>,
    joliet: bool,
    root_lba: u32,
    root_size: u32,
    uuid: String,
}

impl MountedFs for Iso9660Fs {
    fn root(&self) -> super::FileState {
        super::FileState {
            kind: EntryKind::Dir,
            size: u64::from(self.root_size),
            private: Box::new(Iso9660Private {
                extent_lba: self.root_lba,
            }),
        }
    }

    fn uuid(&self) -> Option<String> {
        Some(self.uuid.clone())
    }

    fn label(&self) -> Option<String> {
        None
    }

    fn case_insensitive(&self) -> bool {
        !self.joliet
    }

    fn read(&self, handle: &super::FileState, buf: &mut [u8], offset: u64) -> IoResult<usize> {
        if handle.kind != EntryKind::Regular {
            return Err(IoError::NotFile);
        }
        let private = handle
            .private
            .as_any()
            .downcast_ref::<Iso9660Private>()
            .ok_or(IoError::SystemError)?;
        let remaining = handle.size.saturating_sub(offset);
        let to_read = (buf.len() as u64).min(remaining) as usize;
        if to_read == 0 {
            return Ok(0);
        }
        let start = u64::from(private.extent_lba) * SECTOR_SIZE + offset;
        self.device.read(&mut buf[..to_read], start)?;
        Ok(to_read)
    }

    fn open_entry(&self, handle: &super::FileState, name: &str) -> IoResult<super::FileState> {
        if handle.kind != EntryKind::Dir {
            return Err(IoError::NotDir);
        }
        let private = handle
            .private
            .as_any()
            .downcast_ref::<Iso9660Private>()
            .ok_or(IoError::SystemError)?;
        let dir = DirectoryRecordRef {
            extent_lba: private.extent_lba,
            data_length: u32::try_from(handle.size).unwrap_or(u32::MAX),
        };
        let target = if self.joliet { name.to_string() } else { name.to_lowercase() };

        let mut found: Option<super::FileState> = None;
        iterate_records(&*self.device, &dir, self.joliet, |entry_name, raw| {
            if found.is_some() || raw.flags & FLAG_HIDDEN != 0 {
                return;
            }
            if entry_name == target {
                found = Some(super::FileState {
                    kind: if raw.flags & FLAG_DIRECTORY != 0 { EntryKind::Dir } else { EntryKind::Regular },
                    size: u64::from(raw.data_length),
                    private: Box::new(Iso9660Private {
                        extent_lba: raw.extent_lba,
                    }),
                });
            }
        })?;
        found.ok_or(IoError::NotFound)
    }

    fn iterate(&self, handle: &super::FileState, cb: &mut dyn FnMut(DirEntry)) -> IoResult<()> {
        if handle.kind != EntryKind::Dir {
            return Err(IoError::NotDir);
        }
        let private = handle
            .private
            .as_any()
            .downcast_ref::<Iso9660Private>()
            .ok_or(IoError::SystemError)?;
        let dir = DirectoryRecordRef {
            extent_lba: private.extent_lba,
            data_length: u32::try_from(handle.size).unwrap_or(u32::MAX),
        };
        iterate_records(&*self.device, &dir, self.joliet, |name, raw| {
            if raw.flags & FLAG_HIDDEN != 0 || name == "." || name == ".." {
                return;
            }
            cb(DirEntry {
                name,
                kind: if raw.flags & FLAG_DIRECTORY != 0 { EntryKind::Dir } else { EntryKind::Regular },
            });
        })
    }
}

/// Registered against the built-in filesystem dispatch table.
#[derive(Debug)]
pub struct Iso9660Probe;

impl FsProbe for Iso9660Probe {
    fn probe(&self, device: Arc<dyn DeviceOps>) -> IoResult<Box<dyn MountedFs>> {
        let info = scan_volume_descriptors(&*device)?;
        Ok(Box::new(Iso9660Fs {
            device,
            joliet: info.joliet,
            root_lba: info.root.extent_lba,
            root_size: info.root.data_length,
            uuid: info.uuid,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex;

    /// A device backed by an in-memory array of 2048-byte sectors.
    #[derive(Debug)]
    struct MemDevice {
        sectors: Mutex<Vec<[u8; 2048]>>,
    }

    impl DeviceOps for MemDevice {
        fn read(&self, buf: &mut [u8], offset: u64) -> IoResult<()> {
            let sectors = self.sectors.lock();
            let lba = (offset / SECTOR_SIZE) as usize;
            let within = (offset % SECTOR_SIZE) as usize;
            let sector = sectors.get(lba).ok_or(IoError::EndOfFile)?;
            let n = buf.len();
            buf.copy_from_slice(&sector[within..within + n]);
            Ok(())
        }
        fn identify(&self, _buf: &mut [u8]) -> IoResult<usize> {
            Ok(0)
        }
        fn size(&self) -> Option<u64> {
            Some(self.sectors.lock().len() as u64 * SECTOR_SIZE)
        }
    }

    fn write_dir_record(sector: &mut [u8; 2048], offset: usize, extent: u32, len: u32, name: &[u8], flags: u8) -> usize {
        let id_len = name.len();
        let record_len = 33 + id_len + (1 - id_len % 2);
        sector[offset] = record_len as u8;
        sector[offset + 2..offset + 6].copy_from_slice(&extent.to_le_bytes());
        sector[offset + 6..offset + 10].copy_from_slice(&extent.to_be_bytes());
        sector[offset + 10..offset + 14].copy_from_slice(&len.to_le_bytes());
        sector[offset + 14..offset + 18].copy_from_slice(&len.to_be_bytes());
        sector[offset + 25] = flags;
        sector[offset + 32] = id_len as u8;
        sector[offset + 33..offset + 33 + id_len].copy_from_slice(name);
        record_len
    }

    fn build_minimal_image() -> Arc<MemDevice> {
        let mut sectors = alloc::vec![[0u8; 2048]; 24];

        // root directory at LBA 20, containing one file "GREETING.TXT;1"
        // and one subdirectory "SUB".
        let mut root_sector = [0u8; 2048];
        let mut off = 0;
        off += write_dir_record(&mut root_sector, off, 20, 2048, &[0x00], FLAG_DIRECTORY);
        off += write_dir_record(&mut root_sector, off, 20, 2048, &[0x01], FLAG_DIRECTORY);
        off += write_dir_record(&mut root_sector, off, 21, 5, b"GREETING.TXT;1", 0);
        write_dir_record(&mut root_sector, off, 22, 2048, b"SUB", FLAG_DIRECTORY);
        sectors[20] = root_sector;

        let mut file_sector = [0u8; 2048];
        file_sector[0..5].copy_from_slice(b"hello");
        sectors[21] = file_sector;

        let mut pvd = [0u8; 2048];
        pvd[0] = TYPE_PRIMARY;
        pvd[1..6].copy_from_slice(STANDARD_IDENTIFIER);
        let root_record_base = ROOT_DIR_RECORD_OFFSET;
        write_dir_record(&mut pvd, root_record_base, 20, 2048, &[0x00], FLAG_DIRECTORY);
        // modification timestamp: 2015-07-04-12-34-56-78, offset 0
        let ts = b"20150704123456780\0";
        pvd[MODIFICATION_DATETIME_OFFSET..MODIFICATION_DATETIME_OFFSET + 17]
            .copy_from_slice(&ts[0..17]);
        sectors[16] = pvd;

        let mut terminator = [0u8; 2048];
        terminator[0] = TYPE_TERMINATOR;
        terminator[1..6].copy_from_slice(STANDARD_IDENTIFIER);
        sectors[17] = terminator;

        Arc::new(MemDevice {
            sectors: Mutex::new(sectors),
        })
    }

    #[test]
    fn scenario_s6_uuid_from_modification_timestamp() {
        let device = build_minimal_image();
        let info = scan_volume_descriptors(&*device).unwrap();
        assert_eq!(info.uuid, "2015-07-04-12-34-56-78");
    }

    #[test]
    fn mounts_and_lists_root() {
        let device = build_minimal_image();
        let fs = Iso9660Probe.probe(device).unwrap();
        let root = fs.root();
        let mut names = Vec::new();
        fs.iterate(&root, &mut |e| names.push(e.name)).unwrap();
        assert!(names.contains(&"greeting.txt".to_string()));
        assert!(names.contains(&"sub".to_string()));
        assert!(!names.contains(&".".to_string()));
    }

    #[test]
    fn opens_file_and_reads_contents() {
        let device = build_minimal_image();
        let fs = Iso9660Probe.probe(device).unwrap();
        let root = fs.root();
        let file = fs.open_entry(&root, "greeting.txt").unwrap();
        assert_eq!(file.kind, EntryKind::Regular);
        let mut buf = [0u8; 5];
        let n = fs.read(&file, &mut buf, 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn name_canonicalization_strips_version_and_dot() {
        assert_eq!(canonicalize_name("FOO.TXT;1".to_string(), false), "foo.txt");
        assert_eq!(canonicalize_name("FOO.".to_string(), false), "foo");
        assert_eq!(canonicalize_name("FOO;2".to_string(), false), "foo;2");
    }
}
