//! A from-scratch ELF32/ELF64 reader: header, program headers, section
//! headers, and `.note` iteration (§4.8(b), §4.8(e), §4.8(i)).
//!
//! Reads straight off `&[u8]` slices rather than an on-disk struct layout,
//! covering both 32-bit and 64-bit word sizes plus note iteration, in the
//! same bounds-checked style as [`crate::device::partition::mbr`].

use alloc::vec::Vec;

use crate::error::ImageError;

const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

pub const PT_LOAD: u32 = 1;
pub const PT_NOTE: u32 = 4;

pub const SHF_ALLOC: u64 = 0x2;
pub const SHT_NOBITS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Bits32,
    Bits64,
}

/// Decoded fields common to ELF32 and ELF64 headers, widened to `u64`.
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub mode: Mode,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

fn u16_at(b: &[u8], off: usize) -> Result<u16, ImageError> {
    b.get(off..off + 2)
        .map(|s| u16::from_le_bytes(s.try_into().unwrap()))
        .ok_or(ImageError::MalformedImage)
}

fn u32_at(b: &[u8], off: usize) -> Result<u32, ImageError> {
    b.get(off..off + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        .ok_or(ImageError::MalformedImage)
}

fn u64_at(b: &[u8], off: usize) -> Result<u64, ImageError> {
    b.get(off..off + 8)
        .map(|s| u64::from_le_bytes(s.try_into().unwrap()))
        .ok_or(ImageError::MalformedImage)
}

/// Parses the fixed-size ELF header at the start of `bytes`.
///
/// # Errors
///
/// [`ImageError::UnknownImage`] if the magic is absent; [`ImageError::UnsupportedVersion`]
/// for a class/encoding this loader cannot read (only little-endian 32/64-bit
/// is supported); [`ImageError::MalformedImage`] if the buffer is too short.
pub fn parse_header(bytes: &[u8]) -> Result<ElfHeader, ImageError> {
    if bytes.len() < 20 || bytes[0..4] != MAGIC {
        return Err(ImageError::UnknownImage);
    }
    if bytes[EI_DATA] != ELFDATA2LSB {
        return Err(ImageError::UnsupportedVersion);
    }
    let mode = match bytes[EI_CLASS] {
        ELFCLASS32 => Mode::Bits32,
        ELFCLASS64 => Mode::Bits64,
        _ => return Err(ImageError::UnsupportedVersion),
    };

    match mode {
        Mode::Bits32 => Ok(ElfHeader {
            mode,
            entry: u64::from(u32_at(bytes, 24)?),
            phoff: u64::from(u32_at(bytes, 28)?),
            shoff: u64::from(u32_at(bytes, 32)?),
            phentsize: u16_at(bytes, 42)?,
            phnum: u16_at(bytes, 44)?,
            shentsize: u16_at(bytes, 46)?,
            shnum: u16_at(bytes, 48)?,
            shstrndx: u16_at(bytes, 50)?,
        }),
        Mode::Bits64 => Ok(ElfHeader {
            mode,
            entry: u64_at(bytes, 24)?,
            phoff: u64_at(bytes, 32)?,
            shoff: u64_at(bytes, 40)?,
            phentsize: u16_at(bytes, 54)?,
            phnum: u16_at(bytes, 56)?,
            shentsize: u16_at(bytes, 58)?,
            shnum: u16_at(bytes, 60)?,
            shstrndx: u16_at(bytes, 62)?,
        }),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

/// # Errors
///
/// [`ImageError::MalformedImage`] if the table runs past the end of `bytes`.
pub fn parse_program_headers(bytes: &[u8], header: &ElfHeader) -> Result<Vec<ProgramHeader>, ImageError> {
    let mut out = Vec::with_capacity(header.phnum as usize);
    for i in 0..header.phnum {
        let base = header.phoff as usize + i as usize * header.phentsize as usize;
        let entry = bytes.get(base..).ok_or(ImageError::MalformedImage)?;
        out.push(match header.mode {
            Mode::Bits32 => ProgramHeader {
                p_type: u32_at(entry, 0)?,
                offset: u64::from(u32_at(entry, 4)?),
                vaddr: u64::from(u32_at(entry, 8)?),
                paddr: u64::from(u32_at(entry, 12)?),
                filesz: u64::from(u32_at(entry, 16)?),
                memsz: u64::from(u32_at(entry, 20)?),
                flags: u32_at(entry, 24)?,
                align: u64::from(u32_at(entry, 28)?),
            },
            Mode::Bits64 => ProgramHeader {
                p_type: u32_at(entry, 0)?,
                flags: u32_at(entry, 4)?,
                offset: u64_at(entry, 8)?,
                vaddr: u64_at(entry, 16)?,
                paddr: u64_at(entry, 24)?,
                filesz: u64_at(entry, 32)?,
                memsz: u64_at(entry, 40)?,
                align: u64_at(entry, 48)?,
            },
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    pub name_off: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

/// # Errors
///
/// [`ImageError::MalformedImage`] if the table runs past the end of `bytes`.
pub fn parse_section_headers(bytes: &[u8], header: &ElfHeader) -> Result<Vec<SectionHeader>, ImageError> {
    let mut out = Vec::with_capacity(header.shnum as usize);
    for i in 0..header.shnum {
        let base = header.shoff as usize + i as usize * header.shentsize as usize;
        let entry = bytes.get(base..).ok_or(ImageError::MalformedImage)?;
        out.push(match header.mode {
            Mode::Bits32 => SectionHeader {
                name_off: u32_at(entry, 0)?,
                sh_type: u32_at(entry, 4)?,
                flags: u64::from(u32_at(entry, 8)?),
                addr: u64::from(u32_at(entry, 12)?),
                offset: u64::from(u32_at(entry, 16)?),
                size: u64::from(u32_at(entry, 20)?),
                link: u32_at(entry, 24)?,
                info: u32_at(entry, 28)?,
                addralign: u64::from(u32_at(entry, 32)?),
                entsize: u64::from(u32_at(entry, 36)?),
            },
            Mode::Bits64 => SectionHeader {
                name_off: u32_at(entry, 0)?,
                sh_type: u32_at(entry, 4)?,
                flags: u64_at(entry, 8)?,
                addr: u64_at(entry, 16)?,
                offset: u64_at(entry, 24)?,
                size: u64_at(entry, 32)?,
                link: u32_at(entry, 40)?,
                info: u32_at(entry, 44)?,
                addralign: u64_at(entry, 48)?,
                entsize: u64_at(entry, 56)?,
            },
        });
    }
    Ok(out)
}

/// Reads the string at byte offset `off` in the `.shstrtab`-style table
/// `strtab` (NUL-terminated).
#[must_use]
pub fn read_str(strtab: &[u8], off: u32) -> &str {
    let start = off as usize;
    let end = strtab[start..].iter().position(|&b| b == 0).map_or(strtab.len(), |p| start + p);
    core::str::from_utf8(&strtab[start..end]).unwrap_or("")
}

/// One decoded note record.
#[derive(Debug, Clone, Copy)]
pub struct Note<'a> {
    pub name: &'a [u8],
    pub n_type: u32,
    pub desc: &'a [u8],
}

/// Walks every note record inside every `PT_NOTE` segment, in file order,
/// invoking `cb` once per note (§4.8(b)). Note entries are
/// `{namesz:u32, descsz:u32, type:u32}` followed by the name (NUL-padded to
/// 4 bytes) and the descriptor (NUL-padded to 4 bytes).
///
/// # Errors
///
/// [`ImageError::MalformedImage`] if a note's declared sizes run past its
/// containing segment.
pub fn iterate_notes(
    bytes: &[u8],
    phdrs: &[ProgramHeader],
    mut cb: impl FnMut(Note<'_>) -> Result<(), ImageError>,
) -> Result<(), ImageError> {
    for phdr in phdrs.iter().filter(|p| p.p_type == PT_NOTE) {
        let start = phdr.offset as usize;
        let end = start.checked_add(phdr.filesz as usize).ok_or(ImageError::MalformedImage)?;
        let segment = bytes.get(start..end).ok_or(ImageError::MalformedImage)?;

        let mut cursor = 0usize;
        while cursor + 12 <= segment.len() {
            let namesz = u32_at(segment, cursor)? as usize;
            let descsz = u32_at(segment, cursor + 4)? as usize;
            let n_type = u32_at(segment, cursor + 8)?;
            cursor += 12;

            let name_end = cursor.checked_add(namesz).ok_or(ImageError::MalformedImage)?;
            let name = segment.get(cursor..name_end).ok_or(ImageError::MalformedImage)?;
            cursor = crate::mem::align_up(name_end as u64, 4) as usize;

            let desc_end = cursor.checked_add(descsz).ok_or(ImageError::MalformedImage)?;
            let desc = segment.get(cursor..desc_end).ok_or(ImageError::MalformedImage)?;
            cursor = crate::mem::align_up(desc_end as u64, 4) as usize;

            cb(Note { name, n_type, desc })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn minimal_header_bytes(mode: Mode) -> Vec<u8> {
        let mut b = vec![0u8; 64];
        b[0..4].copy_from_slice(&MAGIC);
        b[EI_CLASS] = if mode == Mode::Bits64 { ELFCLASS64 } else { ELFCLASS32 };
        b[EI_DATA] = ELFDATA2LSB;
        match mode {
            Mode::Bits64 => {
                b[24..32].copy_from_slice(&0xFFFF_8000_0010_0000u64.to_le_bytes()); // entry
                b[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
                b[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
                b[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum
            }
            Mode::Bits32 => {
                b[24..28].copy_from_slice(&0x0010_0000u32.to_le_bytes());
                b[28..32].copy_from_slice(&52u32.to_le_bytes());
                b[42..44].copy_from_slice(&32u16.to_le_bytes());
                b[44..46].copy_from_slice(&1u16.to_le_bytes());
            }
        }
        b
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 64];
        assert_eq!(parse_header(&bytes).unwrap_err(), ImageError::UnknownImage);
    }

    #[test]
    fn parses_64bit_header() {
        let bytes = minimal_header_bytes(Mode::Bits64);
        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.mode, Mode::Bits64);
        assert_eq!(header.entry, 0xFFFF_8000_0010_0000);
        assert_eq!(header.phnum, 1);
    }

    #[test]
    fn parses_32bit_header() {
        let bytes = minimal_header_bytes(Mode::Bits32);
        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.mode, Mode::Bits32);
        assert_eq!(header.entry, 0x0010_0000);
    }

    #[test]
    fn iterates_one_note() {
        let mut header = minimal_header_bytes(Mode::Bits64);
        let phdr_off = 64;
        let note_off = phdr_off + 56;

        let name = b"KBoot\0";
        let desc = 7u32.to_le_bytes();
        let mut note_segment = Vec::new();
        note_segment.extend_from_slice(&(name.len() as u32).to_le_bytes());
        note_segment.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        note_segment.extend_from_slice(&1u32.to_le_bytes()); // n_type = Image
        note_segment.extend_from_slice(name);
        while note_segment.len() % 4 != 0 {
            note_segment.push(0);
        }
        note_segment.extend_from_slice(&desc);
        while note_segment.len() % 4 != 0 {
            note_segment.push(0);
        }

        header.resize(note_off + note_segment.len(), 0);
        header[note_off..].copy_from_slice(&note_segment);

        let mut phdr = vec![0u8; 56];
        phdr[0..4].copy_from_slice(&PT_NOTE.to_le_bytes());
        phdr[8..16].copy_from_slice(&(note_off as u64).to_le_bytes()); // offset
        phdr[32..40].copy_from_slice(&(note_segment.len() as u64).to_le_bytes()); // filesz
        header[phdr_off..phdr_off + 56].copy_from_slice(&phdr);

        let elf_header = parse_header(&header).unwrap();
        let phdrs = parse_program_headers(&header, &elf_header).unwrap();
        assert_eq!(phdrs.len(), 1);

        let mut seen = Vec::new();
        iterate_notes(&header, &phdrs, |note| {
            seen.push((note.name.to_vec(), note.n_type, note.desc.to_vec()));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, b"KBoot\0");
        assert_eq!(seen[0].1, 1);
        assert_eq!(seen[0].2, desc);
    }
}
