//! Image tags (ITags): the kernel's ELF notes decoded into typed data (§3,
//! §4.8(b)).
//!
//! A note's descriptor bytes use the same little-endian, naturally-aligned
//! layout the kernel will see again in its information-tag list (§6: "Note
//! descriptor layout mirrors the on-disk layout the kernel will later see"),
//! so the `decode_*` functions here are the mirror image of the `option_*`/
//! `mapping`-style emitters in [`super::tags`].

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::ImageError;

/// One parsed image tag, kept as `(type, owned descriptor bytes)` in the
/// order notes were encountered (§3: "Each ITag is stored as (type,
/// copy-of-descriptor) in an order-preserving list").
#[derive(Debug, Clone)]
pub struct ITag {
    pub kind: ITagKind,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ITagKind {
    Image,
    Load,
    Video,
    Option,
    Mapping,
}

impl ITagKind {
    #[must_use]
    pub fn from_note_type(n_type: u32) -> Option<Self> {
        match n_type {
            1 => Some(ITagKind::Image),
            2 => Some(ITagKind::Load),
            3 => Some(ITagKind::Video),
            4 => Some(ITagKind::Option),
            5 => Some(ITagKind::Mapping),
            _ => None,
        }
    }

    /// Whether more than one note of this kind is permitted (§4.8(b)):
    /// `Option` and `Mapping` may repeat, `Image`/`Load`/`Video` may not.
    #[must_use]
    pub fn allows_duplicates(self) -> bool {
        matches!(self, ITagKind::Option | ITagKind::Mapping)
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, ImageError> {
    data.get(offset..offset + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        .ok_or(ImageError::MalformedImage)
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, ImageError> {
    data.get(offset..offset + 8)
        .map(|s| u64::from_le_bytes(s.try_into().unwrap()))
        .ok_or(ImageError::MalformedImage)
}

/// Flag bit in [`ImageTag::flags`] requesting that ELF section headers also
/// be loaded (§4.8(i)).
pub const IMAGE_FLAG_SECTIONS: u32 = 1 << 0;
/// Flag bit requesting that `p_paddr` be honored as the kernel's physical
/// load address instead of letting the loader choose one (§4.8(e)).
pub const IMAGE_FLAG_FIXED: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTag {
    pub version: u32,
    pub flags: u32,
}

pub fn decode_image(data: &[u8]) -> Result<ImageTag, ImageError> {
    Ok(ImageTag {
        version: read_u32(data, 0)?,
        flags: read_u32(data, 4)?,
    })
}

/// Validated (or arch-defaulted) load constraints (§3, §4.8(c)). Referenced
/// from [`crate::arch::ArchHooks::check_load_params`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadParams {
    pub alignment: u64,
    pub min_alignment: u64,
    pub virt_map_base: u64,
    pub virt_map_size: u64,
}

pub fn decode_load(data: &[u8]) -> Result<LoadParams, ImageError> {
    Ok(LoadParams {
        alignment: read_u64(data, 0)?,
        min_alignment: read_u64(data, 8)?,
        virt_map_base: read_u64(data, 16)?,
        virt_map_size: read_u64(data, 24)?,
    })
}

/// Which physical memory the kernel's framebuffer/VGA tag refers to
/// (§4.8(m)). Selection and mode-setting themselves are arch/video-driver
/// external collaborators; this crate only records the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTag {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

pub fn decode_video(data: &[u8]) -> Result<VideoTag, ImageError> {
    Ok(VideoTag {
        width: read_u32(data, 0)?,
        height: read_u32(data, 4)?,
        depth: read_u32(data, 8)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Boolean,
    String,
    Integer,
}

/// A declared configuration option: the kernel asks for a named value of a
/// given type with a default; the loader resolves it from the environment
/// and emits a `KBOOT_TAG_OPTION` record (§4.8(n)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionTag {
    pub name: String,
    pub description: String,
    pub kind: OptionKind,
}

/// Layout: `kind:u8, _pad:[u8;3], name_len:u32, desc_len:u32`, then `name_len`
/// bytes of name, then `desc_len` bytes of description.
pub fn decode_option(data: &[u8]) -> Result<OptionTag, ImageError> {
    let kind = match *data.first().ok_or(ImageError::MalformedImage)? {
        0 => OptionKind::Boolean,
        1 => OptionKind::String,
        2 => OptionKind::Integer,
        _ => return Err(ImageError::MalformedImage),
    };
    let name_len = read_u32(data, 4)? as usize;
    let desc_len = read_u32(data, 8)? as usize;
    let name_start = 12;
    let name_end = name_start.checked_add(name_len).ok_or(ImageError::MalformedImage)?;
    let desc_end = name_end.checked_add(desc_len).ok_or(ImageError::MalformedImage)?;
    let name_bytes = data.get(name_start..name_end).ok_or(ImageError::MalformedImage)?;
    let desc_bytes = data.get(name_end..desc_end).ok_or(ImageError::MalformedImage)?;
    Ok(OptionTag {
        name: String::from_utf8_lossy(name_bytes).into_owned(),
        description: String::from_utf8_lossy(desc_bytes).into_owned(),
        kind,
    })
}

/// Sentinel `virt` value meaning "let the loader choose an address"
/// (§4.8(f)).
pub const MAPPING_VIRT_ANY: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingTag {
    pub virt: u64,
    pub phys: u64,
    pub size: u64,
}

pub fn decode_mapping(data: &[u8]) -> Result<MappingTag, ImageError> {
    Ok(MappingTag {
        virt: read_u64(data, 0)?,
        phys: read_u64(data, 8)?,
        size: read_u64(data, 16)?,
    })
}
