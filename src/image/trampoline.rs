//! Stage (l): the identity-mapped hand-off between the loader's own address
//! space and the kernel's.
//!
//! Identity-mapping the loader itself is not always possible once the
//! kernel has claimed that range, so a *temporary* scratch MMU context
//! identity-maps the loader's running text/data plus a freshly allocated
//! trampoline page; the same physical trampoline page is also mapped into
//! the kernel's own address space at a slot the virtual allocator chooses.
//! Every page table page the scratch context's [`MmuContext::map`] allocates
//! must come from `phys_map` tagged [`MemKind::Internal`] so it never shows
//! up in the kernel's final memory map.

use crate::arch::{ArchHooks, MapFlags, MmuContext};
use crate::error::{ImageError, MemoryError};
use crate::mem::{AllocFlags, MemKind, MemoryMap, PhysAddr, RangeAllocator, VirtAddr, PAGE_SIZE};

/// The loader's own identity-mapped footprint, known to the firmware/arch
/// glue that loaded this crate in the first place.
#[derive(Debug, Clone, Copy)]
pub struct LoaderFootprint {
    pub phys_start: PhysAddr,
    pub size: u64,
}

/// Everything [`crate::arch::ArchHooks::enter`] needs, computed here.
pub struct TrampolineHandoff<M> {
    pub scratch_mmu: M,
    pub trampoline_virt: VirtAddr,
}

/// Builds the scratch context and trampoline mapping (§4.8(l)).
///
/// # Errors
///
/// [`ImageError::Memory`] if no physical page remains for the trampoline or
/// its page tables; propagates whatever `kernel_alloc`/`kernel_mmu` report
/// if the kernel-side trampoline slot can't be reserved.
pub fn build<A: ArchHooks>(
    arch: &A,
    phys_map: &mut MemoryMap,
    kernel_alloc: &mut RangeAllocator,
    kernel_mmu: &mut A::Mmu,
    loader: LoaderFootprint,
) -> Result<TrampolineHandoff<A::Mmu>, ImageError> {
    let trampoline_phys = phys_map.alloc(PAGE_SIZE, PAGE_SIZE, None, None, MemKind::Reclaimable, AllocFlags::NONE)?;

    let mut scratch = arch.new_scratch_context()?;
    scratch.map(
        VirtAddr::new(loader.phys_start.as_u64()),
        loader.phys_start,
        loader.size,
        MapFlags::RX,
    )?;
    scratch.map(
        VirtAddr::new(trampoline_phys.as_u64()),
        trampoline_phys,
        PAGE_SIZE,
        MapFlags::RX,
    )?;

    let kernel_slot = kernel_alloc
        .alloc(PAGE_SIZE, PAGE_SIZE)
        .ok_or(ImageError::from(MemoryError::NoMemory))?;
    let trampoline_virt = VirtAddr::new(kernel_slot);
    kernel_mmu.map(trampoline_virt, trampoline_phys, PAGE_SIZE, MapFlags::RX)?;

    Ok(TrampolineHandoff {
        scratch_mmu: scratch,
        trampoline_virt,
    })
}
