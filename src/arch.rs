//! Contracts toward the architecture- and firmware-specific collaborators.
//!
//! Everything in this module is a trait: CPU feature checks, MMU context
//! construction, the trampoline jump, and the firmware pre-boot hook are
//! all implemented outside this crate (per the design's explicit
//! non-goals). [`crate::image`] only ever talks to these contracts.

use crate::error::{ImageError, MemoryError};
use crate::mem::{PhysAddr, VirtAddr};

/// Memory protection requested for a single mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFlags {
    pub writable: bool,
    pub executable: bool,
}

impl MapFlags {
    pub const RX: Self = Self {
        writable: false,
        executable: true,
    };
    pub const RW: Self = Self {
        writable: true,
        executable: false,
    };
    pub const RO: Self = Self {
        writable: false,
        executable: false,
    };
}

/// An architecture-independent virtual address space under construction.
///
/// A concrete implementation owns the real page tables (x86-64 4/5-level
/// paging, AArch64 stage-1 tables, RISC-V Sv39/Sv48, ...); this crate never
/// reads or writes a page table entry itself. Every page table page the
/// implementation allocates while servicing [`map`](MmuContext::map) must
/// come from the physical allocator tagged [`crate::mem::MemKind::Pagetables`]
/// (or, for the trampoline's scratch context, [`crate::mem::MemKind::Internal`]),
/// so it shows up correctly in the final memory map.
pub trait MmuContext {
    /// Maps `size` bytes of `phys` at `virt` with the given protection.
    fn map(&mut self, virt: VirtAddr, phys: PhysAddr, size: u64, flags: MapFlags)
        -> Result<(), ImageError>;
}

/// CPU-feature preflight, run before any image parsing begins.
///
/// Implementations check things like long-mode support, required CPUID
/// leaves, or SoC-specific errata workarounds.
pub trait ArchHooks {
    type Mmu: MmuContext;

    /// Validates that the current CPU can run a kernel at all. Called
    /// first, before the image is even opened.
    fn check_kernel(&self) -> Result<(), ImageError>;

    /// Fills in architecture-specific defaults in a [`crate::image::LoadParams`]
    /// that the `Load` image tag left unset.
    fn check_load_params(&self, params: &mut crate::image::itag::LoadParams);

    /// Creates a fresh, empty virtual address space for the kernel.
    fn new_mmu_context(&self) -> Result<Self::Mmu, MemoryError>;

    /// Creates a second, temporary address space used only across the
    /// trampoline jump (see [`crate::image::trampoline`]).
    fn new_scratch_context(&self) -> Result<Self::Mmu, MemoryError>;

    /// Gives architecture code a chance to add its own mappings (e.g. an
    /// exception-vector page) before the tag list is emitted.
    fn setup(&self, mmu: &mut Self::Mmu) -> Result<(), ImageError>;

    /// Writes the position-independent trampoline code into `page` and
    /// performs the final jump: switch to `kernel_mmu`, transfer control to
    /// `entry`. Diverges; nothing may run after this on the loader's side.
    ///
    /// `scratch_mmu` identity-maps the loader and the trampoline page; it
    /// is active right up until the jump, at which point execution
    /// continues inside `kernel_mmu`.
    fn enter(
        &self,
        scratch_mmu: Self::Mmu,
        kernel_mmu: Self::Mmu,
        trampoline_page: VirtAddr,
        entry: VirtAddr,
    ) -> !;
}

/// The last thing the loader calls before `ArchHooks::enter`. On UEFI this
/// is where `ExitBootServices` happens; no I/O may occur after it returns.
pub trait PreBootHook {
    fn run(&self);
}
