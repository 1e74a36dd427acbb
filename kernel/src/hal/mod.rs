// =============================================================================
// Tern OS - Hardware Abstraction
// =============================================================================
// The seams between bring-up logic and the machine. `arm64` implements them
// for real hardware; the unit tests implement them over a simulated bus.
// =============================================================================

#[cfg(target_os = "none")]
pub mod arm64;

/// A physical address.
pub type PhysAddr = u64;

/// Volatile access to physical addresses.
///
/// Covers device registers and DMA-visible memory alike: both are
/// identity mapped during bring-up, and both must be touched with volatile,
/// little-endian accesses of exactly the requested width.
pub trait Mmio {
    fn read8(&self, addr: PhysAddr) -> u8;
    fn read16(&self, addr: PhysAddr) -> u16;
    fn read32(&self, addr: PhysAddr) -> u32;
    fn read64(&self, addr: PhysAddr) -> u64;

    fn write8(&self, addr: PhysAddr, value: u8);
    fn write16(&self, addr: PhysAddr, value: u16);
    fn write32(&self, addr: PhysAddr, value: u32);
    fn write64(&self, addr: PhysAddr, value: u64);

    /// Every store issued so far is visible to devices before any later access.
    fn write_barrier(&self);

    /// Every load issued after this observes device writes completed before it.
    fn read_barrier(&self);

    /// Write `len` zero bytes starting at `addr`.
    fn zero(&self, addr: PhysAddr, len: usize) {
        let mut offset = 0;
        while offset + 8 <= len {
            self.write64(addr + offset as u64, 0);
            offset += 8;
        }
        while offset < len {
            self.write8(addr + offset as u64, 0);
            offset += 1;
        }
    }
}

/// The physical memory allocator bring-up draws from (`kmalloc_aligned`).
pub trait PhysAllocator {
    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// Returns `None` when no such block exists.
    fn allocate(&mut self, size: usize, align: usize) -> Option<PhysAddr>;

    /// Return a block obtained from `allocate`.
    fn free(&mut self, addr: PhysAddr, size: usize, align: usize);
}

/// Values loaded into the translation system registers when the MMU is
/// switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationRegisters {
    pub mair: u64,
    pub tcr: u64,
    pub ttbr0: u64,
}

/// TLB and cache maintenance plus the translation-enable sequence.
pub trait TranslationRegime {
    /// Broadcast invalidation of all EL1 TLB entries (inner shareable).
    fn invalidate_tlb_all(&self);

    /// Invalidate the whole instruction cache.
    fn invalidate_icache_all(&self);

    /// Make descriptor stores visible to the table walker.
    fn table_barrier(&self);

    /// Load the registers and set SCTLR_EL1.M.
    ///
    /// # Safety
    /// The root table referenced by `regs.ttbr0` must identity map the
    /// running code, stack and every device accessed afterwards.
    unsafe fn enable(&self, regs: &TranslationRegisters);

    /// Whether translation reads back as enabled.
    fn is_enabled(&self) -> bool;
}
