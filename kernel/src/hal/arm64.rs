// =============================================================================
// Tern OS - ARM64 HAL
// =============================================================================
// Real-hardware implementations of the `hal` traits.
// =============================================================================

use core::ptr;

use tern_arch_arm64::{cpu, mmu};

use super::{Mmio, PhysAddr, TranslationRegime, TranslationRegisters};

/// Identity-mapped physical memory, accessed with volatile loads and stores.
pub struct PhysMmio;

impl Mmio for PhysMmio {
    fn read8(&self, addr: PhysAddr) -> u8 {
        // SAFETY: bring-up only hands out addresses it has mapped
        unsafe { ptr::read_volatile(addr as *const u8) }
    }

    fn read16(&self, addr: PhysAddr) -> u16 {
        // SAFETY: as above
        unsafe { ptr::read_volatile(addr as *const u16) }
    }

    fn read32(&self, addr: PhysAddr) -> u32 {
        // SAFETY: as above
        unsafe { ptr::read_volatile(addr as *const u32) }
    }

    fn read64(&self, addr: PhysAddr) -> u64 {
        // SAFETY: as above
        unsafe { ptr::read_volatile(addr as *const u64) }
    }

    fn write8(&self, addr: PhysAddr, value: u8) {
        // SAFETY: as above
        unsafe { ptr::write_volatile(addr as *mut u8, value) }
    }

    fn write16(&self, addr: PhysAddr, value: u16) {
        // SAFETY: as above
        unsafe { ptr::write_volatile(addr as *mut u16, value) }
    }

    fn write32(&self, addr: PhysAddr, value: u32) {
        // SAFETY: as above
        unsafe { ptr::write_volatile(addr as *mut u32, value) }
    }

    fn write64(&self, addr: PhysAddr, value: u64) {
        // SAFETY: as above
        unsafe { ptr::write_volatile(addr as *mut u64, value) }
    }

    fn write_barrier(&self) {
        cpu::dsb_st();
    }

    fn read_barrier(&self) {
        cpu::dsb_ld();
    }
}

/// The EL1 stage 1 translation regime of the boot core.
pub struct El1Regime;

impl TranslationRegime for El1Regime {
    fn invalidate_tlb_all(&self) {
        mmu::invalidate_tlb_all();
    }

    fn invalidate_icache_all(&self) {
        cpu::flush_instruction_cache();
    }

    fn table_barrier(&self) {
        mmu::sync_tables();
    }

    unsafe fn enable(&self, regs: &TranslationRegisters) {
        mmu::enable(regs.mair, regs.tcr, regs.ttbr0);
    }

    fn is_enabled(&self) -> bool {
        mmu::is_enabled()
    }
}
