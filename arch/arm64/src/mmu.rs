// =============================================================================
// Tern OS - Memory Management Unit (MMU)
// =============================================================================
// System-register side of address translation. Table construction lives in
// the kernel (`mm::paging`); this module only loads the result into the CPU
// and performs TLB maintenance.
// =============================================================================

use core::arch::asm;

/// SCTLR_EL1.M: stage 1 translation enable
const SCTLR_M: u64 = 1 << 0;

/// Load MAIR_EL1, TCR_EL1 and TTBR0_EL1, then turn translation on.
///
/// # Safety
/// `ttbr0` must point at a complete root table that identity maps the
/// currently executing code, its stack and every device it touches next.
pub unsafe fn enable(mair: u64, tcr: u64, ttbr0: u64) {
    asm!("msr mair_el1, {}", in(reg) mair);
    asm!("msr tcr_el1, {}", in(reg) tcr);

    // Table writes must be visible to the walker before it starts
    asm!("dsb ish", "isb");
    asm!("msr ttbr0_el1, {}", in(reg) ttbr0);
    invalidate_tlb_all();

    let mut sctlr: u64;
    asm!("mrs {}, sctlr_el1", out(reg) sctlr);
    sctlr |= SCTLR_M;
    asm!("msr sctlr_el1, {}", in(reg) sctlr);
    asm!("isb");
}

/// Whether SCTLR_EL1.M reads back as set.
pub fn is_enabled() -> bool {
    let sctlr: u64;
    // SAFETY: reading SCTLR_EL1 has no side effects
    unsafe { asm!("mrs {}, sctlr_el1", out(reg) sctlr) };
    sctlr & SCTLR_M != 0
}

/// Invalidate every EL1 stage 1 TLB entry on all cores in the inner
/// shareable domain.
#[inline(always)]
pub fn invalidate_tlb_all() {
    // SAFETY: TLB invalidation only drops cached translations
    unsafe { asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb", options(nostack)) };
}

/// Publish translation table stores to the walker.
#[inline(always)]
pub fn sync_tables() {
    // SAFETY: barriers have no side effects beyond ordering
    unsafe { asm!("dsb ishst", "isb", options(nostack, preserves_flags)) };
}
