// =============================================================================
// Tern OS - CPU Utilities
// =============================================================================
// ARM64 control, barrier and cache maintenance helpers.
// =============================================================================

use core::arch::asm;

/// Halt the CPU in a low-power state. Never returns.
#[inline(always)]
pub fn halt() -> ! {
    loop {
        // SAFETY: WFE only waits for an event
        unsafe { asm!("wfe") };
    }
}

/// Mask IRQs at the CPU.
#[inline(always)]
pub fn disable_interrupts() {
    // SAFETY: setting DAIF.I only masks interrupts
    unsafe { asm!("msr daifset, #2") };
}

/// Get the current exception level (0-3).
#[inline(always)]
pub fn current_el() -> u8 {
    let el: u64;
    // SAFETY: CurrentEL is readable at EL1
    unsafe { asm!("mrs {}, CurrentEL", out(reg) el) };
    ((el >> 2) & 0x3) as u8
}

/// Store barrier: all prior stores complete before any later access.
#[inline(always)]
pub fn dsb_st() {
    // SAFETY: barriers have no side effects beyond ordering
    unsafe { asm!("dsb st", options(nostack, preserves_flags)) };
}

/// Load barrier: all prior loads complete before any later access.
#[inline(always)]
pub fn dsb_ld() {
    // SAFETY: barriers have no side effects beyond ordering
    unsafe { asm!("dsb ld", options(nostack, preserves_flags)) };
}

/// Invalidate the whole instruction cache to the point of unification.
#[inline(always)]
pub fn flush_instruction_cache() {
    // SAFETY: invalidating the I-cache is always architecturally safe
    unsafe { asm!("dsb ish", "ic iallu", "dsb ish", "isb", options(nostack)) };
}
