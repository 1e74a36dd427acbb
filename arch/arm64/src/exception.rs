// =============================================================================
// Tern OS - Exception Handling (Rust)
// =============================================================================
// The vector table in exception.S routes every exception here. Nothing is
// resumed during bring-up: the handler reports and halts.
// =============================================================================

use crate::{cpu, println};

/// Point VBAR_EL1 at the vector table.
///
/// # Safety
/// Must only be called at EL1 during boot.
pub unsafe fn init() {
    extern "C" {
        static exception_vector_table: u8;
    }

    let vector_addr = core::ptr::addr_of!(exception_vector_table) as u64;
    core::arch::asm!("msr vbar_el1, {}", "isb", in(reg) vector_addr);
}

/// Names of the sixteen vector slots, in table order.
const VECTOR_NAMES: [&str; 16] = [
    "sync (EL1t)", "irq (EL1t)", "fiq (EL1t)", "serror (EL1t)",
    "sync (EL1h)", "irq (EL1h)", "fiq (EL1h)", "serror (EL1h)",
    "sync (EL0, a64)", "irq (EL0, a64)", "fiq (EL0, a64)", "serror (EL0, a64)",
    "sync (EL0, a32)", "irq (EL0, a32)", "fiq (EL0, a32)", "serror (EL0, a32)",
];

#[no_mangle]
pub extern "C" fn handle_unexpected_exception(index: u64, esr: u64, elr: u64, far: u64) -> ! {
    cpu::disable_interrupts();
    let name = VECTOR_NAMES.get(index as usize).copied().unwrap_or("unknown");

    println!();
    println!("!!! UNEXPECTED EXCEPTION: {} !!!", name);
    println!("ESR_EL1: {:#018x} (EC {:#x})", esr, (esr >> 26) & 0x3F);
    println!("ELR_EL1: {:#018x}", elr);
    println!("FAR_EL1: {:#018x}", far);
    println!("System halted.");

    cpu::halt()
}
