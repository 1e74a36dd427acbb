// =============================================================================
// Tern OS - ARM64 Architecture Module
// =============================================================================
// This module contains all ARM64-specific code:
// - UART console and the kernel logger
// - CPU utilities (halt, barriers, cache maintenance)
// - MMU system registers and TLB maintenance
// - Exception vector installation
//
// Nothing here builds for a host target; the kernel library reaches these
// routines only through its hardware traits.
//
// SPDX-License-Identifier: GPL-2.0
// =============================================================================

#![cfg_attr(not(test), no_std)]
#![cfg(target_arch = "aarch64")]

pub mod uart;
pub mod logger;
pub mod cpu;
pub mod exception;
pub mod mmu;

/// Bring up the console and exception vectors.
///
/// Called first thing in `kernel_main`, before any bring-up code logs.
///
/// # Safety
/// Must only be called once, on the boot core, with the MMU still off.
pub unsafe fn init(level: log::LevelFilter) {
    // 1. UART (for debug output)
    uart::init();

    // 2. Logger on top of the UART
    logger::install(level);

    // 3. Exception vectors (every entry halts)
    exception::init();
}

/// Bounds `[start, end)` of the linked kernel image, boot stack included.
pub fn image_bounds() -> (u64, u64) {
    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }

    // SAFETY: linker-defined symbols; only their addresses are taken
    unsafe {
        (
            core::ptr::addr_of!(__kernel_start) as u64,
            core::ptr::addr_of!(__kernel_end) as u64,
        )
    }
}
