// =============================================================================
// Tern OS - PL011 UART Driver
// =============================================================================
// Transmit-only driver for the ARM PL011 UART at QEMU virt's UART0. Backs the
// print macros and the kernel logger.
//
// Reference: ARM PrimeCell UART (PL011) Technical Reference Manual
// =============================================================================

use core::fmt::{self, Write};
use spin::Mutex;

/// Base address of UART0 on QEMU virt machine
pub const UART0_BASE: usize = 0x0900_0000;

/// UART Register Offsets from base address
mod regs {
    /// Data Register
    pub const DR: usize = 0x00;
    /// Flag Register
    pub const FR: usize = 0x18;
    /// Integer Baud Rate Register
    pub const IBRD: usize = 0x24;
    /// Fractional Baud Rate Register
    pub const FBRD: usize = 0x28;
    /// Line Control Register
    pub const LCR_H: usize = 0x2C;
    /// Control Register
    pub const CR: usize = 0x30;
    /// Interrupt Mask Set/Clear Register
    pub const IMSC: usize = 0x38;
    /// Interrupt Clear Register
    pub const ICR: usize = 0x44;
}

/// Flag Register: transmit FIFO full
const FR_TXFF: u32 = 1 << 5;

/// Line Control: FIFOs on, 8-bit words
const LCR_FEN: u32 = 1 << 4;
const LCR_WLEN_8: u32 = 0b11 << 5;

/// Control: UART and transmitter enable
const CR_UARTEN: u32 = 1 << 0;
const CR_TXE: u32 = 1 << 8;

/// PL011 UART driver
pub struct Uart {
    base: usize,
}

impl Uart {
    /// Create a driver for the PL011 at `base`.
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // SAFETY: self.base is the PL011 window, identity mapped as device memory
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        // SAFETY: self.base is the PL011 window, identity mapped as device memory
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    /// Configure 8-N-1 with FIFOs, interrupts masked.
    pub fn init(&self) {
        self.write_reg(regs::CR, 0);
        self.write_reg(regs::IMSC, 0);
        self.write_reg(regs::ICR, 0x7FF);

        // 115200 baud from a 24MHz reference clock
        self.write_reg(regs::IBRD, 13);
        self.write_reg(regs::FBRD, 1);

        self.write_reg(regs::LCR_H, LCR_WLEN_8 | LCR_FEN);
        self.write_reg(regs::CR, CR_UARTEN | CR_TXE);
    }

    /// Transmit a single byte, waiting for FIFO space.
    pub fn putc(&self, c: u8) {
        while self.read_reg(regs::FR) & FR_TXFF != 0 {
            core::hint::spin_loop();
        }
        self.write_reg(regs::DR, c as u32);
    }

    /// Transmit a string, expanding `\n` to CRLF.
    pub fn puts(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.puts(s);
        Ok(())
    }
}

static UART: Mutex<Uart> = Mutex::new(Uart::new(UART0_BASE));

/// Initialize the global UART.
pub fn init() {
    UART.lock().init();
}

/// Print a formatted string to the UART.
pub fn _print(args: fmt::Arguments) {
    // Writing to the UART cannot fail
    let _ = UART.lock().write_fmt(args);
}

/// Print to the kernel console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::uart::_print(format_args!($($arg)*))
    };
}

/// Print to the kernel console with a newline.
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}
