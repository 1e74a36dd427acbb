// =============================================================================
// Tern OS - Machine Configuration
// =============================================================================
// Memory map of QEMU's virt machine and the tunables of the bring-up code.
// =============================================================================

/// RAM base on QEMU virt.
pub const RAM_START: u64 = 0x4000_0000;

/// End of the kernel code/data range mapped with 2 MiB blocks (exclusive).
pub const KERNEL_END: u64 = 0x5000_0000;

/// PL011 UART0.
pub const UART_BASE: u64 = 0x0900_0000;

/// QEMU fw_cfg device; the DMA address register sits at +0x10.
pub const FW_CFG_BASE: u64 = 0x0902_0000;
pub const FW_CFG_DMA: u64 = FW_CFG_BASE + 0x10;

/// High PCIe ECAM window (256 buses, 1 MiB each).
pub const PCIE_ECAM_BASE: u64 = 0x40_1000_0000;
pub const PCIE_ECAM_SIZE: u64 = 0x1000_0000;

/// Kernel heap: 16 MiB at the 16 MiB mark of RAM.
pub const HEAP_START: usize = 0x4100_0000;
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Default iteration budget of every hardware spin-wait.
pub const DEFAULT_SPIN_BUDGET: u32 = 1_000_000;

/// Upper bound on PCI capability list nodes; a 256-byte config space cannot
/// hold more than 48 dword-aligned capabilities past the header.
pub const MAX_CAPABILITIES: usize = 48;

/// A half-open physical address window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: u64,
    pub end: u64,
}

impl Window {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// What `PageTableManager::init` maps before enabling translation.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    /// Kernel image, heap and BAR backing memory; 2 MiB normal blocks.
    pub kernel: Window,
    /// Console window; 4 KiB device pages.
    pub uart: Window,
    /// Further device windows mapped with 2 MiB device blocks.
    pub device_blocks: &'static [Window],
}

static QEMU_DEVICE_BLOCKS: [Window; 1] =
    [Window::new(PCIE_ECAM_BASE, PCIE_ECAM_BASE + PCIE_ECAM_SIZE)];

impl MemoryLayout {
    /// QEMU virt: 256 MiB of kernel RAM, the page before UART0 through the
    /// following MiB (which also covers fw_cfg), and the ECAM.
    pub const fn qemu_virt() -> Self {
        Self {
            kernel: Window::new(RAM_START, KERNEL_END),
            uart: Window::new(UART_BASE - 0x1000, UART_BASE + 0x10_1000),
            device_blocks: &QEMU_DEVICE_BLOCKS,
        }
    }

    /// Whether the linked image `[start, end)` sits inside the block-mapped
    /// kernel window.
    pub const fn covers_image(&self, image: Window) -> bool {
        !image.is_empty() && self.kernel.contains(image.start) && image.end <= self.kernel.end
    }
}

/// Tunables threaded through bring-up.
#[derive(Debug, Clone, Copy)]
pub struct BringupConfig {
    /// Iterations before a hardware wait reports a timeout.
    pub spin_budget: u32,
    /// Base of the ECAM configuration window.
    pub ecam_base: u64,
    /// Number of buses the ECAM window decodes.
    pub ecam_buses: u16,
    /// Capability-list walk bound.
    pub capability_limit: usize,
    pub layout: MemoryLayout,
}

impl BringupConfig {
    pub const fn qemu_virt() -> Self {
        Self {
            spin_budget: DEFAULT_SPIN_BUDGET,
            ecam_base: PCIE_ECAM_BASE,
            ecam_buses: (PCIE_ECAM_SIZE >> 20) as u16,
            capability_limit: MAX_CAPABILITIES,
            layout: MemoryLayout::qemu_virt(),
        }
    }
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self::qemu_virt()
    }
}
