// =============================================================================
// Tern OS - xHCI Host Controller Bring-up
// =============================================================================
// Takes QEMU's xHCI from "found on the bus" to "running, ports readable":
//
//   1. locate, back the BARs, enable decoding and bus mastering
//   2. wait for Controller Not Ready to clear
//   3. enable every device slot
//   4. DCBAA (+ scratchpads)
//   5. command ring
//   6. event ring and interrupter 0
//   7. Run/Stop, wait for Halted to clear
//   8. unmask INTx
//
// Slot enabling and transfer rings are not handled here.
// =============================================================================

pub mod context;
pub mod regs;
pub mod ring;

use context::Dcbaa;
use regs::{Capabilities, RegisterWindows};
use ring::{CommandRing, EventRing};

use super::pci::{self, AssignedBar, BarKind, PciFunction};
use crate::config::Window;
use crate::context::BootContext;
use crate::error::{BringupError, WaitFor};
use crate::hal::{Mmio, PhysAllocator, TranslationRegime};
use crate::mm::{MemoryAttr, Privilege, PAGE_SIZE};
use crate::wait::spin_until;

/// QEMU's `qemu-xhci` device.
pub const XHCI_VENDOR_ID: u16 = 0x1b36;
pub const XHCI_DEVICE_ID: u16 = 0x000d;

/// A running controller and the memory it owns.
#[derive(Debug)]
pub struct XhciController {
    pub function: PciFunction,
    pub bar0: AssignedBar,
    pub bar1: Option<AssignedBar>,
    pub caps: Capabilities,
    pub windows: RegisterWindows,
    pub dcbaa: Dcbaa,
    pub command_ring: CommandRing,
    pub event_ring: EventRing,
}

impl XhciController {
    /// Ports that are connected and finished reset right now.
    pub fn poll_ports<M: Mmio>(&self, mmio: &M) -> u64 {
        regs::poll_ports(mmio, &self.windows, self.caps.max_ports)
    }
}

/// Bring up the first xHCI controller on the bus.
pub fn xhci_init<M, A, R>(ctx: &mut BootContext<M, A, R>) -> Result<XhciController, BringupError>
where
    M: Mmio,
    A: PhysAllocator,
    R: TranslationRegime,
{
    let function = pci::find_device(&ctx.mmio, &ctx.config, XHCI_VENDOR_ID, XHCI_DEVICE_ID)?;
    let base = function.base;

    let bar0 = pci::assign_bar(ctx, base, 0)?;
    let bar1 = if bar0.kind == BarKind::Memory32 {
        match pci::assign_bar(ctx, base, 1) {
            Ok(bar) => Some(bar),
            Err(BringupError::EmptyBar { .. }) => None,
            Err(err) => return Err(err),
        }
    } else {
        None
    };
    pci::enable_device(&ctx.mmio, base)?;
    for bar in core::iter::once(bar0).chain(bar1) {
        ctx.pages.map_window_pages(
            Window::new(bar.base, bar.base + bar.size),
            MemoryAttr::Device,
            Privilege::Kernel,
        );
    }

    let caps = Capabilities::read(&ctx.mmio, bar0.base);
    let windows = RegisterWindows::new(bar0.base, &caps);
    let op = windows.operational;
    log::debug!(
        "xHCI {:x}.{:02x}: {} slots, {} ports, op {:#x}, rt {:#x}, db {:#x}",
        caps.hci_version >> 8,
        caps.hci_version & 0xFF,
        caps.max_slots,
        caps.max_ports,
        op,
        windows.runtime,
        windows.doorbells
    );

    let budget = ctx.config.spin_budget;
    spin_until(budget, WaitFor::ControllerReady, || {
        ctx.mmio.read_barrier();
        ctx.mmio.read32(op + regs::USBSTS) & regs::USBSTS_NOT_READY == 0
    })?;

    if caps.max_slots == 0 {
        return Err(BringupError::NoDeviceSlots);
    }
    if caps.max_ports == 0 {
        return Err(BringupError::NoPorts);
    }
    let config = ctx.mmio.read32(op + regs::CONFIG);
    ctx.mmio.write32(
        op + regs::CONFIG,
        (config & !regs::CONFIG_MAX_SLOTS_EN) | u32::from(caps.max_slots),
    );

    let page_size = page_size(&ctx.mmio, op);
    let mut dcbaa = Dcbaa::new(ctx)?;
    dcbaa.install_scratchpads(ctx, caps.max_scratchpads, page_size)?;
    ctx.mmio.write64(op + regs::DCBAAP, dcbaa.base());

    let command_ring = CommandRing::new(ctx)?;
    ctx.mmio.write64(op + regs::CRCR, command_ring.crcr());

    let event_ring = EventRing::new(ctx)?;
    let irq = windows.interrupter(0);
    ctx.mmio.write32(irq + regs::IMOD, 0);
    ctx.mmio.write32(irq + regs::ERSTSZ, 1);
    ctx.mmio.write64(irq + regs::ERDP, event_ring.dequeue_pointer());
    ctx.mmio.write64(irq + regs::ERSTBA, event_ring.segment_table());
    let iman = ctx.mmio.read32(irq + regs::IMAN);
    ctx.mmio.write32(irq + regs::IMAN, iman | regs::IMAN_IP_IE);
    ctx.mmio.write_barrier();

    let usbcmd = ctx.mmio.read32(op + regs::USBCMD);
    ctx.mmio.write32(op + regs::USBCMD, usbcmd | regs::USBCMD_RUN | regs::USBCMD_INTE);
    spin_until(budget, WaitFor::ControllerRunning, || {
        ctx.mmio.read_barrier();
        ctx.mmio.read32(op + regs::USBSTS) & regs::USBSTS_HALTED == 0
    })?;

    pci::set_interrupt_disable(&ctx.mmio, base, false);
    log::info!("xHCI running at {:#x}", bar0.base);

    Ok(XhciController {
        function,
        bar0,
        bar1,
        caps,
        windows,
        dcbaa,
        command_ring,
        event_ring,
    })
}

/// Smallest page size the controller supports (PAGESIZE bit n = 2^(n+12)).
fn page_size<M: Mmio>(mmio: &M, op: u64) -> usize {
    match mmio.read32(op + regs::PAGESIZE) & 0xFFFF {
        0 => PAGE_SIZE as usize,
        bits => 1 << (bits.trailing_zeros() + 12),
    }
}
