// =============================================================================
// Tern OS - PCI Configuration Space
// =============================================================================
// ECAM access, function discovery and BAR sizing/assignment.
//
// There is no firmware-assigned resource map on this platform: every BAR a
// driver needs is sized here, backed with allocator memory of the same size
// and alignment, and programmed with that address.
// =============================================================================

use bitflags::bitflags;

use crate::config::BringupConfig;
use crate::context::BootContext;
use crate::error::{BringupError, Resource};
use crate::hal::{Mmio, PhysAddr, PhysAllocator, TranslationRegime};

pub const VENDOR_ID: u16 = 0x00;
pub const DEVICE_ID: u16 = 0x02;
pub const COMMAND: u16 = 0x04;
pub const STATUS: u16 = 0x06;
pub const HEADER_TYPE: u16 = 0x0E;
pub const BAR0: u16 = 0x10;
pub const CAPABILITIES_POINTER: u16 = 0x34;

/// STATUS: a capability list hangs off CAPABILITIES_POINTER
const STATUS_CAPABILITIES_LIST: u16 = 1 << 4;

/// HEADER_TYPE: functions 1-7 may exist
const HEADER_MULTI_FUNCTION: u8 = 1 << 7;

bitflags! {
    /// The PCI command register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        const IO_SPACE = 1 << 0;
        const MEMORY_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const INTERRUPT_DISABLE = 1 << 10;
    }
}

/// Config-space address of `offset` in bus/device/function.
pub const fn ecam_address(ecam_base: u64, bus: u8, device: u8, function: u8, offset: u16) -> PhysAddr {
    ecam_base
        | (bus as u64) << 20
        | ((device & 0x1F) as u64) << 15
        | ((function & 0x7) as u64) << 12
        | (offset & 0xFFF) as u64
}

/// Offset of BAR `index` in the type 0 header.
pub const fn bar_offset(index: u8) -> u16 {
    BAR0 + 4 * index as u16
}

/// A located PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciFunction {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    /// Start of the function's 4 KiB configuration space
    pub base: PhysAddr,
    pub vendor_id: u16,
    pub device_id: u16,
}

/// Scan the ECAM window for the first function with the given ids.
pub fn find_device<M: Mmio>(
    mmio: &M,
    config: &BringupConfig,
    vendor_id: u16,
    device_id: u16,
) -> Result<PciFunction, BringupError> {
    for bus in 0..config.ecam_buses.min(256) {
        let bus = bus as u8;
        for device in 0..32 {
            for function in 0..8 {
                let base = ecam_address(config.ecam_base, bus, device, function, 0);
                let vendor = mmio.read16(base + VENDOR_ID as u64);
                if vendor == 0xFFFF || vendor == 0 {
                    if function == 0 {
                        break;
                    }
                    continue;
                }

                let id = mmio.read16(base + DEVICE_ID as u64);
                if vendor == vendor_id && id == device_id {
                    log::debug!(
                        "pci {:02x}:{:02x}.{} is {:04x}:{:04x}",
                        bus, device, function, vendor, id
                    );
                    return Ok(PciFunction {
                        bus,
                        device,
                        function,
                        base,
                        vendor_id: vendor,
                        device_id: id,
                    });
                }

                let header = mmio.read8(base + HEADER_TYPE as u64);
                if function == 0 && header & HEADER_MULTI_FUNCTION == 0 {
                    break;
                }
            }
        }
    }
    Err(BringupError::DeviceNotFound {
        vendor: vendor_id,
        device: device_id,
    })
}

/// Address decoder type of a BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    Io,
    Memory32,
    /// Consumes this BAR and the next one as the upper dword
    Memory64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInfo {
    pub size: u64,
    pub kind: BarKind,
    pub prefetchable: bool,
}

/// Size a BAR by writing all-ones and reading back the decoder mask.
///
/// Destroys the BAR's previous contents; reprogram it afterwards.
pub fn probe_bar<M: Mmio>(mmio: &M, function_base: PhysAddr, bar_offset: u16) -> BarInfo {
    let reg = function_base + bar_offset as u64;
    mmio.write32(reg, 0xFFFF_FFFF);
    let low = mmio.read32(reg);

    if low & 0x1 != 0 {
        let size = (!(low & !0x3)).wrapping_add(1) & 0xFFFF;
        return BarInfo {
            size: size.into(),
            kind: BarKind::Io,
            prefetchable: false,
        };
    }

    let prefetchable = low & (1 << 3) != 0;
    if (low >> 1) & 0b11 == 0b10 {
        mmio.write32(reg + 4, 0xFFFF_FFFF);
        let high = mmio.read32(reg + 4);
        let mask = (u64::from(high) << 32) | u64::from(low & !0xF);
        BarInfo {
            size: (!mask).wrapping_add(1),
            kind: BarKind::Memory64,
            prefetchable,
        }
    } else {
        BarInfo {
            size: (!(low & !0xF)).wrapping_add(1).into(),
            kind: BarKind::Memory32,
            prefetchable,
        }
    }
}

/// Bytes decoded by the BAR at `bar_offset`; 0 if it decodes nothing.
pub fn size_bar<M: Mmio>(mmio: &M, function_base: PhysAddr, bar_offset: u16) -> u64 {
    probe_bar(mmio, function_base, bar_offset).size
}

fn program_bar<M: Mmio>(
    mmio: &M,
    function_base: PhysAddr,
    bar_offset: u16,
    addr: PhysAddr,
    kind: BarKind,
) -> Result<(), BringupError> {
    let reg = function_base + bar_offset as u64;
    match kind {
        BarKind::Memory64 => {
            mmio.write32(reg, addr as u32);
            mmio.write32(reg + 4, (addr >> 32) as u32);
        }
        _ => {
            let low = u32::try_from(addr).map_err(|_| BringupError::BarUnreachable { addr })?;
            mmio.write32(reg, low);
        }
    }
    Ok(())
}

fn allocate_bar<M, A, R>(
    ctx: &mut BootContext<M, A, R>,
    function_base: PhysAddr,
    bar_offset: u16,
    size: u64,
    kind: BarKind,
) -> Result<PhysAddr, BringupError>
where
    M: Mmio,
    A: PhysAllocator,
    R: TranslationRegime,
{
    let bytes = size as usize;
    let addr = ctx.alloc.allocate(bytes, bytes).ok_or(BringupError::OutOfMemory {
        resource: Resource::Bar,
        size: bytes,
    })?;
    if let Err(err) = program_bar(&ctx.mmio, function_base, bar_offset, addr, kind) {
        ctx.alloc.free(addr, bytes, bytes);
        return Err(err);
    }
    Ok(addr)
}

/// Back a 32-bit memory BAR with `size` bytes of size-aligned memory and
/// program the BAR with its address.
pub fn allocate_and_program_bar<M, A, R>(
    ctx: &mut BootContext<M, A, R>,
    function_base: PhysAddr,
    bar_offset: u16,
    size: u64,
) -> Result<PhysAddr, BringupError>
where
    M: Mmio,
    A: PhysAllocator,
    R: TranslationRegime,
{
    allocate_bar(ctx, function_base, bar_offset, size, BarKind::Memory32)
}

/// A BAR that now decodes allocator memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedBar {
    pub index: u8,
    pub base: PhysAddr,
    pub size: u64,
    pub kind: BarKind,
}

/// Probe BAR `index` and back it with memory.
pub fn assign_bar<M, A, R>(
    ctx: &mut BootContext<M, A, R>,
    function_base: PhysAddr,
    index: u8,
) -> Result<AssignedBar, BringupError>
where
    M: Mmio,
    A: PhysAllocator,
    R: TranslationRegime,
{
    let offset = bar_offset(index);
    let info = probe_bar(&ctx.mmio, function_base, offset);
    if info.size == 0 || info.kind == BarKind::Io {
        return Err(BringupError::EmptyBar { offset });
    }

    let base = allocate_bar(ctx, function_base, offset, info.size, info.kind)?;
    log::debug!(
        "BAR{} ({:?}{}) {:#x} bytes at {:#x}",
        index,
        info.kind,
        if info.prefetchable { ", prefetchable" } else { "" },
        info.size,
        base
    );
    Ok(AssignedBar {
        index,
        base,
        size: info.size,
        kind: info.kind,
    })
}

/// Turn on I/O decoding, memory decoding and bus mastering, and confirm
/// all three stuck.
pub fn enable_device<M: Mmio>(mmio: &M, function_base: PhysAddr) -> Result<(), BringupError> {
    let reg = function_base + COMMAND as u64;
    let wanted = Command::IO_SPACE | Command::MEMORY_SPACE | Command::BUS_MASTER;

    let command = mmio.read16(reg);
    mmio.write16(reg, command | wanted.bits());

    let readback = mmio.read16(reg);
    if Command::from_bits_truncate(readback).contains(wanted) {
        Ok(())
    } else {
        log::warn!("command register kept {:#06x}", readback);
        Err(BringupError::EnableRejected { command: readback })
    }
}

/// Set or clear the legacy INTx disable bit.
pub fn set_interrupt_disable<M: Mmio>(mmio: &M, function_base: PhysAddr, disabled: bool) {
    let reg = function_base + COMMAND as u64;
    let mut command = Command::from_bits_retain(mmio.read16(reg));
    command.set(Command::INTERRUPT_DISABLE, disabled);
    mmio.write16(reg, command.bits());
}

/// Config offset of the first capability, if the function has a list.
pub fn capabilities_pointer<M: Mmio>(mmio: &M, function_base: PhysAddr) -> Option<u8> {
    let status = mmio.read16(function_base + STATUS as u64);
    if status & STATUS_CAPABILITIES_LIST == 0 {
        return None;
    }
    match mmio.read8(function_base + CAPABILITIES_POINTER as u64) & 0xFC {
        0 => None,
        ptr => Some(ptr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{emulate_bar32, emulate_bar64, test_context, BumpAllocator, SimBus};

    const FN: PhysAddr = 0x3000_0000;

    #[test]
    fn ecam_address_packs_bdf() {
        assert_eq!(ecam_address(0x40_1000_0000, 0, 0, 0, 0), 0x40_1000_0000);
        assert_eq!(ecam_address(0x40_1000_0000, 1, 2, 3, 0x10), 0x40_1011_3010);
    }

    #[test]
    fn size_of_4k_mask() {
        let bus = SimBus::new();
        emulate_bar32(&bus, FN + 0x10, 0x1000);
        assert_eq!(size_bar(&bus, FN, 0x10), 0x1000);
    }

    #[test]
    fn probe_reports_64_bit_prefetchable() {
        let bus = SimBus::new();
        emulate_bar64(&bus, FN + 0x10, 0x4000);
        bus.poke32(FN + 0x10, 0b1100);
        bus.on_write(FN + 0x10, |_, v| (v & 0xFFFF_C000) | 0b1100);
        let info = probe_bar(&bus, FN, 0x10);
        assert_eq!(info.kind, BarKind::Memory64);
        assert!(info.prefetchable);
        assert_eq!(info.size, 0x4000);
    }

    #[test]
    fn unimplemented_bar_is_empty() {
        let mut ctx = test_context(SimBus::new(), BumpAllocator::new(0x8000_0000, 0x9000_0000));
        assert_eq!(
            assign_bar(&mut ctx, FN, 2),
            Err(BringupError::EmptyBar { offset: 0x18 })
        );
    }

    #[test]
    fn assign_programs_aligned_backing() {
        let bus = SimBus::new();
        emulate_bar32(&bus, FN + 0x10, 0x4000);
        let mut ctx = test_context(bus, BumpAllocator::new(0x8000_1000, 0x9000_0000));

        let bar = assign_bar(&mut ctx, FN, 0).unwrap();
        assert_eq!(bar.base, 0x8000_4000);
        assert_eq!(bar.size, 0x4000);
        assert_eq!(ctx.mmio.peek32(FN + 0x10), 0x8000_4000);
        assert_eq!(ctx.alloc.allocations, [(0x8000_4000, 0x4000, 0x4000)]);
    }

    #[test]
    fn assign_writes_upper_dword_of_64_bit_bar() {
        let bus = SimBus::new();
        emulate_bar64(&bus, FN + 0x10, 0x10_0000);
        let mut ctx = test_context(bus, BumpAllocator::new(0x1_0000_0000, 0x2_0000_0000));

        let bar = assign_bar(&mut ctx, FN, 0).unwrap();
        assert_eq!(bar.kind, BarKind::Memory64);
        assert_eq!(ctx.mmio.peek32(FN + 0x10) & !0xF, 0);
        assert_eq!(ctx.mmio.peek32(FN + 0x14), 1);
    }

    #[test]
    fn allocator_failure_propagates() {
        let bus = SimBus::new();
        emulate_bar32(&bus, FN + 0x10, 0x1000);
        let mut ctx = test_context(bus, BumpAllocator::exhausted());
        assert_eq!(
            allocate_and_program_bar(&mut ctx, FN, 0x10, 0x1000),
            Err(BringupError::OutOfMemory { resource: Resource::Bar, size: 0x1000 })
        );
    }

    #[test]
    fn high_memory_does_not_fit_a_32_bit_bar() {
        let mut ctx = test_context(SimBus::new(), BumpAllocator::new(0x1_0000_0000, 0x2_0000_0000));
        assert_eq!(
            allocate_and_program_bar(&mut ctx, FN, 0x10, 0x1000),
            Err(BringupError::BarUnreachable { addr: 0x1_0000_0000 })
        );
        assert_eq!(ctx.alloc.freed, [0x1_0000_0000]);
    }

    #[test]
    fn enable_sets_low_three_bits() {
        let bus = SimBus::new();
        bus.poke16(FN + 0x04, 1 << 10);
        assert_eq!(enable_device(&bus, FN), Ok(()));
        assert_eq!(bus.writes_to(FN + 0x04), [0x0407]);
    }

    #[test]
    fn enable_reports_rejected_bits() {
        let bus = SimBus::new();
        // a command register that refuses I/O decoding
        bus.on_write(FN + 0x04, |_, v| v & !0x1);
        assert_eq!(
            enable_device(&bus, FN),
            Err(BringupError::EnableRejected { command: 0x6 })
        );
    }

    #[test]
    fn interrupt_disable_is_bit_10() {
        let bus = SimBus::new();
        bus.poke16(FN + 0x04, 0x0407);
        set_interrupt_disable(&bus, FN, false);
        assert_eq!(bus.writes_to(FN + 0x04), [0x0007]);
        set_interrupt_disable(&bus, FN, true);
        assert_eq!(bus.writes_to(FN + 0x04), [0x0007, 0x0407]);
    }

    #[test]
    fn capability_pointer_needs_status_bit() {
        let bus = SimBus::new();
        bus.poke8(FN + 0x34, 0x43);
        assert_eq!(capabilities_pointer(&bus, FN), None);
        bus.poke16(FN + 0x06, 1 << 4);
        assert_eq!(capabilities_pointer(&bus, FN), Some(0x40));
    }

    #[test]
    fn find_device_skips_single_function_devices() {
        let bus = SimBus::new();
        let mut config = BringupConfig::qemu_virt();
        config.ecam_buses = 1;

        let host = ecam_address(config.ecam_base, 0, 0, 0, 0);
        bus.poke16(host, 0x1b36);
        bus.poke16(host + 2, 0x0008);
        // function 1 of a single-function device is never looked at
        bus.poke16(host + 0x1000, 0x1af4);
        bus.poke16(host + 0x1000 + 2, 0x1050);

        let gpu = ecam_address(config.ecam_base, 0, 3, 0, 0);
        bus.poke16(gpu, 0x1af4);
        bus.poke16(gpu + 2, 0x1050);

        let found = find_device(&bus, &config, 0x1af4, 0x1050).unwrap();
        assert_eq!((found.bus, found.device, found.function), (0, 3, 0));
        assert_eq!(found.base, gpu);
        assert_eq!(
            find_device(&bus, &config, 0x1b36, 0x000d),
            Err(BringupError::DeviceNotFound { vendor: 0x1b36, device: 0x000d })
        );
    }
}
