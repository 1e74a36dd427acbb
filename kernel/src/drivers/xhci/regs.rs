// =============================================================================
// Tern OS - xHCI Register Layout
// =============================================================================
// Offsets and bits of the three register windows in BAR0:
//
//   BAR0 + 0                 capability registers (read-only)
//   BAR0 + CAPLENGTH         operational registers, port array at +0x400
//   BAR0 + (RTSOFF & !0x1F)  runtime registers, interrupter n at +0x20 + 32n
//   BAR0 + (DBOFF & !0x3)    doorbell array
// =============================================================================

use crate::hal::{Mmio, PhysAddr};

// Capability registers
pub const CAPLENGTH: u64 = 0x00;
pub const HCIVERSION: u64 = 0x02;
pub const HCSPARAMS1: u64 = 0x04;
pub const HCSPARAMS2: u64 = 0x08;
pub const DBOFF: u64 = 0x14;
pub const RTSOFF: u64 = 0x18;

// Operational registers
pub const USBCMD: u64 = 0x00;
pub const USBSTS: u64 = 0x04;
pub const PAGESIZE: u64 = 0x08;
pub const CRCR: u64 = 0x18;
pub const DCBAAP: u64 = 0x30;
pub const CONFIG: u64 = 0x38;
pub const PORT_REGISTERS: u64 = 0x400;
pub const PORT_STRIDE: u64 = 0x10;

pub const USBCMD_RUN: u32 = 1 << 0;
pub const USBCMD_INTE: u32 = 1 << 2;

pub const USBSTS_HALTED: u32 = 1 << 0;
pub const USBSTS_NOT_READY: u32 = 1 << 11;

pub const CONFIG_MAX_SLOTS_EN: u32 = 0xFF;

/// CRCR: Ring Cycle State
pub const CRCR_RCS: u64 = 1 << 0;

/// PORTSC: Current Connect Status
pub const PORTSC_CCS: u32 = 1 << 0;
/// PORTSC: Port Reset Change
pub const PORTSC_PRC: u32 = 1 << 21;

// Interrupter register set, relative to the interrupter base
pub const INTERRUPTER_BASE: u64 = 0x20;
pub const INTERRUPTER_STRIDE: u64 = 0x20;
pub const IMAN: u64 = 0x00;
pub const IMOD: u64 = 0x04;
pub const ERSTSZ: u64 = 0x08;
pub const ERSTBA: u64 = 0x10;
pub const ERDP: u64 = 0x18;

/// IMAN: Interrupt Pending | Interrupt Enable
pub const IMAN_IP_IE: u32 = 0b11;

/// What the capability registers advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub caplength: u8,
    pub hci_version: u16,
    pub max_slots: u8,
    pub max_interrupters: u16,
    pub max_ports: u8,
    pub max_scratchpads: u32,
    pub doorbell_offset: u32,
    pub runtime_offset: u32,
}

impl Capabilities {
    pub fn read<M: Mmio>(mmio: &M, base: PhysAddr) -> Self {
        let params1 = mmio.read32(base + HCSPARAMS1);
        let params2 = mmio.read32(base + HCSPARAMS2);
        let scratch_hi = (params2 >> 21) & 0x1F;
        let scratch_lo = (params2 >> 27) & 0x1F;
        Self {
            caplength: mmio.read8(base + CAPLENGTH),
            hci_version: mmio.read16(base + HCIVERSION),
            max_slots: params1 as u8,
            max_interrupters: ((params1 >> 8) & 0x7FF) as u16,
            max_ports: (params1 >> 24) as u8,
            max_scratchpads: (scratch_hi << 5) | scratch_lo,
            doorbell_offset: mmio.read32(base + DBOFF) & !0x3,
            runtime_offset: mmio.read32(base + RTSOFF) & !0x1F,
        }
    }
}

/// Base addresses of the register windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWindows {
    pub capability: PhysAddr,
    pub operational: PhysAddr,
    pub runtime: PhysAddr,
    pub doorbells: PhysAddr,
}

impl RegisterWindows {
    pub fn new(base: PhysAddr, caps: &Capabilities) -> Self {
        Self {
            capability: base,
            operational: base + u64::from(caps.caplength),
            runtime: base + u64::from(caps.runtime_offset),
            doorbells: base + u64::from(caps.doorbell_offset),
        }
    }

    pub fn port(&self, port: u8) -> PhysAddr {
        self.operational + PORT_REGISTERS + PORT_STRIDE * u64::from(port)
    }

    pub fn interrupter(&self, index: u16) -> PhysAddr {
        self.runtime + INTERRUPTER_BASE + INTERRUPTER_STRIDE * u64::from(index)
    }
}

/// Snapshot of newly connected ports: bit n is set when port n reports both
/// a current connection and a completed reset. At most 64 ports are read.
pub fn poll_ports<M: Mmio>(mmio: &M, windows: &RegisterWindows, max_ports: u8) -> u64 {
    (0..max_ports.min(64)).fold(0, |connected, port| {
        mmio.read_barrier();
        let portsc = mmio.read32(windows.port(port));
        if portsc & PORTSC_CCS != 0 && portsc & PORTSC_PRC != 0 {
            connected | (1 << port)
        } else {
            connected
        }
    })
}
