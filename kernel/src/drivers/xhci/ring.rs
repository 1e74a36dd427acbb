// =============================================================================
// Tern OS - xHCI Rings
// =============================================================================
// TRB rings shared with the controller. Both live in DMA memory and are only
// touched through `Mmio`, never through Rust references.
//
// Command ring: 255 usable slots plus a Link TRB in slot 255 that points back
// to slot 0 and toggles the cycle state. Ownership of a slot is decided by
// its cycle bit matching the consumer's cycle state.
//
// Event ring: one segment of 256 TRBs described by a single ERST entry.
// =============================================================================

use static_assertions::assert_eq_size;

use crate::context::BootContext;
use crate::error::{BringupError, Resource};
use crate::hal::{Mmio, PhysAddr, PhysAllocator, TranslationRegime};

/// TRBs per ring (and per event ring segment).
pub const RING_SIZE: usize = 256;

pub const TRB_SIZE: usize = 16;

/// Rings never cross a 64 KiB boundary; page alignment of a 4 KiB ring
/// guarantees it.
const RING_ALIGN: usize = 4096;

pub const TRB_CYCLE: u32 = 1 << 0;
/// Link TRB: toggle the consumer cycle state when following the link
pub const TRB_TOGGLE_CYCLE: u32 = 1 << 1;
const TRB_TYPE_SHIFT: u32 = 10;

pub const TRB_TYPE_LINK: u8 = 6;
pub const TRB_TYPE_NOOP_COMMAND: u8 = 23;

/// One Transfer Request Block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: u32,
}

assert_eq_size!(Trb, [u8; TRB_SIZE]);

impl Trb {
    pub const fn with_type(trb_type: u8) -> Self {
        Self {
            parameter: 0,
            status: 0,
            control: (trb_type as u32) << TRB_TYPE_SHIFT,
        }
    }

    /// Link back to `target`. The cycle bit starts clear: the controller
    /// does not follow the link until the producer hands it over.
    pub const fn link(target: PhysAddr) -> Self {
        Self {
            parameter: target,
            status: 0,
            control: ((TRB_TYPE_LINK as u32) << TRB_TYPE_SHIFT) | TRB_TOGGLE_CYCLE,
        }
    }

    pub const fn trb_type(&self) -> u8 {
        ((self.control >> TRB_TYPE_SHIFT) & 0x3F) as u8
    }

    pub const fn cycle(&self) -> bool {
        self.control & TRB_CYCLE != 0
    }

    pub fn read<M: Mmio>(mmio: &M, addr: PhysAddr) -> Self {
        Self {
            parameter: mmio.read64(addr),
            status: mmio.read32(addr + 8),
            control: mmio.read32(addr + 12),
        }
    }

    /// Store the TRB with the control dword last, so the cycle bit never
    /// becomes visible ahead of the rest.
    pub fn write<M: Mmio>(&self, mmio: &M, addr: PhysAddr) {
        mmio.write64(addr, self.parameter);
        mmio.write32(addr + 8, self.status);
        mmio.write_barrier();
        mmio.write32(addr + 12, self.control);
    }
}

/// Producer side of the command ring.
#[derive(Debug)]
pub struct CommandRing {
    base: PhysAddr,
    enqueue: usize,
    cycle: bool,
}

impl CommandRing {
    pub fn new<M, A, R>(ctx: &mut BootContext<M, A, R>) -> Result<Self, BringupError>
    where
        M: Mmio,
        A: PhysAllocator,
        R: TranslationRegime,
    {
        let base = ctx.allocate_zeroed(Resource::CommandRing, RING_SIZE * TRB_SIZE, RING_ALIGN)?;
        let ring = Self {
            base,
            enqueue: 0,
            cycle: true,
        };
        Trb::link(base).write(&ctx.mmio, ring.link_address());
        Ok(ring)
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// CRCR value: ring base with the initial cycle state.
    pub fn crcr(&self) -> u64 {
        self.base | super::regs::CRCR_RCS
    }

    pub fn link_address(&self) -> PhysAddr {
        self.slot_address(RING_SIZE - 1)
    }

    fn slot_address(&self, slot: usize) -> PhysAddr {
        self.base + (slot * TRB_SIZE) as u64
    }

    /// Producer cycle state.
    pub fn cycle(&self) -> bool {
        self.cycle
    }

    pub fn enqueue_index(&self) -> usize {
        self.enqueue
    }

    /// Enqueue `trb` with the producer cycle bit. Returns where it landed.
    pub fn push<M: Mmio>(&mut self, mmio: &M, mut trb: Trb) -> PhysAddr {
        let addr = self.slot_address(self.enqueue);
        trb.control = (trb.control & !TRB_CYCLE) | self.cycle_bit();
        trb.write(mmio, addr);

        self.enqueue += 1;
        if self.enqueue == RING_SIZE - 1 {
            let link = self.link_address();
            let control = mmio.read32(link + 12);
            mmio.write32(link + 12, (control & !TRB_CYCLE) | self.cycle_bit());
            self.cycle = !self.cycle;
            self.enqueue = 0;
        }
        addr
    }

    fn cycle_bit(&self) -> u32 {
        if self.cycle {
            TRB_CYCLE
        } else {
            0
        }
    }
}

/// ERST entry: one event ring segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ErstEntry {
    pub base: u64,
    pub size: u32,
    pub reserved: u32,
}

assert_eq_size!(ErstEntry, [u8; 16]);

impl ErstEntry {
    pub fn write<M: Mmio>(&self, mmio: &M, addr: PhysAddr) {
        mmio.write64(addr, self.base);
        mmio.write32(addr + 8, self.size);
        mmio.write32(addr + 12, self.reserved);
    }
}

/// Consumer side of a single-segment event ring.
#[derive(Debug)]
pub struct EventRing {
    base: PhysAddr,
    erst: PhysAddr,
    dequeue: usize,
    cycle: bool,
}

impl EventRing {
    pub fn new<M, A, R>(ctx: &mut BootContext<M, A, R>) -> Result<Self, BringupError>
    where
        M: Mmio,
        A: PhysAllocator,
        R: TranslationRegime,
    {
        let base = ctx.allocate_zeroed(Resource::EventRing, RING_SIZE * TRB_SIZE, RING_ALIGN)?;
        let erst = ctx.allocate_zeroed(
            Resource::EventRingSegmentTable,
            core::mem::size_of::<ErstEntry>(),
            64,
        )?;
        ErstEntry {
            base,
            size: RING_SIZE as u32,
            reserved: 0,
        }
        .write(&ctx.mmio, erst);

        Ok(Self {
            base,
            erst,
            dequeue: 0,
            cycle: true,
        })
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn segment_table(&self) -> PhysAddr {
        self.erst
    }

    /// Current value for ERDP.
    pub fn dequeue_pointer(&self) -> PhysAddr {
        self.base + (self.dequeue * TRB_SIZE) as u64
    }

    /// Take the next event if the controller has produced one.
    pub fn pop<M: Mmio>(&mut self, mmio: &M) -> Option<Trb> {
        mmio.read_barrier();
        let trb = Trb::read(mmio, self.dequeue_pointer());
        if trb.cycle() != self.cycle {
            return None;
        }
        self.dequeue += 1;
        if self.dequeue == RING_SIZE {
            self.dequeue = 0;
            self.cycle = !self.cycle;
        }
        Some(trb)
    }
}
