// =============================================================================
// Tern OS - Test Doubles
// =============================================================================
// A byte-addressed simulated bus, a bump allocator over it and a translation
// regime that records what it was asked to do.
// =============================================================================

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use crate::config::BringupConfig;
use crate::context::BootContext;
use crate::hal::{Mmio, PhysAddr, PhysAllocator, TranslationRegime, TranslationRegisters};

/// Called on a write to a hooked address with the written value; returns
/// the value that actually lands in memory.
pub type WriteHook = Box<dyn Fn(&SimBus, u64) -> u64>;

/// One access the code under test made through `Mmio`, in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    Read(PhysAddr),
    Write(PhysAddr, u64),
    ReadBarrier,
    WriteBarrier,
}

/// Sparse little-endian memory. Unwritten bytes read as zero.
///
/// Accesses through `Mmio` are logged; `poke`/`peek` are not.
#[derive(Default)]
pub struct SimBus {
    memory: RefCell<BTreeMap<u64, u8>>,
    hooks: RefCell<BTreeMap<u64, WriteHook>>,
    events: RefCell<Vec<BusEvent>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn load(&self, addr: PhysAddr, width: usize) -> u64 {
        let memory = self.memory.borrow();
        (0..width).fold(0, |value, i| {
            let byte = memory.get(&(addr + i as u64)).copied().unwrap_or(0);
            value | (u64::from(byte) << (8 * i))
        })
    }

    fn store(&self, addr: PhysAddr, width: usize, value: u64) {
        let mut memory = self.memory.borrow_mut();
        for i in 0..width {
            memory.insert(addr + i as u64, (value >> (8 * i)) as u8);
        }
    }

    fn record(&self, event: BusEvent) {
        self.events.borrow_mut().push(event);
    }

    fn read(&self, addr: PhysAddr, width: usize) -> u64 {
        self.record(BusEvent::Read(addr));
        self.load(addr, width)
    }

    fn write(&self, addr: PhysAddr, width: usize, value: u64) {
        self.record(BusEvent::Write(addr, value));
        // the hook may poke or re-hook the bus, so it runs detached
        let hook = self.hooks.borrow_mut().remove(&addr);
        match hook {
            Some(hook) => {
                let stored = hook(self, value);
                self.store(addr, width, stored);
                self.hooks.borrow_mut().entry(addr).or_insert(hook);
            }
            None => self.store(addr, width, value),
        }
    }

    pub fn poke8(&self, addr: PhysAddr, value: u8) {
        self.store(addr, 1, value.into());
    }

    pub fn poke16(&self, addr: PhysAddr, value: u16) {
        self.store(addr, 2, value.into());
    }

    pub fn poke32(&self, addr: PhysAddr, value: u32) {
        self.store(addr, 4, value.into());
    }

    pub fn poke64(&self, addr: PhysAddr, value: u64) {
        self.store(addr, 8, value);
    }

    pub fn peek32(&self, addr: PhysAddr) -> u32 {
        self.load(addr, 4) as u32
    }

    pub fn peek64(&self, addr: PhysAddr) -> u64 {
        self.load(addr, 8)
    }

    pub fn on_write(&self, addr: PhysAddr, hook: impl Fn(&SimBus, u64) -> u64 + 'static) {
        self.hooks.borrow_mut().insert(addr, Box::new(hook));
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.events.borrow().clone()
    }

    /// Every value written to `addr`, oldest first.
    pub fn writes_to(&self, addr: PhysAddr) -> Vec<u64> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match *event {
                BusEvent::Write(a, v) if a == addr => Some(v),
                _ => None,
            })
            .collect()
    }

    /// Position of the first write to `addr` in the event log.
    pub fn first_write(&self, addr: PhysAddr) -> Option<usize> {
        self.events
            .borrow()
            .iter()
            .position(|event| matches!(*event, BusEvent::Write(a, _) if a == addr))
    }

    /// Position of the last write to `addr` in the event log.
    pub fn last_write(&self, addr: PhysAddr) -> Option<usize> {
        self.events
            .borrow()
            .iter()
            .rposition(|event| matches!(*event, BusEvent::Write(a, _) if a == addr))
    }

    /// Position of the first write of exactly `value` to `addr`.
    pub fn write_of(&self, addr: PhysAddr, value: u64) -> Option<usize> {
        self.events
            .borrow()
            .iter()
            .position(|event| *event == BusEvent::Write(addr, value))
    }

    /// A write barrier sits strictly between events `from` and `to`.
    pub fn write_barrier_between(&self, from: usize, to: usize) -> bool {
        let events = self.events.borrow();
        from < to
            && events[from + 1..to]
                .iter()
                .any(|event| *event == BusEvent::WriteBarrier)
    }

    /// `addr` was read at least once, and every read came right after a
    /// read barrier.
    pub fn reads_are_fenced(&self, addr: PhysAddr) -> bool {
        let events = self.events.borrow();
        let reads: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, event)| **event == BusEvent::Read(addr))
            .map(|(i, _)| i)
            .collect();
        !reads.is_empty()
            && reads
                .iter()
                .all(|&i| i > 0 && events[i - 1] == BusEvent::ReadBarrier)
    }
}

impl Mmio for SimBus {
    fn read8(&self, addr: PhysAddr) -> u8 {
        self.read(addr, 1) as u8
    }

    fn read16(&self, addr: PhysAddr) -> u16 {
        self.read(addr, 2) as u16
    }

    fn read32(&self, addr: PhysAddr) -> u32 {
        self.read(addr, 4) as u32
    }

    fn read64(&self, addr: PhysAddr) -> u64 {
        self.read(addr, 8)
    }

    fn write8(&self, addr: PhysAddr, value: u8) {
        self.write(addr, 1, value.into());
    }

    fn write16(&self, addr: PhysAddr, value: u16) {
        self.write(addr, 2, value.into());
    }

    fn write32(&self, addr: PhysAddr, value: u32) {
        self.write(addr, 4, value.into());
    }

    fn write64(&self, addr: PhysAddr, value: u64) {
        self.write(addr, 8, value);
    }

    fn write_barrier(&self) {
        self.record(BusEvent::WriteBarrier);
    }

    fn read_barrier(&self) {
        self.record(BusEvent::ReadBarrier);
    }

    fn zero(&self, addr: PhysAddr, len: usize) {
        let mut memory = self.memory.borrow_mut();
        for i in 0..len as u64 {
            memory.remove(&(addr + i));
        }
    }
}

/// Hands out aligned blocks from `[next, end)` and never reuses them.
pub struct BumpAllocator {
    next: PhysAddr,
    end: PhysAddr,
    pub allocations: Vec<(PhysAddr, usize, usize)>,
    pub freed: Vec<PhysAddr>,
}

impl BumpAllocator {
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        Self {
            next: start,
            end,
            allocations: Vec::new(),
            freed: Vec::new(),
        }
    }

    /// An allocator that refuses every request.
    pub fn exhausted() -> Self {
        Self::new(0, 0)
    }
}

impl PhysAllocator for BumpAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> Option<PhysAddr> {
        let align = align.max(1) as u64;
        let base = (self.next + align - 1) & !(align - 1);
        let end = base.checked_add(size as u64)?;
        if size == 0 || end > self.end {
            return None;
        }
        self.next = end;
        self.allocations.push((base, size, align as usize));
        Some(base)
    }

    fn free(&mut self, addr: PhysAddr, _size: usize, _align: usize) {
        self.freed.push(addr);
    }
}

/// Counts maintenance operations and remembers the enable request.
#[derive(Default)]
pub struct RecordingRegime {
    tlb: Cell<usize>,
    icache: Cell<usize>,
    barriers: Cell<usize>,
    installed: Cell<Option<TranslationRegisters>>,
}

impl RecordingRegime {
    pub fn tlb_invalidations(&self) -> usize {
        self.tlb.get()
    }

    pub fn icache_invalidations(&self) -> usize {
        self.icache.get()
    }

    pub fn table_barriers(&self) -> usize {
        self.barriers.get()
    }

    pub fn installed(&self) -> Option<TranslationRegisters> {
        self.installed.get()
    }
}

impl TranslationRegime for RecordingRegime {
    fn invalidate_tlb_all(&self) {
        self.tlb.set(self.tlb.get() + 1);
    }

    fn invalidate_icache_all(&self) {
        self.icache.set(self.icache.get() + 1);
    }

    fn table_barrier(&self) {
        self.barriers.set(self.barriers.get() + 1);
    }

    unsafe fn enable(&self, regs: &TranslationRegisters) {
        self.installed.set(Some(*regs));
    }

    fn is_enabled(&self) -> bool {
        self.installed.get().is_some()
    }
}

pub type TestContext = BootContext<SimBus, BumpAllocator, RecordingRegime>;

/// A context over `bus` whose ECAM scan covers a single bus.
pub fn test_context(bus: SimBus, alloc: BumpAllocator) -> TestContext {
    let mut config = BringupConfig::qemu_virt();
    config.ecam_buses = 1;
    config.spin_budget = 64;
    BootContext::new(bus, alloc, RecordingRegime::default(), config)
}

/// Make the dword at `bar` behave like a 32-bit memory BAR decoding `size`
/// bytes.
pub fn emulate_bar32(bus: &SimBus, bar: PhysAddr, size: u32) {
    let mask = !(size - 1);
    bus.poke32(bar, 0);
    bus.on_write(bar, move |_, value| u64::from(value as u32 & mask));
}

/// Make `bar` and the dword after it behave like a 64-bit memory BAR
/// decoding `size` bytes.
pub fn emulate_bar64(bus: &SimBus, bar: PhysAddr, size: u64) {
    let mask = !(size - 1);
    bus.poke32(bar, 0b100);
    bus.on_write(bar, move |_, value| (value & mask & 0xFFFF_FFF0) | 0b100);
    bus.on_write(bar + 4, move |_, value| value & (mask >> 32));
}
