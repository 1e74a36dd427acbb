// =============================================================================
// Tern OS - Page Table Manager
// =============================================================================
// Builds the identity map for the boot core and switches translation on.
//
// Layout (4 KiB granule, 48-bit VA):
//   L0 -> L1 -> L2 -> L3
//   L2 slots hold either a 2 MiB block or a link to an L3 table, never both.
//   L3 slots hold 4 KiB pages.
//
// Mapping policy:
//   map_block   last writer wins, unless the slot already links an L3 table
//   map_page    first writer wins; a covering block wins over any page
// =============================================================================

mod arena;
mod descriptor;

pub use descriptor::{Descriptor, DescriptorFlags, MemoryAttr, Privilege};

use arena::{TableArena, TableId};
use descriptor::index;

use super::{BLOCK_SIZE, PAGE_SIZE};
use crate::config::{MemoryLayout, Window};
use crate::hal::{PhysAddr, TranslationRegime, TranslationRegisters};

/// TCR_EL1 for a 48-bit address space with 4 KiB pages on both halves.
/// TTBR1 walks stay disabled; only the identity map under TTBR0 exists.
const TCR_T0SZ: u64 = 16;
const TCR_SH0_INNER: u64 = 0b11 << 12;
const TCR_TG0_4K: u64 = 0b00 << 14;
const TCR_T1SZ: u64 = 16 << 16;
const TCR_EPD1: u64 = 1 << 23;
const TCR_TG1_4K: u64 = 0b10 << 30;
const TCR_IPS_40BIT: u64 = 0b010 << 32;

pub const TCR: u64 = TCR_T0SZ
    | TCR_SH0_INNER
    | TCR_TG0_4K
    | TCR_T1SZ
    | TCR_EPD1
    | TCR_TG1_4K
    | TCR_IPS_40BIT;

/// Size class of a leaf mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granule {
    /// 4 KiB L3 page
    Page,
    /// 2 MiB L2 block
    Block,
}

impl Granule {
    pub const fn size(self) -> u64 {
        match self {
            Granule::Page => PAGE_SIZE,
            Granule::Block => BLOCK_SIZE,
        }
    }
}

/// What a map request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// A new leaf descriptor was written.
    Mapped,
    /// The page was already mapped; the old mapping stays.
    AlreadyMapped,
    /// A 2 MiB block already covers the page; nothing was written.
    CoveredByBlock,
    /// The block slot links an L3 table; the finer mappings stay.
    SplitByTable,
}

impl MapOutcome {
    pub fn is_mapped(self) -> bool {
        self == MapOutcome::Mapped
    }
}

/// Owner of one address space's translation tables.
pub struct PageTableManager<R: TranslationRegime> {
    tables: TableArena,
    regime: R,
}

impl<R: TranslationRegime> PageTableManager<R> {
    pub fn new(regime: R) -> Self {
        Self {
            tables: TableArena::new(),
            regime,
        }
    }

    pub fn regime(&self) -> &R {
        &self.regime
    }

    /// Physical address of the L0 table, as loaded into TTBR0_EL1.
    pub fn root_address(&self) -> PhysAddr {
        self.tables.phys(self.tables.root())
    }

    /// Number of tables allocated so far, the root included.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// The register values `init` loads.
    pub fn translation_registers(&self) -> TranslationRegisters {
        TranslationRegisters {
            mair: MemoryAttr::mair(),
            tcr: TCR,
            ttbr0: self.root_address(),
        }
    }

    /// Walk to the L2 table covering `va`, creating L1 and L2 as needed.
    fn l2_table(&mut self, va: u64) -> TableId {
        let root = self.tables.root();
        let l1 = self.tables.child_or_alloc(root, index(va, 0));
        self.tables.child_or_alloc(l1, index(va, 1))
    }

    /// Walk to the L2 table covering `va` without allocating.
    fn find_l2_table(&self, va: u64) -> Option<TableId> {
        let l1 = self.tables.child(self.tables.root(), index(va, 0))?;
        self.tables.child(l1, index(va, 1))
    }

    /// Map the 2 MiB block containing `va` to the block containing `pa`.
    pub fn map_block(&mut self, va: u64, pa: PhysAddr, attr: MemoryAttr) -> MapOutcome {
        let l2 = self.l2_table(va);
        let slot = index(va, 2);

        if self.tables.child(l2, slot).is_some() {
            log::warn!("block at {:#x} skipped, slot already holds a page table", va);
            return MapOutcome::SplitByTable;
        }

        let pa = pa & !(BLOCK_SIZE - 1);
        self.tables.set_entry(l2, slot, Descriptor::block(pa, attr));
        self.regime.table_barrier();
        MapOutcome::Mapped
    }

    /// Map the 4 KiB page containing `va` to the page containing `pa`.
    pub fn map_page(
        &mut self,
        va: u64,
        pa: PhysAddr,
        attr: MemoryAttr,
        privilege: Privilege,
    ) -> MapOutcome {
        let l2 = self.l2_table(va);
        let l2_slot = index(va, 2);

        if self.tables.entry(l2, l2_slot).is_block() {
            return MapOutcome::CoveredByBlock;
        }

        let l3 = self.tables.child_or_alloc(l2, l2_slot);
        let slot = index(va, 3);
        if self.tables.entry(l3, slot).is_valid() {
            return MapOutcome::AlreadyMapped;
        }

        self.tables.set_entry(l3, slot, Descriptor::page(pa, attr, privilege));
        self.regime.table_barrier();
        MapOutcome::Mapped
    }

    /// Remove the leaf mapping covering `va`.
    ///
    /// Clears the page, or the whole block when a block covers `va`. Table
    /// memory is kept. The TLBs and the instruction cache are invalidated on
    /// every call, whether or not anything was mapped.
    pub fn unmap(&mut self, va: u64) -> Option<Granule> {
        let cleared = self.clear_leaf(va);
        if cleared.is_some() {
            self.regime.table_barrier();
        }
        self.regime.invalidate_tlb_all();
        self.regime.invalidate_icache_all();
        cleared
    }

    fn clear_leaf(&mut self, va: u64) -> Option<Granule> {
        let l2 = self.find_l2_table(va)?;
        let l2_slot = index(va, 2);

        if self.tables.entry(l2, l2_slot).is_block() {
            self.tables.set_entry(l2, l2_slot, Descriptor::INVALID);
            return Some(Granule::Block);
        }

        let l3 = self.tables.child(l2, l2_slot)?;
        let slot = index(va, 3);
        if !self.tables.entry(l3, slot).is_valid() {
            return None;
        }
        self.tables.set_entry(l3, slot, Descriptor::INVALID);
        Some(Granule::Page)
    }

    /// Software walk: where `va` lands and through which kind of leaf.
    pub fn translate(&self, va: u64) -> Option<(PhysAddr, Granule)> {
        let l2 = self.find_l2_table(va)?;
        let l2_slot = index(va, 2);

        let entry = self.tables.entry(l2, l2_slot);
        if entry.is_block() {
            return Some((entry.address() | (va & (BLOCK_SIZE - 1)), Granule::Block));
        }

        let l3 = self.tables.child(l2, l2_slot)?;
        let page = self.tables.entry(l3, index(va, 3));
        page.is_table()
            .then(|| (page.address() | (va & (PAGE_SIZE - 1)), Granule::Page))
    }

    /// Identity map `window` with 4 KiB pages. Returns how many were written.
    pub fn map_window_pages(
        &mut self,
        window: Window,
        attr: MemoryAttr,
        privilege: Privilege,
    ) -> usize {
        let start = window.start & !(PAGE_SIZE - 1);
        let end = align_up(window.end, PAGE_SIZE);
        (start..end)
            .step_by(PAGE_SIZE as usize)
            .filter(|&va| self.map_page(va, va, attr, privilege).is_mapped())
            .count()
    }

    /// Identity map `window` with 2 MiB blocks. Returns how many were written.
    pub fn map_window_blocks(&mut self, window: Window, attr: MemoryAttr) -> usize {
        let start = window.start & !(BLOCK_SIZE - 1);
        let end = align_up(window.end, BLOCK_SIZE);
        (start..end)
            .step_by(BLOCK_SIZE as usize)
            .filter(|&va| self.map_block(va, va, attr).is_mapped())
            .count()
    }

    /// Build the boot identity map and turn translation on.
    ///
    /// Maps the kernel window with normal blocks, the console window with
    /// device pages and every extra device window with device blocks, then
    /// loads MAIR/TCR/TTBR0, enables the MMU and hands `verify` the live
    /// tables.
    ///
    /// # Safety
    /// `layout` must cover the running image, its stack, its heap and every
    /// device touched after this returns.
    pub unsafe fn init(&mut self, layout: &MemoryLayout, verify: impl FnOnce(&Self)) {
        let blocks = self.map_window_blocks(layout.kernel, MemoryAttr::NormalNonCacheable);
        log::debug!(
            "kernel {:#x}..{:#x}: {} blocks",
            layout.kernel.start,
            layout.kernel.end,
            blocks
        );

        let pages = self.map_window_pages(layout.uart, MemoryAttr::Device, Privilege::Kernel);
        log::debug!(
            "console {:#x}..{:#x}: {} pages",
            layout.uart.start,
            layout.uart.end,
            pages
        );

        for window in layout.device_blocks {
            let blocks = self.map_window_blocks(*window, MemoryAttr::Device);
            log::debug!(
                "device {:#x}..{:#x}: {} blocks",
                window.start,
                window.end,
                blocks
            );
        }

        let regs = self.translation_registers();
        log::info!(
            "MMU: MAIR={:#x} TCR={:#x} TTBR0={:#x} ({} tables)",
            regs.mair,
            regs.tcr,
            regs.ttbr0,
            self.table_count()
        );

        self.regime.table_barrier();
        self.regime.enable(&regs);
        verify(self);
    }
}

const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRegime;

    const DEVICE_VA: u64 = 0x0900_0000;
    const RAM_VA: u64 = 0x4020_0000;

    fn manager() -> PageTableManager<RecordingRegime> {
        PageTableManager::new(RecordingRegime::default())
    }

    #[test]
    fn map_page_is_first_writer_wins() {
        let mut pt = manager();
        assert_eq!(
            pt.map_page(DEVICE_VA, DEVICE_VA, MemoryAttr::Device, Privilege::Kernel),
            MapOutcome::Mapped
        );
        assert_eq!(
            pt.map_page(DEVICE_VA, 0x1234_5000, MemoryAttr::NormalNonCacheable, Privilege::User),
            MapOutcome::AlreadyMapped
        );
        assert_eq!(pt.translate(DEVICE_VA + 0x10), Some((DEVICE_VA + 0x10, Granule::Page)));
    }

    #[test]
    fn only_descriptor_changes_are_fenced() {
        let mut pt = manager();
        pt.map_page(DEVICE_VA, DEVICE_VA, MemoryAttr::Device, Privilege::Kernel);
        assert_eq!(pt.regime().table_barriers(), 1);

        pt.map_page(DEVICE_VA, DEVICE_VA, MemoryAttr::Device, Privilege::Kernel);
        assert_eq!(pt.regime().table_barriers(), 1);

        pt.map_block(RAM_VA, RAM_VA, MemoryAttr::NormalNonCacheable);
        assert_eq!(pt.regime().table_barriers(), 2);

        // the L2 slot of DEVICE_VA links a table, so the block is refused
        pt.map_block(DEVICE_VA, DEVICE_VA, MemoryAttr::Device);
        assert_eq!(pt.regime().table_barriers(), 2);

        pt.unmap(DEVICE_VA);
        assert_eq!(pt.regime().table_barriers(), 3);
    }

    #[test]
    fn repeated_page_mapping_allocates_nothing_new() {
        let mut pt = manager();
        pt.map_page(DEVICE_VA, DEVICE_VA, MemoryAttr::Device, Privilege::Kernel);
        let tables = pt.table_count();
        pt.map_page(DEVICE_VA, DEVICE_VA, MemoryAttr::Device, Privilege::Kernel);
        pt.map_page(DEVICE_VA + PAGE_SIZE, DEVICE_VA + PAGE_SIZE, MemoryAttr::Device, Privilege::Kernel);
        // root, L1, L2, L3
        assert_eq!(tables, 4);
        assert_eq!(pt.table_count(), 4);
    }

    #[test]
    fn block_takes_precedence_over_pages() {
        let mut pt = manager();
        assert!(pt.map_block(RAM_VA, RAM_VA, MemoryAttr::NormalNonCacheable).is_mapped());
        assert_eq!(
            pt.map_page(RAM_VA + 0x3000, 0x9000_0000, MemoryAttr::Device, Privilege::User),
            MapOutcome::CoveredByBlock
        );
        assert_eq!(pt.translate(RAM_VA + 0x3004), Some((RAM_VA + 0x3004, Granule::Block)));
        assert_eq!(pt.table_count(), 3);
    }

    #[test]
    fn map_block_overwrites_a_block_but_not_a_table() {
        let mut pt = manager();
        pt.map_block(RAM_VA, RAM_VA, MemoryAttr::NormalNonCacheable);
        assert!(pt.map_block(RAM_VA, 0x6000_0000, MemoryAttr::Device).is_mapped());
        assert_eq!(pt.translate(RAM_VA), Some((0x6000_0000, Granule::Block)));

        let split = RAM_VA + BLOCK_SIZE;
        pt.map_page(split, split, MemoryAttr::Device, Privilege::Kernel);
        assert_eq!(
            pt.map_block(split, split, MemoryAttr::NormalNonCacheable),
            MapOutcome::SplitByTable
        );
        assert_eq!(pt.translate(split), Some((split, Granule::Page)));
    }

    #[test]
    fn unmap_clears_and_invalidates_every_time() {
        let mut pt = manager();
        pt.map_page(DEVICE_VA, DEVICE_VA, MemoryAttr::Device, Privilege::Kernel);

        assert_eq!(pt.unmap(DEVICE_VA), Some(Granule::Page));
        assert_eq!(pt.translate(DEVICE_VA), None);
        assert_eq!(pt.regime().tlb_invalidations(), 1);
        assert_eq!(pt.regime().icache_invalidations(), 1);

        assert_eq!(pt.unmap(DEVICE_VA), None);
        assert_eq!(pt.regime().tlb_invalidations(), 2);
        assert_eq!(pt.regime().icache_invalidations(), 2);

        // a fresh mapping is accepted again after unmap
        assert!(pt
            .map_page(DEVICE_VA, DEVICE_VA, MemoryAttr::Device, Privilege::Shared)
            .is_mapped());
        assert_eq!(pt.table_count(), 4);
    }

    #[test]
    fn unmap_inside_a_block_clears_the_block() {
        let mut pt = manager();
        pt.map_block(RAM_VA, RAM_VA, MemoryAttr::NormalNonCacheable);
        assert_eq!(pt.unmap(RAM_VA + 0x1_0000), Some(Granule::Block));
        assert_eq!(pt.translate(RAM_VA), None);
    }

    #[test]
    fn page_descriptor_carries_attr_and_address_only_in_their_fields() {
        let mut pt = manager();
        pt.map_page(DEVICE_VA, 0x0900_0ABC, MemoryAttr::Device, Privilege::Kernel);
        // misaligned physical bits never reach the address field
        assert_eq!(pt.translate(DEVICE_VA), Some((0x0900_0000, Granule::Page)));
    }

    #[test]
    fn window_mapping_rounds_to_granule() {
        let mut pt = manager();
        let pages = pt.map_window_pages(
            Window::new(0x0900_0800, 0x0900_2001),
            MemoryAttr::Device,
            Privilege::Kernel,
        );
        assert_eq!(pages, 3);
        let blocks = pt.map_window_blocks(
            Window::new(0x4000_0000, 0x4040_0000),
            MemoryAttr::NormalNonCacheable,
        );
        assert_eq!(blocks, 2);
    }

    #[test]
    fn init_maps_layout_loads_registers_then_verifies() {
        let mut pt = manager();
        let layout = MemoryLayout::qemu_virt();
        let mut verified = false;

        unsafe {
            pt.init(&layout, |pt| {
                verified = true;
                assert!(pt.regime().is_enabled());
            })
        };

        assert!(verified);
        let regs = pt.regime().installed().unwrap();
        assert_eq!(regs.mair, 0x44 << 8);
        assert_eq!(regs.tcr & 0x3F, 16);
        assert_eq!((regs.tcr >> 16) & 0x3F, 16);
        assert_eq!(regs.ttbr0, pt.root_address());

        assert_eq!(pt.translate(0x4008_0000), Some((0x4008_0000, Granule::Block)));
        assert_eq!(pt.translate(crate::config::UART_BASE), Some((crate::config::UART_BASE, Granule::Page)));
        assert_eq!(pt.translate(crate::config::FW_CFG_DMA), Some((crate::config::FW_CFG_DMA, Granule::Page)));
        let ecam = crate::config::PCIE_ECAM_BASE + 0x8000;
        assert_eq!(pt.translate(ecam), Some((ecam, Granule::Block)));
        assert_eq!(pt.translate(0x2000_0000), None);
    }

    #[test]
    fn tcr_selects_4k_granules_and_40_bit_output() {
        assert_eq!((TCR >> 14) & 0b11, 0b00);
        assert_eq!((TCR >> 30) & 0b11, 0b10);
        assert_eq!((TCR >> 32) & 0b111, 0b010);
    }
}
