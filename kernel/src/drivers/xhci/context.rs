// =============================================================================
// Tern OS - xHCI Device Context Base Address Array
// =============================================================================
// DCBAA entry n points at the device context of slot n. Entry 0 belongs to
// the scratchpad buffer array when the controller asks for one.
// =============================================================================

use crate::context::BootContext;
use crate::error::{BringupError, Resource};
use crate::hal::{Mmio, PhysAddr, PhysAllocator, TranslationRegime};

pub const DCBAA_ENTRIES: usize = 256;
const DCBAA_ALIGN: usize = 64;

#[derive(Debug)]
pub struct Dcbaa {
    base: PhysAddr,
    scratchpads: Option<PhysAddr>,
}

impl Dcbaa {
    /// A zeroed 256-entry array, 64-byte aligned.
    pub fn new<M, A, R>(ctx: &mut BootContext<M, A, R>) -> Result<Self, BringupError>
    where
        M: Mmio,
        A: PhysAllocator,
        R: TranslationRegime,
    {
        let base = ctx.allocate_zeroed(Resource::Dcbaa, DCBAA_ENTRIES * 8, DCBAA_ALIGN)?;
        Ok(Self {
            base,
            scratchpads: None,
        })
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn entry<M: Mmio>(&self, mmio: &M, slot: u8) -> PhysAddr {
        mmio.read64(self.base + u64::from(slot) * 8)
    }

    pub fn set_entry<M: Mmio>(&self, mmio: &M, slot: u8, context: PhysAddr) {
        mmio.write64(self.base + u64::from(slot) * 8, context);
    }

    /// Address of the scratchpad buffer array, if one was installed.
    pub fn scratchpads(&self) -> Option<PhysAddr> {
        self.scratchpads
    }

    /// Allocate `count` zeroed scratchpad pages of `page_size` bytes, list
    /// them in a scratchpad buffer array and hang the array off entry 0.
    pub fn install_scratchpads<M, A, R>(
        &mut self,
        ctx: &mut BootContext<M, A, R>,
        count: u32,
        page_size: usize,
    ) -> Result<(), BringupError>
    where
        M: Mmio,
        A: PhysAllocator,
        R: TranslationRegime,
    {
        if count == 0 {
            return Ok(());
        }

        let array = ctx.allocate_zeroed(Resource::Scratchpad, count as usize * 8, DCBAA_ALIGN)?;
        for i in 0..u64::from(count) {
            let page = ctx.allocate_zeroed(Resource::Scratchpad, page_size, page_size)?;
            ctx.mmio.write64(array + i * 8, page);
        }
        self.set_entry(&ctx.mmio, 0, array);
        self.scratchpads = Some(array);
        log::debug!("{} scratchpad page(s) at {:#x}", count, array);
        Ok(())
    }
}
