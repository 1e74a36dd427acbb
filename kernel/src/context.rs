// =============================================================================
// Tern OS - Boot Context
// =============================================================================
// The collaborators every bring-up step needs, gathered in one place and
// passed down by reference. Nothing here is global: the boot path owns the
// context, tests build their own over a simulated bus.
// =============================================================================

use crate::config::BringupConfig;
use crate::error::{BringupError, Resource};
use crate::hal::{Mmio, PhysAddr, PhysAllocator, TranslationRegime};
use crate::mm::PageTableManager;

pub struct BootContext<M: Mmio, A: PhysAllocator, R: TranslationRegime> {
    pub mmio: M,
    pub alloc: A,
    pub pages: PageTableManager<R>,
    pub config: BringupConfig,
}

impl<M: Mmio, A: PhysAllocator, R: TranslationRegime> BootContext<M, A, R> {
    pub fn new(mmio: M, alloc: A, regime: R, config: BringupConfig) -> Self {
        Self {
            mmio,
            alloc,
            pages: PageTableManager::new(regime),
            config,
        }
    }

    /// Allocate zeroed, aligned memory for `resource`.
    pub fn allocate_zeroed(
        &mut self,
        resource: Resource,
        size: usize,
        align: usize,
    ) -> Result<PhysAddr, BringupError> {
        let addr = self
            .alloc
            .allocate(size, align)
            .ok_or(BringupError::OutOfMemory { resource, size })?;
        self.mmio.zero(addr, size);
        Ok(addr)
    }
}
