// =============================================================================
// Tern OS - QEMU fw_cfg DMA
// =============================================================================
// The DMA interface takes the address of a big-endian access record
//
//   { be32 control, be32 length, be64 address }
//
// written (also big-endian) to the DMA register. The device clears control
// when done, leaving only the ERROR bit if the transfer failed.
// =============================================================================

use crate::context::BootContext;
use crate::error::{BringupError, Resource, WaitFor};
use crate::hal::{Mmio, PhysAddr, PhysAllocator, TranslationRegime};
use crate::wait::spin_until;

pub const CONTROL_ERROR: u32 = 1 << 0;
pub const CONTROL_READ: u32 = 1 << 1;
pub const CONTROL_SKIP: u32 = 1 << 2;
pub const CONTROL_SELECT: u32 = 1 << 3;
pub const CONTROL_WRITE: u32 = 1 << 4;

/// Selector of the file directory; starts with a be32 entry count.
pub const FILE_DIR: u16 = 0x19;

const RECORD_SIZE: usize = 16;

pub struct FwCfgDma {
    register: PhysAddr,
    record: PhysAddr,
    spin_budget: u32,
}

impl FwCfgDma {
    /// Set up DMA through `register`, with the access record and a scratch
    /// dword taken from the allocator.
    pub fn new<M, A, R>(ctx: &mut BootContext<M, A, R>, register: PhysAddr) -> Result<Self, BringupError>
    where
        M: Mmio,
        A: PhysAllocator,
        R: TranslationRegime,
    {
        let record = ctx.allocate_zeroed(Resource::DmaRecord, RECORD_SIZE * 2, RECORD_SIZE)?;
        Ok(Self {
            register,
            record,
            spin_budget: ctx.config.spin_budget,
        })
    }

    /// Run one DMA transfer and wait for the device to finish it.
    pub fn transfer<M: Mmio>(
        &self,
        mmio: &M,
        control: u32,
        len: u32,
        addr: PhysAddr,
    ) -> Result<(), BringupError> {
        mmio.write32(self.record, control.to_be());
        mmio.write32(self.record + 4, len.to_be());
        mmio.write64(self.record + 8, addr.to_be());
        mmio.write_barrier();

        mmio.write64(self.register, self.record.to_be());
        mmio.write_barrier();

        let status = || {
            mmio.read_barrier();
            u32::from_be(mmio.read32(self.record))
        };
        spin_until(self.spin_budget, WaitFor::DmaIdle, || {
            status() & !CONTROL_ERROR == 0
        })?;

        if status() & CONTROL_ERROR != 0 {
            log::warn!("fw_cfg DMA {:#x} failed", control);
            return Err(BringupError::DmaFailed);
        }
        Ok(())
    }

    /// Select `key` and read `len` bytes of it into `addr`.
    pub fn read_item<M: Mmio>(&self, mmio: &M, key: u16, len: u32, addr: PhysAddr) -> Result<(), BringupError> {
        let control = (u32::from(key) << 16) | CONTROL_SELECT | CONTROL_READ;
        self.transfer(mmio, control, len, addr)
    }

    /// Number of entries in the fw_cfg file directory.
    pub fn file_count<M: Mmio>(&self, mmio: &M) -> Result<u32, BringupError> {
        let scratch = self.record + RECORD_SIZE as u64;
        self.read_item(mmio, FILE_DIR, 4, scratch)?;
        Ok(u32::from_be(mmio.read32(scratch)))
    }
}
