// =============================================================================
// Tern OS - VirtIO GPU Class Setup
// =============================================================================
// Reads the virtio_gpu_config structure during bring-up. Scanout and
// resource management is left to the display driver proper.
// =============================================================================

use virtio_drivers::transport::DeviceType;

use super::virtio::{ClassSetup, VirtioDevice};
use crate::error::BringupError;
use crate::hal::Mmio;

// virtio_gpu_config
const EVENTS_READ: u64 = 0x00;
const NUM_SCANOUTS: u64 = 0x08;
const NUM_CAPSETS: u64 = 0x0C;

/// PCI device id of a modern virtio-gpu function.
pub const VIRTIO_GPU_DEVICE_ID: u16 = 0x1050;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuConfig {
    pub num_scanouts: u32,
    pub num_capsets: u32,
    pub pending_events: u32,
}

/// Class handler for virtio-gpu.
#[derive(Debug, Default)]
pub struct GpuSetup {
    /// Filled in once setup ran against a device config region
    pub config: Option<GpuConfig>,
}

impl<M: Mmio> ClassSetup<M> for GpuSetup {
    fn device_type(&self) -> DeviceType {
        DeviceType::GPU
    }

    fn setup(&mut self, mmio: &M, device: &VirtioDevice) -> Result<(), BringupError> {
        let Some(region) = device.device else {
            log::warn!("virtio-gpu exposes no device configuration");
            return Ok(());
        };

        let config = GpuConfig {
            num_scanouts: mmio.read32(region.base + NUM_SCANOUTS),
            num_capsets: mmio.read32(region.base + NUM_CAPSETS),
            pending_events: mmio.read32(region.base + EVENTS_READ),
        };
        log::info!(
            "virtio-gpu: {} scanout(s), {} capset(s)",
            config.num_scanouts,
            config.num_capsets
        );
        self.config = Some(config);
        Ok(())
    }
}
