// =============================================================================
// Tern OS - Device Drivers
// =============================================================================

pub mod fw_cfg;
pub mod gpu;
pub mod pci;
pub mod virtio;
pub mod xhci;
