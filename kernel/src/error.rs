// =============================================================================
// Tern OS - Bring-up Errors
// =============================================================================
// Every failure the bring-up paths can report. Each variant carries a stable
// negative code for the boot diagnostic and belongs to one error class.
// =============================================================================

use thiserror_no_std::Error;

/// Memory a bring-up step allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Resource {
    Bar = 0,
    Dcbaa = 1,
    CommandRing = 2,
    EventRing = 3,
    EventRingSegmentTable = 4,
    Scratchpad = 5,
    DmaRecord = 6,
}

/// Hardware conditions bring-up spins on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaitFor {
    /// virtio device status reading back 0 after a reset
    DeviceReset = 0,
    /// xHCI USBSTS.CNR clearing
    ControllerReady = 1,
    /// xHCI USBSTS.HCH clearing after Run/Stop
    ControllerRunning = 2,
    /// fw_cfg DMA control word going idle
    DmaIdle = 3,
}

/// The four failure families of bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A status bit never reached the expected state within the spin budget.
    HardwareNotReady,
    /// The allocator could not satisfy a sized, aligned request.
    ResourceExhausted,
    /// The device answered outside the protocol (missing capability,
    /// mismatched readback, runaway list).
    ProtocolViolation,
    /// The device is well-formed but unusable by this kernel.
    UnsupportedConfiguration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BringupError {
    #[error("no PCI function {vendor:#06x}:{device:#06x}")]
    DeviceNotFound { vendor: u16, device: u16 },
    #[error("PCI command register rejected the enables (read back {command:#06x})")]
    EnableRejected { command: u16 },
    #[error("BAR at config offset {offset:#x} decodes no memory window")]
    EmptyBar { offset: u16 },
    #[error("BAR backing at {addr:#x} does not fit a 32-bit BAR")]
    BarUnreachable { addr: u64 },
    #[error("out of memory for {resource:?} ({size:#x} bytes)")]
    OutOfMemory { resource: Resource, size: usize },
    #[error("timed out waiting for {0:?}")]
    Timeout(WaitFor),
    #[error("device status reports no capability list")]
    NoCapabilityList,
    #[error("virtio common configuration capability not found")]
    CommonConfigMissing,
    #[error("capability list did not terminate within {limit} nodes")]
    CapabilityLoop { limit: usize },
    #[error("device rejected the negotiated features (status {status:#04x})")]
    FeaturesRejected { status: u8 },
    #[error("controller reports zero device slots")]
    NoDeviceSlots,
    #[error("controller reports zero root hub ports")]
    NoPorts,
    #[error("fw_cfg DMA transfer reported an error")]
    DmaFailed,
    #[error("kernel image {start:#x}..{end:#x} lies outside the kernel window")]
    ImageNotMapped { start: u64, end: u64 },
}

impl BringupError {
    /// Stable negative status code, distinct per variant (and per resource
    /// or wait condition).
    pub fn code(&self) -> i32 {
        match self {
            Self::DeviceNotFound { .. } => -1,
            Self::EnableRejected { .. } => -2,
            Self::EmptyBar { .. } => -3,
            Self::BarUnreachable { .. } => -4,
            Self::ImageNotMapped { .. } => -5,
            Self::NoCapabilityList => -16,
            Self::CommonConfigMissing => -17,
            Self::CapabilityLoop { .. } => -18,
            Self::FeaturesRejected { .. } => -19,
            Self::NoDeviceSlots => -32,
            Self::NoPorts => -33,
            Self::DmaFailed => -48,
            Self::OutOfMemory { resource, .. } => -64 - *resource as i32,
            Self::Timeout(wait) => -80 - *wait as i32,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) => ErrorClass::HardwareNotReady,
            Self::OutOfMemory { .. } => ErrorClass::ResourceExhausted,
            Self::NoDeviceSlots
            | Self::NoPorts
            | Self::BarUnreachable { .. }
            | Self::ImageNotMapped { .. } => ErrorClass::UnsupportedConfiguration,
            Self::DeviceNotFound { .. }
            | Self::EnableRejected { .. }
            | Self::EmptyBar { .. }
            | Self::NoCapabilityList
            | Self::CommonConfigMissing
            | Self::CapabilityLoop { .. }
            | Self::FeaturesRejected { .. }
            | Self::DmaFailed => ErrorClass::ProtocolViolation,
        }
    }
}
