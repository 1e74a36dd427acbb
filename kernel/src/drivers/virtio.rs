// =============================================================================
// Tern OS - VirtIO PCI Bring-up
// =============================================================================
// Generic part of every virtio-pci driver: find the vendor capabilities,
// back the BARs they live in, and walk the device status register through
//
//   RESET -> ACKNOWLEDGE -> DRIVER -> FEATURES_OK -> (class setup) -> DRIVER_OK
//
// The status register is the only state; nothing is mirrored in memory.
// =============================================================================

use virtio_drivers::transport::{DeviceStatus, DeviceType};

use super::pci::{self, AssignedBar};
use crate::config::Window;
use crate::context::BootContext;
use crate::error::{BringupError, WaitFor};
use crate::hal::{Mmio, PhysAddr, PhysAllocator, TranslationRegime};
use crate::mm::{MemoryAttr, Privilege};
use crate::wait::spin_until;

pub const VIRTIO_VENDOR_ID: u16 = 0x1af4;

/// PCI_CAP_ID_VNDR
const CAP_VENDOR_SPECIFIC: u8 = 0x09;

// virtio_pci_cap
const CAP_NEXT: u64 = 1;
const CAP_CFG_TYPE: u64 = 3;
const CAP_BAR: u64 = 4;
const CAP_OFFSET: u64 = 8;
const CAP_LENGTH: u64 = 12;
const CAP_NOTIFY_OFF_MULTIPLIER: u64 = 16;

const CFG_COMMON: u8 = 1;
const CFG_NOTIFY: u8 = 2;
const CFG_ISR: u8 = 3;
const CFG_DEVICE: u8 = 4;

// virtio_pci_common_cfg
const DEVICE_FEATURE_SELECT: u64 = 0x00;
const DEVICE_FEATURE: u64 = 0x04;
const DRIVER_FEATURE_SELECT: u64 = 0x08;
const DRIVER_FEATURE: u64 = 0x0C;
const NUM_QUEUES: u64 = 0x12;
const DEVICE_STATUS: u64 = 0x14;

/// Virtio device type of a PCI device id: 0x1040 + type for modern
/// devices, a fixed table for transitional ones.
pub fn device_type_id(pci_device_id: u16) -> Option<u16> {
    match pci_device_id {
        0x1040..=0x107F => Some(pci_device_id - 0x1040),
        0x1000 => Some(1),
        0x1001 => Some(2),
        0x1002 => Some(5),
        0x1003 => Some(3),
        0x1004 => Some(8),
        0x1005 => Some(4),
        0x1009 => Some(9),
        _ => None,
    }
}

/// The device classes this kernel has names for.
pub fn device_type(id: u16) -> Option<DeviceType> {
    match id {
        1 => Some(DeviceType::Network),
        2 => Some(DeviceType::Block),
        3 => Some(DeviceType::Console),
        16 => Some(DeviceType::GPU),
        18 => Some(DeviceType::Input),
        19 => Some(DeviceType::Socket),
        _ => None,
    }
}

/// Where a capability says its structure lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRegion {
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioCapabilities {
    pub common: CapabilityRegion,
    pub notify: Option<CapabilityRegion>,
    pub notify_off_multiplier: u32,
    pub isr: Option<CapabilityRegion>,
    pub device: Option<CapabilityRegion>,
}

impl VirtioCapabilities {
    fn regions(&self) -> impl Iterator<Item = CapabilityRegion> {
        [Some(self.common), self.notify, self.isr, self.device]
            .into_iter()
            .flatten()
    }
}

/// Walk the capability list of the function at `function_base` and record
/// the first virtio capability of each type.
///
/// A list longer than `limit` nodes is treated as corrupt.
pub fn find_capabilities<M: Mmio>(
    mmio: &M,
    function_base: PhysAddr,
    limit: usize,
) -> Result<VirtioCapabilities, BringupError> {
    let mut next = pci::capabilities_pointer(mmio, function_base)
        .ok_or(BringupError::NoCapabilityList)?;

    let mut common = None;
    let mut notify = None;
    let mut notify_off_multiplier = 0;
    let mut isr = None;
    let mut device = None;

    let mut visited = 0;
    while next != 0 {
        if visited == limit {
            return Err(BringupError::CapabilityLoop { limit });
        }
        visited += 1;

        let cap = function_base + u64::from(next);
        if mmio.read8(cap) == CAP_VENDOR_SPECIFIC {
            let region = CapabilityRegion {
                bar: mmio.read8(cap + CAP_BAR),
                offset: mmio.read32(cap + CAP_OFFSET),
                length: mmio.read32(cap + CAP_LENGTH),
            };
            match mmio.read8(cap + CAP_CFG_TYPE) {
                CFG_COMMON if common.is_none() => common = Some(region),
                CFG_NOTIFY if notify.is_none() => {
                    notify = Some(region);
                    notify_off_multiplier = mmio.read32(cap + CAP_NOTIFY_OFF_MULTIPLIER);
                }
                CFG_ISR if isr.is_none() => isr = Some(region),
                CFG_DEVICE if device.is_none() => device = Some(region),
                _ => {}
            }
        }
        next = mmio.read8(cap + CAP_NEXT) & 0xFC;
    }

    Ok(VirtioCapabilities {
        common: common.ok_or(BringupError::CommonConfigMissing)?,
        notify,
        notify_off_multiplier,
        isr,
        device,
    })
}

/// Picks the driver feature set from the device's offer.
pub type FeaturePolicy = fn(offered: u64) -> u64;

/// Accept every offered feature.
pub fn accept_all(offered: u64) -> u64 {
    offered
}

/// A capability structure resolved to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioRegion {
    pub base: PhysAddr,
    pub length: u32,
}

/// A device that reached DRIVER_OK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtioDevice {
    pub function_base: PhysAddr,
    pub device_type: u16,
    pub bars: [Option<AssignedBar>; 6],
    pub common: VirtioRegion,
    pub notify: Option<VirtioRegion>,
    pub notify_off_multiplier: u32,
    pub isr: Option<VirtioRegion>,
    pub device: Option<VirtioRegion>,
    pub num_queues: u16,
    /// Features both sides agreed on
    pub features: u64,
}

impl VirtioDevice {
    pub fn kind(&self) -> Option<DeviceType> {
        device_type(self.device_type)
    }
}

/// Device-class specific setup, run after feature negotiation and before
/// DRIVER_OK.
pub trait ClassSetup<M: Mmio> {
    /// The class this handler drives.
    fn device_type(&self) -> DeviceType;

    fn setup(&mut self, mmio: &M, device: &VirtioDevice) -> Result<(), BringupError>;
}

/// The common configuration structure.
struct CommonCfg<'a, M: Mmio> {
    mmio: &'a M,
    base: PhysAddr,
}

impl<M: Mmio> CommonCfg<'_, M> {
    fn status(&self) -> u8 {
        self.mmio.read_barrier();
        self.mmio.read8(self.base + DEVICE_STATUS)
    }

    fn set_status(&self, status: DeviceStatus) {
        self.mmio.write8(self.base + DEVICE_STATUS, status.bits() as u8);
        self.mmio.write_barrier();
    }

    fn device_features(&self) -> u64 {
        self.mmio.write32(self.base + DEVICE_FEATURE_SELECT, 0);
        let low = self.mmio.read32(self.base + DEVICE_FEATURE);
        self.mmio.write32(self.base + DEVICE_FEATURE_SELECT, 1);
        let high = self.mmio.read32(self.base + DEVICE_FEATURE);
        (u64::from(high) << 32) | u64::from(low)
    }

    fn set_driver_features(&self, features: u64) {
        self.mmio.write32(self.base + DRIVER_FEATURE_SELECT, 0);
        self.mmio.write32(self.base + DRIVER_FEATURE, features as u32);
        self.mmio.write32(self.base + DRIVER_FEATURE_SELECT, 1);
        self.mmio.write32(self.base + DRIVER_FEATURE, (features >> 32) as u32);
    }

    fn num_queues(&self) -> u16 {
        self.mmio.read16(self.base + NUM_QUEUES)
    }

    /// Record an unrecoverable driver-side failure on top of `status`.
    fn fail(&self, status: DeviceStatus) {
        self.set_status(status | DeviceStatus::FAILED);
    }
}

/// Bring the virtio function at `function_base` to DRIVER_OK.
///
/// `policy` chooses the features to accept; the handler in `handlers` whose
/// class matches `device_type` runs before DRIVER_OK. No matching handler is
/// not an error.
pub fn virtio_setup<M, A, R>(
    ctx: &mut BootContext<M, A, R>,
    function_base: PhysAddr,
    device_type: u16,
    policy: FeaturePolicy,
    handlers: &mut [&mut dyn ClassSetup<M>],
) -> Result<VirtioDevice, BringupError>
where
    M: Mmio,
    A: PhysAllocator,
    R: TranslationRegime,
{
    let caps = find_capabilities(&ctx.mmio, function_base, ctx.config.capability_limit)?;

    let mut bars: [Option<AssignedBar>; 6] = [None; 6];
    for region in caps.regions() {
        let index = usize::from(region.bar);
        if index >= bars.len() {
            return Err(BringupError::EmptyBar {
                offset: pci::bar_offset(region.bar),
            });
        }
        if bars[index].is_none() {
            bars[index] = Some(pci::assign_bar(ctx, function_base, region.bar)?);
        }
    }
    pci::enable_device(&ctx.mmio, function_base)?;

    let resolve = |region: CapabilityRegion| -> VirtioRegion {
        let bar = bars[usize::from(region.bar)].map_or(0, |bar| bar.base);
        VirtioRegion {
            base: bar + u64::from(region.offset),
            length: region.length,
        }
    };
    let common = resolve(caps.common);
    let notify = caps.notify.map(resolve);
    let isr = caps.isr.map(resolve);
    let device_cfg = caps.device.map(resolve);

    for region in [Some(common), notify, isr, device_cfg].into_iter().flatten() {
        let window = Window::new(region.base, region.base + u64::from(region.length));
        ctx.pages
            .map_window_pages(window, MemoryAttr::Device, Privilege::Kernel);
    }

    let cfg = CommonCfg {
        mmio: &ctx.mmio,
        base: common.base,
    };

    cfg.set_status(DeviceStatus::empty());
    spin_until(ctx.config.spin_budget, WaitFor::DeviceReset, || cfg.status() == 0)?;

    let mut status = DeviceStatus::ACKNOWLEDGE;
    cfg.set_status(status);
    status |= DeviceStatus::DRIVER;
    cfg.set_status(status);

    let offered = cfg.device_features();
    let accepted = policy(offered);
    if accepted & !offered != 0 {
        log::warn!("policy asked for unoffered features {:#x}", accepted & !offered);
    }
    let features = accepted & offered;
    cfg.set_driver_features(features);
    ctx.mmio.write_barrier();

    status |= DeviceStatus::FEATURES_OK;
    cfg.set_status(status);
    let readback = cfg.status();
    if u32::from(readback) != status.bits() {
        cfg.fail(status.difference(DeviceStatus::FEATURES_OK));
        return Err(BringupError::FeaturesRejected { status: readback });
    }

    let device = VirtioDevice {
        function_base,
        device_type,
        bars,
        common,
        notify,
        notify_off_multiplier: caps.notify_off_multiplier,
        isr,
        device: device_cfg,
        num_queues: cfg.num_queues(),
        features,
    };

    let class = device.kind();
    match handlers
        .iter_mut()
        .find(|handler| Some(handler.device_type()) == class)
    {
        Some(handler) => {
            if let Err(err) = handler.setup(&ctx.mmio, &device) {
                cfg.fail(status);
                return Err(err);
            }
        }
        None => log::debug!("no class setup for virtio type {}", device_type),
    }

    status |= DeviceStatus::DRIVER_OK;
    cfg.set_status(status);
    log::info!(
        "virtio type {} ready, features {:#x}, {} queues",
        device_type,
        features,
        device.num_queues
    );
    Ok(device)
}
