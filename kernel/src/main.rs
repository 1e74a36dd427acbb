// =============================================================================
// Tern OS - Kernel Entry Point
// =============================================================================
// Called from boot.S on the boot core with a stack and a zeroed BSS. Brings
// up the console, the heap, the identity map, the virtio GPU and the xHCI
// controller, then parks the core.
//
// SPDX-License-Identifier: GPL-2.0
// =============================================================================

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use tern_arch_arm64::{self as arch, cpu, println};
#[cfg(target_os = "none")]
use tern_kernel::{
    config::{BringupConfig, Window, FW_CFG_DMA, UART_BASE},
    drivers::{
        fw_cfg::FwCfgDma,
        gpu::{GpuSetup, VIRTIO_GPU_DEVICE_ID},
        pci,
        virtio::{self, accept_all, virtio_setup, ClassSetup, VirtioDevice, VIRTIO_VENDOR_ID},
        xhci::{xhci_init, XhciController},
    },
    hal::{
        arm64::{El1Regime, PhysMmio},
        TranslationRegime,
    },
    mm::heap::{self, HeapFrames},
    BootContext, BringupError,
};

/// Tern OS version
#[cfg(target_os = "none")]
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Devices that finished bring-up, kept for the drivers that follow.
#[cfg(target_os = "none")]
struct Devices {
    gpu: Option<VirtioDevice>,
    xhci: XhciController,
}

#[cfg(target_os = "none")]
static DEVICES: spin::Mutex<Option<Devices>> = spin::Mutex::new(None);

#[cfg(target_os = "none")]
type Context = BootContext<PhysMmio, HeapFrames, El1Regime>;

/// Kernel main entry point.
///
/// # Safety
/// Called exactly once, by the boot assembly, with the MMU off.
#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    // SAFETY: first and only call, MMU still off
    unsafe { arch::init(log::LevelFilter::Debug) };
    heap::init();
    print_banner();

    match bring_up() {
        Ok(()) => log::info!("bring-up complete, parking boot core"),
        Err(err) => log::error!(
            "bring-up failed: {} (code {}, {:?})",
            err,
            err.code(),
            err.class()
        ),
    }
    cpu::halt();
}

#[cfg(target_os = "none")]
fn bring_up() -> Result<(), BringupError> {
    let mut ctx: Context = BootContext::new(
        PhysMmio,
        HeapFrames,
        El1Regime,
        BringupConfig::qemu_virt(),
    );

    let layout = ctx.config.layout;
    let (start, end) = arch::image_bounds();
    let image = Window::new(start, end);
    log::info!(
        "image {:#x}..{:#x} ({} KiB)",
        image.start,
        image.end,
        image.len() / 1024
    );
    if !layout.covers_image(image) {
        return Err(BringupError::ImageNotMapped { start, end });
    }

    // SAFETY: the QEMU virt layout covers the image, heap, UART and ECAM
    unsafe {
        ctx.pages.init(&layout, |pages| {
            log::info!(
                "MMU {}, UART -> {:?}",
                if pages.regime().is_enabled() { "on" } else { "off" },
                pages.translate(UART_BASE)
            );
        })
    };

    let fw_cfg = FwCfgDma::new(&mut ctx, FW_CFG_DMA)?;
    match fw_cfg.file_count(&ctx.mmio) {
        Ok(files) => log::info!("fw_cfg: {} files", files),
        Err(err) => log::warn!("fw_cfg unavailable: {}", err),
    }

    let gpu = bring_up_gpu(&mut ctx)?;

    let xhci = xhci_init(&mut ctx)?;
    let connected = xhci.poll_ports(&ctx.mmio);
    log::info!(
        "USB: {} port(s), connected bitmap {:#x}",
        xhci.caps.max_ports,
        connected
    );

    *DEVICES.lock() = Some(Devices { gpu, xhci });
    Ok(())
}

/// A missing GPU is fine; a GPU that fails bring-up is not.
#[cfg(target_os = "none")]
fn bring_up_gpu(ctx: &mut Context) -> Result<Option<VirtioDevice>, BringupError> {
    let function = match pci::find_device(&ctx.mmio, &ctx.config, VIRTIO_VENDOR_ID, VIRTIO_GPU_DEVICE_ID) {
        Ok(function) => function,
        Err(err) => {
            log::warn!("{}", err);
            return Ok(None);
        }
    };

    let device_type = virtio::device_type_id(function.device_id).unwrap_or(0);
    let mut gpu = GpuSetup::default();
    let mut handlers: [&mut dyn ClassSetup<PhysMmio>; 1] = [&mut gpu];
    let device = virtio_setup(ctx, function.base, device_type, accept_all, &mut handlers)?;
    Ok(Some(device))
}

#[cfg(target_os = "none")]
fn print_banner() {
    println!();
    println!(r"  _____                    ___  ____  ");
    println!(r" |_   _|__ _ __ _ __      / _ \/ ___| ");
    println!(r"   | |/ _ \ '__| '_ \    | | | \___ \ ");
    println!(r"   | |  __/ |  | | | |   | |_| |___) |");
    println!(r"   |_|\___|_|  |_| |_|    \___/|____/ ");
    println!();
    println!("Tern OS v{} (EL{})", VERSION, cpu::current_el());
    println!("============================================================");
}

/// Print what we know and halt.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    cpu::disable_interrupts();
    println!();
    println!("!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!");
    println!("!!                     KERNEL PANIC                        !!");
    println!("!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!");
    if let Some(location) = info.location() {
        println!(
            "Location: {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    println!("Message: {}", info.message());
    println!("System halted.");
    cpu::halt();
}

/// The kernel only runs on bare metal; host builds exist for the unit tests
/// of the library.
#[cfg(not(target_os = "none"))]
fn main() {}
