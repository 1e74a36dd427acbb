// =============================================================================
// Tern OS - Bring-up Library
// =============================================================================
// Everything the boot sequence needs to get from "MMU off" to "devices
// usable": page tables, PCI BAR discovery, virtio and xHCI bring-up.
//
// Hardware is reached only through the traits in `hal`, so the logic here
// runs unchanged against the real machine and against the simulated bus used
// by the unit tests.
//
// SPDX-License-Identifier: GPL-2.0
// =============================================================================

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod context;
pub mod drivers;
pub mod error;
pub mod hal;
pub mod mm;
pub mod wait;

#[cfg(test)]
mod testing;

pub use context::BootContext;
pub use error::{BringupError, ErrorClass};
