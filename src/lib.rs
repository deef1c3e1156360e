#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! Self-contained USB DFU bootloader stack for a `usb-device` bus.
//!
//! ## About
//!
//! This crate implements the device side of firmware upgrades over USB for
//! bootloaders that enumerate as a DFU-mode device: a host running
//! `dfu-util` or vendor tooling can erase, write and read regions of
//! internal flash, external flash, or a configuration partition, entirely
//! through control transfers on endpoint zero.
//!
//! Unlike run-time DFU class crates, this one does not plug into
//! `usb_device::device::UsbDevice` — it brings its own chapter-9 device
//! core. [`DeviceCore`] sits directly on a [`usb_device::bus::UsbBus`]
//! implementation, decodes every Setup packet, answers the standard
//! enumeration requests itself and forwards class, vendor and interface
//! requests to a [`ClassDriver`]. The bundled [`DfuClassDriver`] implements
//! DFU protocol version 1.1a with the ST Microelectronics "DfuSe"
//! extensions (address pointer, sector erase, command discovery) as
//! specified by AN3156 and the USB Device Firmware Upgrade Specification,
//! Revision 1.1.
//!
//! Storage is pluggable: up to [`MAX_ALT_SETTINGS`] backends implementing
//! [`MediaAccessLayer`] register with the class driver, one per USB
//! alternate setting, and each one describes its partition layout to host
//! tooling through a DfuSe layout string. The crate also answers the
//! Microsoft OS descriptor requests (WCID) so Windows binds WinUSB to the
//! device without an INF file.
//!
//! ### Supported operations
//!
//! * Read (device to host) — upload command
//! * Write (host to device) — download command
//! * Sector erase and address pointer via DfuSe commands
//!
//! ### Not supported operations
//!
//! * Mass erase — reports `errTARGET`
//! * Read Unprotect — reports `errUNKNOWN`
//!
//! ## Execution model
//!
//! Everything runs synchronously from the USB interrupt: call
//! [`DeviceCore::poll()`] until it returns `false` whenever the peripheral
//! raises an event. The single exception is the [`ResetWatchdog`]: after a
//! download session has manifested, the class driver arms it, and a
//! low-priority main-loop task polls
//! [`check_reset()`](ResetWatchdog::check_reset) to learn when to detach the
//! bus and reset the system.
//!
//! ## Example
//!
//! ```no_run
//! use usbd_dfu_device::*;
//!
//! // Backend that exposes a RAM buffer as the upgradable "flash".
//! struct RamFlash {
//!     memory: [u8; 16 * 1024],
//! }
//!
//! const BASE: u32 = 0x0800_0000;
//!
//! impl MediaAccessLayer for RamFlash {
//!     fn validate(&self, address: u32, length: usize) -> bool {
//!         address >= BASE && (address - BASE) as usize + length <= self.memory.len()
//!     }
//!
//!     fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), MalError> {
//!         let offset = (address - BASE) as usize;
//!         buf.copy_from_slice(&self.memory[offset..offset + buf.len()]);
//!         Ok(())
//!     }
//!
//!     fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MalError> {
//!         let offset = (address - BASE) as usize;
//!         self.memory[offset..offset + data.len()].copy_from_slice(data);
//!         Ok(())
//!     }
//!
//!     fn erase(&mut self, address: u32, _length: usize) -> Result<(), MalError> {
//!         let offset = (address - BASE) as usize & !0xfff;
//!         self.memory[offset..offset + 4096].fill(0xff);
//!         Ok(())
//!     }
//!
//!     fn info_string(&self) -> &str {
//!         "@RAM/0x08000000/4*004Kg"
//!     }
//! }
//!
//! static WATCHDOG: ResetWatchdog = ResetWatchdog::new(RESET_POLL_TICKS);
//!
//! let mut flash = RamFlash { memory: [0xff; 16 * 1024] };
//! let mut dfu = DfuClassDriver::new(&WATCHDOG);
//! dfu.register_mal(0, &mut flash);
//!
//! // Bind `DeviceCore::new(bus, DeviceConfig { .. })` to the target's
//! // `usb_device::bus::UsbBus` implementation, then from the USB interrupt:
//! //
//! //     while device.poll(&mut dfu) {}
//! //
//! // and from the main loop, once per tick:
//! //
//! //     if WATCHDOG.check_reset() {
//! //         // detach USB and reset the system
//! //     }
//! ```

pub mod class;
pub mod control;
pub mod descriptor;
pub mod device;
pub mod mal;
pub mod setup;
pub mod watchdog;

/// DFU block transfer size in bytes, advertised as `wTransferSize`.
///
/// Matches the flash page granularity of the supported targets; every block
/// download and upload moves at most this many bytes through EP0.
pub const TRANSFER_SIZE: usize = 4096;

#[doc(inline)]
pub use crate::class::{
    ClassDriver, DfuClassDriver, DfuState, DfuStatus, DfuStatusCode, DfuseCommand,
    MAX_ALT_SETTINGS,
};
#[doc(inline)]
pub use crate::control::Control;
#[doc(inline)]
pub use crate::device::{DeviceConfig, DeviceCore, DeviceState};
#[doc(inline)]
pub use crate::mal::{MalError, MediaAccessLayer, PlaceholderMal, ReadOnlyMal};
#[doc(inline)]
pub use crate::setup::{Recipient, RequestType, SetupRequest};
#[doc(inline)]
pub use crate::watchdog::{ResetWatchdog, RESET_POLL_TICKS};
