//! # Crate to flash and provision Betaflight flight controllers
//!
//! This crate talks to a flight controller running Betaflight over its USB
//! serial port using the MultiWii Serial Protocol (MSP v1), and flashes new
//! firmware through the STM32 USB DFU bootloader.
//!
//! A complete flashing session, driven by [`Flasher`], goes through these
//! steps:
//! - Ask the running firmware to reboot into its DFU bootloader, unless a DFU
//!   device is already present.
//! - Wait for the DFU device and download the firmware image, patched with the
//!   build's custom defaults when the image has room for them.
//! - Wait for the serial port to come back, identify the device over MSP, and
//!   reset it to its custom defaults when it supports and carries some.
//!
//! # Firmware images
//!
//! Images are read from Intel HEX files into a sparse [`FirmwareImage`].
//! Custom defaults are embedded in the first erased area after the custom
//! defaults pointer. See [`firmware`].
//!
//! # Collaborators
//!
//! USB DFU enumeration and transfer live behind [`dfu::DfuBackend`], serial
//! port enumeration behind [`serial::SerialPorts`], and build metadata behind
//! [`build_info::BuildMetadataSource`]. The production implementations are
//! [`UsbDfu`], [`SystemSerialPorts`] and [`build_info::JsonDirSource`].
//!
//! Configuration backups produced by the firmware's `diff` command can be
//! replayed with [`backup::restore_backup`].
//!
//! See the demos in the repository for a command line front end.

#![deny(missing_docs)]

pub mod backup;
pub mod build_info;
pub mod codes;
pub mod device;
pub mod dfu;
pub mod error;
pub mod firmware;
pub mod flasher;
mod msplink;
pub mod options;
pub mod packets;
pub mod payload;
pub mod serial;

pub use codes::MspCode;
pub use device::DeviceState;
pub use dfu::UsbDfu;
pub use error::{Error, Result};
pub use firmware::FirmwareImage;
pub use flasher::Flasher;
pub use msplink::MspLink;
pub use options::{FlashOptions, RestoreOptions};
pub use serial::SystemSerialPorts;
