//! ESP32-S3 firmware-specific modules for flowmeter
//!
//! This crate contains hardware-specific code that cannot compile on desktop
//! targets: the uptime-based wall clock, peripheral setup for the storage
//! media, and the FAT file system on the SD card.

#![no_std]

extern crate alloc;

#[cfg(all(feature = "storage-fram", feature = "storage-sd"))]
compile_error!("enable exactly one of the `storage-fram` and `storage-sd` features");
#[cfg(not(any(feature = "storage-fram", feature = "storage-sd")))]
compile_error!("enable one of the `storage-fram` and `storage-sd` features");

pub mod clock;
pub mod hardware;
#[cfg(feature = "storage-sd")]
pub mod sd_storage;
