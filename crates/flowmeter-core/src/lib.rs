//! Hardware-independent core library for flowmeter
//!
//! This crate contains the platform-agnostic logic of the flow-metering
//! device: the persisted state record, the storage backends for each physical
//! medium, the time codec shared by the wire formats, and the write-back
//! [`sync::SyncCoordinator`] that decides when the live pulse counter is
//! flushed to storage.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).
//! The `std` feature adds a host file system and a system clock.

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod announce;
pub mod clock;
pub mod config;
pub mod error;
pub mod pulse;
pub mod record;
pub mod storage;
pub mod sync;
pub mod time_codec;
pub mod volume;

pub use clock::Clock;
pub use error::{CalibrationError, FormatError, StoreError};
pub use pulse::PulseCounter;
pub use record::{Indicator, StateRecord};
pub use storage::Backend;
pub use sync::{SyncCoordinator, SyncState, TickOutcome};
