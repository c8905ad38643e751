//! Hardware initialization for the flowmeter
//!
//! Brings up the bus of whichever storage medium the firmware was built for
//! and wraps it in the matching backend. A medium that cannot be reached is
//! reported and replaced by RAM, so the device still counts (without
//! persistence) instead of refusing to boot.

use alloc::boxed::Box;

use flowmeter_core::Backend;
use flowmeter_core::storage::fixed_record::NVM_RECORD_LEN;
use flowmeter_core::storage::{MemoryNvm, NvmBackend};
use log::warn;

/// The backend the sync coordinator runs on
pub type FirmwareBackend = Box<dyn Backend>;

/// RAM stand-in used when the real medium is missing
pub fn volatile_backend() -> FirmwareBackend {
    warn!("Running on volatile storage; state will not survive a power cycle");
    Box::new(NvmBackend::new(MemoryNvm::new(NVM_RECORD_LEN), 0))
}

#[cfg(feature = "storage-fram")]
pub use fram::*;

#[cfg(feature = "storage-fram")]
mod fram {
    use esp_hal::Blocking;
    use esp_hal::i2c::master::{Config as I2cConfig, ConfigError, I2c};
    use esp_hal::peripherals::{GPIO12, GPIO13, I2C0};
    use esp_hal::time::Rate;
    use flowmeter_core::storage::{I2cFram, NvmBackend};
    use log::{info, warn};

    use super::{FirmwareBackend, volatile_backend};

    /// Offset of the record in the F-RAM
    const RECORD_OFFSET: u32 = 0;

    /// Initialize the I2C bus the F-RAM sits on
    ///
    /// 400 kHz; MB85RC parts accept up to 1 MHz.
    pub fn create_i2c_bus(
        i2c0: I2C0<'static>,
        sda: GPIO12<'static>,
        scl: GPIO13<'static>,
    ) -> Result<I2c<'static, Blocking>, ConfigError> {
        Ok(
            I2c::new(i2c0, I2cConfig::default().with_frequency(Rate::from_khz(400)))?
                .with_sda(sda)
                .with_scl(scl),
        )
    }

    /// NVM backend on the F-RAM at its default address
    pub fn fram_backend(i2c: I2c<'static, Blocking>) -> FirmwareBackend {
        match I2cFram::probe(i2c, I2cFram::<I2c<'static, Blocking>>::DEFAULT_ADDRESS) {
            Ok(fram) => {
                info!("State record in F-RAM at offset {}", RECORD_OFFSET);
                alloc::boxed::Box::new(NvmBackend::new(fram, RECORD_OFFSET))
            }
            Err(e) => {
                warn!("{}", e);
                volatile_backend()
            }
        }
    }
}

#[cfg(feature = "storage-sd")]
pub use sd::*;

#[cfg(feature = "storage-sd")]
mod sd {
    use embedded_hal_bus::spi::ExclusiveDevice;
    use esp_hal::delay::Delay;
    use esp_hal::gpio::{Level, Output, OutputConfig};
    use esp_hal::peripherals::{GPIO10, GPIO35, GPIO36, GPIO37, SPI2};
    use esp_hal::spi::master::{Config as SpiConfig, Spi};
    use esp_hal::time::Rate;
    use flowmeter_core::storage::FlatFileBackend;
    use log::{error, info};

    use super::{FirmwareBackend, volatile_backend};
    use crate::clock::{RtcClock, SdTime};
    use crate::sd_storage::{SD_RECORD_FILE, SdFileSystem};

    /// SPI pins of the card slot
    pub struct SdPins {
        pub sck: GPIO36<'static>,
        pub mosi: GPIO37<'static>,
        pub miso: GPIO35<'static>,
        pub cs: GPIO10<'static>,
    }

    /// Flat-file backend on the SD card
    ///
    /// The card is clocked at 400 kHz, the initialization rate every card
    /// supports.
    pub fn sd_backend(spi2: SPI2<'static>, pins: SdPins, clock: &'static RtcClock) -> FirmwareBackend {
        let spi_bus = match Spi::new(spi2, SpiConfig::default().with_frequency(Rate::from_khz(400))) {
            Ok(spi) => spi.with_sck(pins.sck).with_mosi(pins.mosi).with_miso(pins.miso),
            Err(e) => {
                error!("SPI configuration rejected: {:?}", e);
                return volatile_backend();
            }
        };
        let cs = Output::new(pins.cs, Level::High, OutputConfig::default());
        let Ok(device) = ExclusiveDevice::new(spi_bus, cs, Delay::new()) else {
            error!("SD card chip select unusable");
            return volatile_backend();
        };

        let card = embedded_sdmmc::SdCard::new(device, Delay::new());
        match card.num_bytes() {
            Ok(bytes) => info!("SD card found, {} MiB", bytes / (1024 * 1024)),
            Err(e) => {
                error!("No SD card: {:?}", e);
                return volatile_backend();
            }
        }

        alloc::boxed::Box::new(FlatFileBackend::new(
            SdFileSystem::new(card, SdTime(clock)),
            SD_RECORD_FILE,
        ))
    }
}
