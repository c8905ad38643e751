use alloc::format;
use alloc::vec::Vec;

use embedded_sdmmc::{Mode, SdCard, SdCardError, TimeSource, VolumeIdx, VolumeManager};
use flowmeter_core::StoreError;
use flowmeter_core::storage::FileSystem;

/// Record file on the card. FAT short names only: 8.3, upper case.
pub const SD_RECORD_FILE: &str = "WMETER.DAT";

/// These SD card operations are blocking. A save holds the SPI bus for a few
/// milliseconds, which the flush cadence makes acceptable.
///
/// embedded-sdmmc cannot rename files, so saves overwrite the record in
/// place and an interrupted save can tear it; the next load then falls
/// back to the compiled defaults.
pub struct SdFileSystem<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    volume_mgr: VolumeManager<SdCard<S, D>, T, 4, 4, 1>,
}

fn unavailable(e: embedded_sdmmc::Error<SdCardError>) -> StoreError {
    StoreError::MediaUnavailable(format!("SD card: {e:?}"))
}

fn write_failed(e: embedded_sdmmc::Error<SdCardError>) -> StoreError {
    StoreError::Write(format!("SD card: {e:?}"))
}

impl<S, D, T> SdFileSystem<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    pub fn new(sd_card: SdCard<S, D>, ts: T) -> Self {
        let volume_mgr = VolumeManager::new(sd_card, ts);

        Self { volume_mgr }
    }
}

impl<S, D, T> FileSystem for SdFileSystem<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    fn read(&mut self, path: &str) -> Result<Vec<u8>, StoreError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(unavailable)?;
        let root_dir = volume0.open_root_dir().map_err(unavailable)?;
        let file = root_dir
            .open_file_in_dir(path, Mode::ReadOnly)
            .map_err(unavailable)?;

        let mut data = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = file.read(&mut chunk).map_err(unavailable)?;
            if n == 0 {
                break; // EOF
            }
            data.extend_from_slice(&chunk[..n]);
        }

        file.close().map_err(unavailable)?;
        root_dir.close().map_err(unavailable)?;
        volume0.close().map_err(unavailable)?;

        Ok(data)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(write_failed)?;
        let root_dir = volume0.open_root_dir().map_err(write_failed)?;
        let file = root_dir
            .open_file_in_dir(path, Mode::ReadWriteCreateOrTruncate)
            .map_err(write_failed)?;

        file.write(data).map_err(write_failed)?;

        // Closing flushes the directory entry; report its errors too
        file.close().map_err(write_failed)?;
        root_dir.close().map_err(write_failed)?;
        volume0.close().map_err(write_failed)?;

        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StoreError> {
        Err(StoreError::Write(format!(
            "cannot rename {from} to {to}: not supported on the SD card"
        )))
    }

    fn remove(&mut self, path: &str) -> Result<(), StoreError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(write_failed)?;
        let root_dir = volume0.open_root_dir().map_err(write_failed)?;
        match root_dir.delete_file_in_dir(path) {
            Ok(()) | Err(embedded_sdmmc::Error::NotFound) => {}
            Err(e) => return Err(write_failed(e)),
        }
        root_dir.close().map_err(write_failed)?;
        volume0.close().map_err(write_failed)?;
        Ok(())
    }

    fn atomic_rename(&self) -> bool {
        false
    }
}
