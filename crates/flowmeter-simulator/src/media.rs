//! Host files standing in for the device's raw storage media

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use embedded_sdmmc::{Block, BlockCount, BlockDevice, BlockIdx};
use flowmeter_core::storage::NvmDevice;
use log::debug;

/// Size of the emulated F-RAM chip (MB85RC64, 64 Kbit)
pub const NVM_IMAGE_SIZE: u64 = 8 * 1024;

/// Block device backed by an image file.
///
/// `BlockDevice` methods take `&self`, so the file sits behind a `RefCell`.
pub struct FileBlockDevice {
    file: RefCell<File>,
    num_blocks: u32,
}

impl FileBlockDevice {
    /// Open or create an image of `num_blocks` zeroed blocks.
    pub fn open(path: &Path, num_blocks: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = u64::from(num_blocks) * Block::LEN as u64;
        if file.metadata()?.len() < len {
            debug!("Growing {} to {} blocks", path.display(), num_blocks);
            file.set_len(len)?;
        }
        Ok(Self {
            file: RefCell::new(file),
            num_blocks,
        })
    }

    fn offset(idx: BlockIdx) -> u64 {
        u64::from(idx.0) * Block::LEN as u64
    }
}

impl BlockDevice for FileBlockDevice {
    type Error = io::Error;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(Self::offset(start_block_idx)))?;
        for block in blocks {
            file.read_exact(&mut block.contents)?;
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(Self::offset(start_block_idx)))?;
        for block in blocks {
            file.write_all(&block.contents)?;
        }
        file.sync_data()
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount(self.num_blocks))
    }
}

/// Byte-addressed NVM backed by an image file. A new image starts erased.
pub struct FileNvm {
    file: File,
}

impl FileNvm {
    pub fn open(path: &Path, size: u64) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len < size {
            file.seek(SeekFrom::Start(len))?;
            file.write_all(&vec![0xFF; (size - len) as usize])?;
            file.sync_data()?;
        }
        Ok(Self { file })
    }
}

impl NvmDevice for FileNvm {
    type Error = io::Error;

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.file.seek(SeekFrom::Start(u64::from(address)))?;
        self.file.read_exact(buf)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.file.seek(SeekFrom::Start(u64::from(address)))?;
        self.file.write_all(data)?;
        self.file.sync_data()
    }
}
