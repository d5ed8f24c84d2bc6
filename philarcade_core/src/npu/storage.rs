// SPDX-License-Identifier: GPL-3.0
// storage.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// Every storage device is addressed in sectors of this many bytes.
pub const SECTOR_SIZE: usize = 0x200;

/// Size of the card's RAM disk.
pub const RAM_DISK_BYTES: usize = 0x900000;

pub type Sector = [u8; SECTOR_SIZE];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sector {lba} is past the end of a {sectors} sector device")]
    OutOfRange { lba: u64, sectors: u64 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// This trait is a block device made of fixed-size sectors.
pub trait Storage: Send {

    /// Implementations must return the device size in sectors.
    fn sector_count(&self) -> u64;

    fn read_sector(&mut self, lba: u64, buffer: &mut Sector) -> Result<(), StorageError>;

    fn write_sector(&mut self, lba: u64, buffer: &Sector) -> Result<(), StorageError>;
}

/// This struct is a zero-filled storage device held in memory.
pub struct MemoryStorage {
    data: Vec<u8>,
}

impl MemoryStorage {

    /// Creates a device of `bytes` bytes, rounded down to whole sectors.
    pub fn new(bytes: usize) -> Self {
        MemoryStorage {
            data: vec![0; bytes - bytes % SECTOR_SIZE],
        }
    }

    fn range(&self, lba: u64) -> Result<std::ops::Range<usize>, StorageError> {

        if lba >= self.sector_count() {
            return Err(StorageError::OutOfRange { lba, sectors: self.sector_count() });
        }
        let start = lba as usize * SECTOR_SIZE;
        Ok(start..start + SECTOR_SIZE)
    }
}

impl Storage for MemoryStorage {

    fn sector_count(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read_sector(&mut self, lba: u64, buffer: &mut Sector) -> Result<(), StorageError> {

        let range = self.range(lba)?;
        buffer.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_sector(&mut self, lba: u64, buffer: &Sector) -> Result<(), StorageError> {

        let range = self.range(lba)?;
        self.data[range].copy_from_slice(buffer);
        Ok(())
    }
}

/// This struct is a storage device backed by a raw disk image file.
pub struct FileStorage {
    file: File,
    sectors: u64,
}

impl FileStorage {

    /// Opens an existing image for reading and writing.
    pub fn open(path: &Path) -> Result<Self, StorageError> {

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let sectors = file.metadata()?.len() / SECTOR_SIZE as u64;
        Ok(FileStorage { file, sectors })
    }

    /// Creates (or truncates) an image of the given number of zeroed sectors.
    pub fn create(path: &Path, sectors: u64) -> Result<Self, StorageError> {

        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        file.set_len(sectors * SECTOR_SIZE as u64)?;
        Ok(FileStorage { file, sectors })
    }

    fn seek_to(&mut self, lba: u64) -> Result<(), StorageError> {

        if lba >= self.sectors {
            return Err(StorageError::OutOfRange { lba, sectors: self.sectors });
        }
        self.file.seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))?;
        Ok(())
    }
}

impl Storage for FileStorage {

    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&mut self, lba: u64, buffer: &mut Sector) -> Result<(), StorageError> {

        self.seek_to(lba)?;
        self.file.read_exact(buffer)?;
        Ok(())
    }

    fn write_sector(&mut self, lba: u64, buffer: &Sector) -> Result<(), StorageError> {

        self.seek_to(lba)?;
        self.file.write_all(buffer)?;
        Ok(())
    }
}
