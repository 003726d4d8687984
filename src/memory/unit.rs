//! Physical storage units
//!
//! A unit is one fixed-capacity chip (or file) addressed from zero. The
//! backing store concatenates units in order.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub trait StorageUnit: Send {
    /// Capacity in bytes
    fn capacity(&self) -> u32;
    /// Fill `buf` from `offset`. The range is within capacity.
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<()>;
    /// Store `data` at `offset`. The range is within capacity.
    fn write_at(&mut self, offset: u32, data: &[u8]) -> io::Result<()>;
}

/// Unit held in host memory
pub struct MemoryUnit {
    data: Vec<u8>,
}

impl MemoryUnit {
    pub fn new(capacity: u32) -> Self {
        MemoryUnit {
            data: vec![0u8; capacity as usize],
        }
    }
}

impl StorageUnit for MemoryUnit {
    fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u32, data: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Unit backed by a host file, sized to its capacity when opened
pub struct FileUnit {
    file: File,
    capacity: u32,
}

impl FileUnit {
    pub fn open(path: &Path, capacity: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(capacity as u64)?;
        Ok(FileUnit { file, capacity })
    }
}

impl StorageUnit for FileUnit {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u32, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(data)
    }
}
