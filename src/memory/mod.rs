//! Memory subsystem
//!
//! Guest RAM lives in a [`BackingStore`] made of fixed-capacity units and is
//! reached only through the direct-mapped write-back [`Cache`]. The CPU never
//! sees either directly: every load, store and custom CSR access goes through
//! the [`Bus`] capability it is handed.
//!
//! Guest physical layout:
//! 0x10000000 - 0x10000007: UART (8250 subset)
//! 0x11004000 - 0x11004007: CLINT timermatch (core-local)
//! 0x1100bff8 - 0x1100bfff: CLINT timer (core-local)
//! 0x11100000:              syscon
//! 0x80000000 - ...:        RAM (RAM_IMAGE_OFFSET)

mod backing;
mod cache;
mod unit;

pub use backing::{BackingStore, StorageStats};
pub use cache::{Cache, CacheStats};
pub use unit::{FileUnit, MemoryUnit, StorageUnit};

use crate::error::StorageError;

/// Why a bus access could not be completed
#[derive(Debug)]
pub enum BusError {
    /// Nothing answers at this guest address. Becomes a guest access fault.
    Unmapped(u32),
    /// The backing store failed underneath the cache. Ends the session.
    Storage(StorageError),
}

impl From<StorageError> for BusError {
    fn from(e: StorageError) -> Self {
        BusError::Storage(e)
    }
}

/// Bus interface for CPU memory and custom CSR access
///
/// Addresses are guest physical addresses. Accesses are naturally aligned;
/// the CPU raises misaligned traps before calling in.
pub trait Bus {
    fn read8(&mut self, addr: u32) -> Result<u8, BusError>;
    fn read16(&mut self, addr: u32) -> Result<u16, BusError>;
    fn read32(&mut self, addr: u32) -> Result<u32, BusError>;
    fn write8(&mut self, addr: u32, value: u8) -> Result<(), BusError>;
    fn write16(&mut self, addr: u32, value: u16) -> Result<(), BusError>;
    fn write32(&mut self, addr: u32, value: u32) -> Result<(), BusError>;

    /// Read a CSR the core does not implement itself
    fn csr_read(&mut self, csr: u32) -> Result<u32, BusError>;
    /// Write a CSR the core does not implement itself
    fn csr_write(&mut self, csr: u32, value: u32) -> Result<(), BusError>;
}
