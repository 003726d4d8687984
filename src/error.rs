//! Error types
//!
//! Host-side failures only. Guest-visible faults are RISC-V traps and
//! never surface here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("backing store error: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to load guest image: {0}")]
    Image(#[source] std::io::Error),
    #[error("console write failed: {0}")]
    Console(#[source] std::io::Error),
    #[error("device tree error: {0}")]
    DeviceTree(String),
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("access of {len} bytes at 0x{addr:08x} exceeds backing capacity of {capacity} bytes")]
    OutOfRange {
        addr: u32,
        len: usize,
        capacity: u64,
    },
    #[error("unit {unit} I/O failure: {source}")]
    Io {
        unit: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("unit {unit} has capacity {actual}, expected {expected}")]
    CapacityMismatch {
        unit: usize,
        expected: u32,
        actual: u32,
    },
    #[error("no storage units configured")]
    NoUnits,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("RAM size {ram_size} exceeds backing capacity {capacity}")]
    RamExceedsBacking { ram_size: u32, capacity: u64 },
    #[error("RAM size must be a non-zero multiple of 4, got {0}")]
    BadRamSize(u32),
    #[error("cache line size {0} must be a power of two and at least 4")]
    BadLineSize(usize),
    #[error("cache line count {0} must be a non-zero power of two")]
    BadLineCount(usize),
    #[error("instructions per batch must be non-zero")]
    ZeroBatch,
    #[error("time divisor must be non-zero")]
    ZeroTimeDivisor,
    #[error("image chunk size must be non-zero")]
    ZeroChunk,
    #[error("RAM size {ram_size} would place guest memory past the 32-bit address space")]
    RamTooLarge { ram_size: u32 },
}
