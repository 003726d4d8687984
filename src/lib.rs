//! RV32IMA emulator over slow backing storage
//!
//! Guest RAM lives in a set of fixed-size storage units and is reached
//! through a direct-mapped write-back cache. A UART, a debug console CSR
//! channel, a core-local timer and a syscon register are enough to boot
//! a no-MMU Linux image.

pub mod config;
pub mod cpu;
pub mod devices;
pub mod error;
pub mod memory;
pub mod snapshot;
mod system;

pub use config::{
    BackingConfig, BackingKind, CacheConfig, Config, DtbConfig, FaultPolicy, TimingMode,
    RAM_IMAGE_OFFSET,
};
pub use cpu::{Cpu, StepOutcome};
pub use error::{ConfigError, Error, Result, StorageError};
pub use snapshot::{Counters, StateDump};
pub use system::{BootInfo, MachineExit, System};
