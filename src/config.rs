//! Startup configuration
//!
//! Everything here is fixed once a [`System`](crate::System) is built.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Guest RAM starts here in the guest physical address space.
pub const RAM_IMAGE_OFFSET: u32 = 0x8000_0000;

/// Byte offset of the RAM-size cell in the stock mini-rv32ima style blobs.
pub const DEFAULT_DTB_RAM_OFFSET: usize = 0x13c;

const MB: u32 = 1024 * 1024;

/// How the timer is advanced between batches
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    /// Elapsed host microseconds since the previous batch
    WallClock,
    /// Derived from the executed instruction count
    Fixed,
}

/// What happens when an instruction raises an exception
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Route the cause into the guest's trap vector
    #[default]
    Delegate,
    /// Abort the batch and report `Fault`
    FailFast,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackingKind {
    Memory,
    File { dir: PathBuf },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackingConfig {
    pub unit_count: usize,
    pub unit_capacity: u32,
    pub kind: BackingKind,
}

impl Default for BackingConfig {
    fn default() -> Self {
        BackingConfig {
            unit_count: 2,
            unit_capacity: 8 * MB,
            kind: BackingKind::Memory,
        }
    }
}

impl BackingConfig {
    pub fn total_capacity(&self) -> u64 {
        self.unit_count as u64 * self.unit_capacity as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub line_size: usize,
    pub line_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            line_size: 64,
            line_count: 1024,
        }
    }
}

/// A device tree supplied from the host instead of the generated one
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtbConfig {
    pub path: PathBuf,
    #[serde(default = "default_dtb_ram_offset")]
    pub ram_size_offset: usize,
}

fn default_dtb_ram_offset() -> usize {
    DEFAULT_DTB_RAM_OFFSET
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Guest RAM in bytes
    pub ram_size: u32,
    pub backing: BackingConfig,
    pub cache: CacheConfig,
    pub timing: TimingMode,
    pub time_divisor: u32,
    pub fault_policy: FaultPolicy,
    pub instructions_per_batch: u32,
    pub idle_on_wait: bool,
    pub image_chunk_size: usize,
    pub keyboard_capacity: usize,
    pub dtb: Option<DtbConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ram_size: 16 * MB,
            backing: BackingConfig::default(),
            cache: CacheConfig::default(),
            timing: TimingMode::WallClock,
            time_divisor: 1,
            fault_policy: FaultPolicy::Delegate,
            instructions_per_batch: 1024,
            idle_on_wait: true,
            image_chunk_size: 4096,
            keyboard_capacity: 64,
            dtb: None,
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ram_size == 0 || self.ram_size % 4 != 0 {
            return Err(ConfigError::BadRamSize(self.ram_size));
        }
        if self.ram_size > u32::MAX - RAM_IMAGE_OFFSET + 1 {
            return Err(ConfigError::RamTooLarge {
                ram_size: self.ram_size,
            });
        }
        let capacity = self.backing.total_capacity();
        if self.ram_size as u64 > capacity {
            return Err(ConfigError::RamExceedsBacking {
                ram_size: self.ram_size,
                capacity,
            });
        }
        let line = self.cache.line_size;
        if line < 4 || !line.is_power_of_two() {
            return Err(ConfigError::BadLineSize(line));
        }
        let count = self.cache.line_count;
        if count == 0 || !count.is_power_of_two() {
            return Err(ConfigError::BadLineCount(count));
        }
        if self.instructions_per_batch == 0 {
            return Err(ConfigError::ZeroBatch);
        }
        if self.time_divisor == 0 {
            return Err(ConfigError::ZeroTimeDivisor);
        }
        if self.image_chunk_size == 0 {
            return Err(ConfigError::ZeroChunk);
        }
        Ok(())
    }
}
