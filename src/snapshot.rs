//! Diagnostic state dump
//!
//! CPU state plus the cache and backing-store counters, taken when a session
//! is stopped from the host. Printed for the operator and optionally saved
//! to disk. RAM contents are not included; the backing store already holds
//! them (and outlives the process with file-backed units).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cpu::Cpu;
use crate::error::{Error, Result};
use crate::memory::{CacheStats, StorageStats};

/// Cache and backing-store traffic since boot (or the last reset)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub cache: CacheStats,
    pub storage: StorageStats,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StateDump {
    /// Version for compatibility checking
    pub version: u32,
    pub cpu: Cpu,
    pub counters: Counters,
}

impl StateDump {
    pub const VERSION: u32 = 1;

    pub fn new(cpu: &Cpu, counters: Counters) -> Self {
        StateDump {
            version: Self::VERSION,
            cpu: cpu.clone(),
            counters,
        }
    }

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(self)
            .map_err(|e| Error::Snapshot(format!("serialization error: {}", e)))?;

        zstd::stream::encode_all(&serialized[..], 3)
            .map_err(|e| Error::Snapshot(format!("compression error: {}", e)))
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let decompressed = zstd::stream::decode_all(data)
            .map_err(|e| Error::Snapshot(format!("decompression error: {}", e)))?;

        let dump: StateDump = bincode::deserialize(&decompressed)
            .map_err(|e| Error::Snapshot(format!("deserialization error: {}", e)))?;
        if dump.version != Self::VERSION {
            return Err(Error::Snapshot(format!(
                "unsupported dump version {}",
                dump.version
            )));
        }
        Ok(dump)
    }
}

impl fmt::Display for StateDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        writeln!(
            f,
            "Cache: hit: {}, accessed: {}",
            c.cache.hits, c.cache.accesses
        )?;
        writeln!(
            f,
            "RAM: read: {}, write: {}",
            c.storage.reads, c.storage.writes
        )?;
        write!(f, "{}", self.cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StateDump {
        let mut cpu = Cpu::new(0x10000);
        cpu.pc = 0x8000_1234;
        cpu.regs[2] = 0x8000_F000;
        cpu.csr.cycle = 4096;
        StateDump::new(
            &cpu,
            Counters {
                cache: CacheStats {
                    hits: 90,
                    accesses: 100,
                },
                storage: StorageStats {
                    reads: 10,
                    writes: 4,
                },
            },
        )
    }

    #[test]
    fn test_bytes_survive_compression() {
        let dump = sample();
        let back = StateDump::from_bytes(&dump.to_bytes().unwrap()).unwrap();
        assert_eq!(back.cpu.pc, 0x8000_1234);
        assert_eq!(back.cpu.regs[2], 0x8000_F000);
        assert_eq!(back.cpu.csr.cycle, 4096);
        assert_eq!(back.counters, dump.counters);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            StateDump::from_bytes(b"not a dump"),
            Err(Error::Snapshot(_))
        ));
    }

    #[test]
    fn test_display_reports_counters() {
        let text = sample().to_string();
        let header = "Cache: hit: 90, accessed: 100\nRAM: read: 10, write: 4\n";
        assert!(text.starts_with(header));
        assert!(text.contains("PC: 80001234"));
    }
}
