//! Software-managed RAM cache
//!
//! Direct-mapped, write-back, write-allocate. The line index is the low bits
//! of the block number and the tag is the whole block number, so a tag can
//! only ever be resident in one slot. A dirty line is written back before
//! its slot is refilled with a different block.
//!
//! Set-associative lookup with LRU would raise the hit rate at the cost of
//! per-set recency bookkeeping; the direct-mapped table needs none.

use log::trace;
use serde::{Deserialize, Serialize};

use super::backing::BackingStore;
use crate::config::CacheConfig;
use crate::error::StorageError;

/// Cumulative lookup counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub accesses: u64,
}

#[derive(Clone, Copy, Default)]
struct Line {
    valid: bool,
    dirty: bool,
    /// Block number (address >> line_shift)
    tag: u32,
}

pub struct Cache {
    lines: Vec<Line>,
    /// line_count * line_size bytes, line i at i * line_size
    data: Vec<u8>,
    line_size: usize,
    line_shift: u32,
    index_mask: u32,
    stats: CacheStats,
    backing: BackingStore,
}

impl Cache {
    /// All lines start invalid. Geometry must already be validated.
    pub fn new(config: &CacheConfig, backing: BackingStore) -> Self {
        debug_assert!(config.line_size.is_power_of_two() && config.line_size >= 4);
        debug_assert!(config.line_count.is_power_of_two());
        Cache {
            lines: vec![Line::default(); config.line_count],
            data: vec![0u8; config.line_count * config.line_size],
            line_size: config.line_size,
            line_shift: config.line_size.trailing_zeros(),
            index_mask: (config.line_count - 1) as u32,
            stats: CacheStats::default(),
            backing,
        }
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    pub fn backing(&self) -> &BackingStore {
        &self.backing
    }

    /// Direct access to the store underneath. Writes made here are not seen
    /// by resident lines; invalidate first if the range may be cached.
    pub fn backing_mut(&mut self) -> &mut BackingStore {
        &mut self.backing
    }

    /// Copy `buf.len()` bytes at `addr` out of the cache.
    /// The range must not cross a line boundary.
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let start = self.lookup(addr, buf.len())?;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    /// Copy `data` into the cache at `addr`, marking the line dirty.
    /// The range must not cross a line boundary.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError> {
        let start = self.lookup(addr, data.len())?;
        self.data[start..start + data.len()].copy_from_slice(data);
        let index = (addr >> self.line_shift) & self.index_mask;
        self.lines[index as usize].dirty = true;
        Ok(())
    }

    pub fn read8(&mut self, addr: u32) -> Result<u8, StorageError> {
        let mut b = [0u8; 1];
        self.read(addr, &mut b)?;
        Ok(b[0])
    }

    pub fn read16(&mut self, addr: u32) -> Result<u16, StorageError> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read32(&mut self, addr: u32) -> Result<u32, StorageError> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write8(&mut self, addr: u32, value: u8) -> Result<(), StorageError> {
        self.write(addr, &[value])
    }

    pub fn write16(&mut self, addr: u32, value: u16) -> Result<(), StorageError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write32(&mut self, addr: u32, value: u32) -> Result<(), StorageError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Zero the counters. Cached contents are untouched.
    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
    }

    /// Write every dirty line back. Lines stay resident.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        for index in 0..self.lines.len() {
            let line = self.lines[index];
            if line.valid && line.dirty {
                self.write_back(index, line.tag)?;
                self.lines[index].dirty = false;
            }
        }
        Ok(())
    }

    /// Drop every line without writing anything back
    pub fn invalidate(&mut self) {
        self.lines.fill(Line::default());
    }

    /// Make the block holding `addr` resident and return the data offset of `addr`
    fn lookup(&mut self, addr: u32, len: usize) -> Result<usize, StorageError> {
        let block = addr >> self.line_shift;
        let index = (block & self.index_mask) as usize;
        let within = (addr as usize) & (self.line_size - 1);
        debug_assert!(
            within + len <= self.line_size,
            "access crosses a cache line"
        );

        self.stats.accesses += 1;
        let line = self.lines[index];
        if line.valid && line.tag == block {
            self.stats.hits += 1;
            return Ok(index * self.line_size + within);
        }

        if line.valid && line.dirty {
            trace!("evict block 0x{:x} from line {}", line.tag, index);
            self.write_back(index, line.tag)?;
        }
        self.fill(index, block)?;
        self.lines[index] = Line {
            valid: true,
            dirty: false,
            tag: block,
        };
        Ok(index * self.line_size + within)
    }

    fn write_back(&mut self, index: usize, tag: u32) -> Result<(), StorageError> {
        let base = tag << self.line_shift;
        let len = self.span(base);
        let start = index * self.line_size;
        self.backing.write(base, &self.data[start..start + len])
    }

    fn fill(&mut self, index: usize, block: u32) -> Result<(), StorageError> {
        let base = block << self.line_shift;
        let len = self.span(base);
        let start = index * self.line_size;
        self.backing.read(base, &mut self.data[start..start + len])
    }

    /// Bytes of the block at `base` that exist in the backing store
    fn span(&self, base: u32) -> usize {
        let remaining = self.backing.capacity().saturating_sub(base as u64);
        (self.line_size as u64).min(remaining) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackingConfig, BackingKind};
    use proptest::prelude::*;

    fn cache(line_size: usize, line_count: usize, capacity: u32) -> Cache {
        let backing = BackingStore::from_config(&BackingConfig {
            unit_count: 2,
            unit_capacity: capacity / 2,
            kind: BackingKind::Memory,
        })
        .unwrap();
        Cache::new(
            &CacheConfig {
                line_size,
                line_count,
            },
            backing,
        )
    }

    #[test]
    fn test_hits_after_first_miss() {
        let mut c = cache(64, 16, 64 * 1024);
        c.read32(0x100).unwrap();
        assert_eq!(
            c.stats(),
            CacheStats {
                hits: 0,
                accesses: 1,
            }
        );

        let k = 10;
        for i in 0..k {
            c.read32(0x100 + (i % 16) * 4).unwrap();
        }
        assert_eq!(
            c.stats(),
            CacheStats {
                hits: k as u64,
                accesses: k as u64 + 1,
            }
        );
    }

    #[test]
    fn test_write_survives_eviction() {
        let mut c = cache(64, 4, 64 * 1024);
        c.write32(0x40, 0xDEADBEEF).unwrap();
        // Same index (4 lines * 64 bytes apart), different tag
        c.read32(0x40 + 4 * 64).unwrap();
        assert!(c.backing().stats().writes >= 1);
        assert_eq!(c.read32(0x40).unwrap(), 0xDEADBEEF);

        let mut raw = [0u8; 4];
        c.backing_mut().read(0x40, &mut raw).unwrap();
        assert_eq!(u32::from_le_bytes(raw), 0xDEADBEEF);
    }

    #[test]
    fn test_write_allocate_fills_rest_of_line() {
        let mut c = cache(64, 4, 64 * 1024);
        c.backing_mut().write(0x80, &[0x11; 64]).unwrap();
        c.write8(0x81, 0x22).unwrap();
        assert_eq!(c.read8(0x80).unwrap(), 0x11);
        assert_eq!(c.read8(0x81).unwrap(), 0x22);
        assert_eq!(c.read16(0x82).unwrap(), 0x1111);
    }

    #[test]
    fn test_clean_eviction_does_not_write_back() {
        let mut c = cache(64, 4, 64 * 1024);
        c.read32(0).unwrap();
        c.read32(4 * 64).unwrap();
        assert_eq!(c.backing().stats().writes, 0);
        assert_eq!(c.backing().stats().reads, 2);
    }

    #[test]
    fn test_flush_and_invalidate() {
        let mut c = cache(64, 4, 64 * 1024);
        c.write16(0x10, 0xBEEF).unwrap();
        c.flush().unwrap();
        let mut raw = [0u8; 2];
        c.backing_mut().read(0x10, &mut raw).unwrap();
        assert_eq!(u16::from_le_bytes(raw), 0xBEEF);

        c.write16(0x10, 0x1234).unwrap();
        c.invalidate();
        assert_eq!(c.read16(0x10).unwrap(), 0xBEEF);
    }

    #[test]
    fn test_reset_stats_keeps_contents() {
        let mut c = cache(64, 4, 64 * 1024);
        c.write32(0x20, 7).unwrap();
        c.reset_stats();
        assert_eq!(c.stats(), CacheStats::default());
        assert_eq!(c.read32(0x20).unwrap(), 7);
        assert_eq!(
            c.stats(),
            CacheStats {
                hits: 1,
                accesses: 1,
            }
        );
    }

    #[test]
    fn test_last_block_clamped_to_capacity() {
        // 96-byte store, 64-byte lines: the second block is only half backed
        let units: Vec<Box<dyn crate::memory::StorageUnit>> =
            vec![Box::new(crate::memory::MemoryUnit::new(96))];
        let backing = BackingStore::new(units).unwrap();
        let config = CacheConfig {
            line_size: 64,
            line_count: 1,
        };
        let mut c = Cache::new(&config, backing);
        c.write32(92, 0xAABBCCDD).unwrap();
        c.read32(0).unwrap();
        let mut raw = [0u8; 4];
        c.backing_mut().read(92, &mut raw).unwrap();
        assert_eq!(u32::from_le_bytes(raw), 0xAABBCCDD);
    }

    proptest! {
        #[test]
        fn coherent_under_eviction(
            target in 0u32..16_384,
            value in any::<u32>(),
            others in proptest::collection::vec(0u32..16_384, 1..64),
        ) {
            let mut c = cache(32, 8, 64 * 1024);
            let addr = target & !3;
            c.write32(addr, value).unwrap();
            for other in others {
                let other = other & !3;
                if other != addr {
                    c.write32(other, other ^ 0x5A5A_5A5A).unwrap();
                }
            }
            prop_assert_eq!(c.read32(addr).unwrap(), value);
        }

        #[test]
        fn byte_writes_read_back(
            writes in proptest::collection::vec((0u32..8192, any::<u8>()), 1..128),
        ) {
            let mut c = cache(16, 4, 64 * 1024);
            let mut model = std::collections::HashMap::new();
            for (addr, value) in writes {
                c.write8(addr, value).unwrap();
                model.insert(addr, value);
            }
            for (addr, value) in model {
                prop_assert_eq!(c.read8(addr).unwrap(), value);
            }
        }
    }
}
