//! Backing store
//!
//! Concatenates equally sized units into one flat byte space and splits
//! transfers that straddle a unit boundary.

use log::info;
use serde::{Deserialize, Serialize};

use super::unit::{FileUnit, MemoryUnit, StorageUnit};
use crate::config::{BackingConfig, BackingKind};
use crate::error::StorageError;

/// Transfer counters, one per read or write request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub reads: u64,
    pub writes: u64,
}

pub struct BackingStore {
    units: Vec<Box<dyn StorageUnit>>,
    unit_capacity: u32,
    stats: StorageStats,
}

impl BackingStore {
    /// Build from already opened units. All units must share one capacity.
    pub fn new(units: Vec<Box<dyn StorageUnit>>) -> Result<Self, StorageError> {
        let unit_capacity = units.first().ok_or(StorageError::NoUnits)?.capacity();
        for (unit, u) in units.iter().enumerate() {
            if u.capacity() != unit_capacity {
                return Err(StorageError::CapacityMismatch {
                    unit,
                    expected: unit_capacity,
                    actual: u.capacity(),
                });
            }
        }
        Ok(BackingStore {
            units,
            unit_capacity,
            stats: StorageStats::default(),
        })
    }

    /// Open every configured unit
    pub fn from_config(config: &BackingConfig) -> Result<Self, StorageError> {
        let mut units: Vec<Box<dyn StorageUnit>> = Vec::with_capacity(config.unit_count);
        for unit in 0..config.unit_count {
            match &config.kind {
                BackingKind::Memory => units.push(Box::new(MemoryUnit::new(config.unit_capacity))),
                BackingKind::File { dir } => {
                    let path = dir.join(format!("unit{}.bin", unit));
                    let file = FileUnit::open(&path, config.unit_capacity)
                        .map_err(|source| StorageError::Io { unit, source })?;
                    info!("storage unit {} -> {}", unit, path.display());
                    units.push(Box::new(file));
                }
            }
        }
        Self::new(units)
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.units.len() as u64 * self.unit_capacity as u64
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_range(addr, buf.len())?;
        self.stats.reads += 1;
        let mut done = 0;
        while done < buf.len() {
            let (unit, offset, n) = self.locate(addr as u64 + done as u64, buf.len() - done);
            self.units[unit]
                .read_at(offset, &mut buf[done..done + n])
                .map_err(|source| StorageError::Io { unit, source })?;
            done += n;
        }
        Ok(())
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError> {
        self.check_range(addr, data.len())?;
        self.stats.writes += 1;
        let mut done = 0;
        while done < data.len() {
            let (unit, offset, n) = self.locate(addr as u64 + done as u64, data.len() - done);
            self.units[unit]
                .write_at(offset, &data[done..done + n])
                .map_err(|source| StorageError::Io { unit, source })?;
            done += n;
        }
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = StorageStats::default();
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<(), StorageError> {
        if addr as u64 + len as u64 > self.capacity() {
            return Err(StorageError::OutOfRange {
                addr,
                len,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// (unit, offset in unit, bytes available in that unit up to `len`)
    #[inline]
    fn locate(&self, addr: u64, len: usize) -> (usize, u32, usize) {
        let cap = self.unit_capacity as u64;
        let unit = (addr / cap) as usize;
        let offset = (addr % cap) as u32;
        let n = len.min((cap - offset as u64) as usize);
        (unit, offset, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store(units: usize, capacity: u32) -> BackingStore {
        BackingStore::from_config(&BackingConfig {
            unit_count: units,
            unit_capacity: capacity,
            kind: BackingKind::Memory,
        })
        .unwrap()
    }

    #[test]
    fn test_round_trip_across_unit_boundary() {
        let mut bs = store(2, 256);
        let data: Vec<u8> = (0..32).collect();
        bs.write(240, &data).unwrap();

        let mut back = vec![0u8; 32];
        bs.read(240, &mut back).unwrap();
        assert_eq!(back, data);

        // Second half really landed at the start of unit 1
        let mut first = [0u8; 4];
        bs.read(256, &mut first).unwrap();
        assert_eq!(first, [16, 17, 18, 19]);
    }

    #[test]
    fn test_out_of_range_is_an_error() {
        let mut bs = store(2, 256);
        let mut buf = [0u8; 8];
        assert!(matches!(
            bs.read(508, &mut buf),
            Err(StorageError::OutOfRange {
                addr: 508,
                len: 8,
                capacity: 512,
            })
        ));
        assert!(bs.write(512, &[1]).is_err());
        assert!(bs.read(504, &mut buf).is_ok());
    }

    #[test]
    fn test_counters_and_reset() {
        let mut bs = store(1, 64);
        let mut buf = [0u8; 4];
        bs.write(0, &[1, 2, 3, 4]).unwrap();
        bs.read(0, &mut buf).unwrap();
        bs.read(4, &mut buf).unwrap();
        assert_eq!(
            bs.stats(),
            StorageStats {
                reads: 2,
                writes: 1,
            }
        );
        bs.reset_stats();
        assert_eq!(bs.stats(), StorageStats::default());
    }

    #[test]
    fn test_mismatched_units_rejected() {
        let units: Vec<Box<dyn StorageUnit>> =
            vec![Box::new(MemoryUnit::new(64)), Box::new(MemoryUnit::new(32))];
        assert!(matches!(
            BackingStore::new(units),
            Err(StorageError::CapacityMismatch {
                unit: 1,
                expected: 64,
                actual: 32,
            })
        ));
        assert!(matches!(
            BackingStore::new(Vec::new()),
            Err(StorageError::NoUnits)
        ));
    }

    const UNIT: u32 = 64;
    const UNITS: usize = 4;

    proptest! {
        #[test]
        fn round_trip_anywhere(
            addr in 0u32..UNIT * UNITS as u32,
            data in proptest::collection::vec(any::<u8>(), 1..160),
        ) {
            let mut bs = store(UNITS, UNIT);
            let len = data.len().min((UNIT * UNITS as u32 - addr) as usize);
            bs.write(addr, &data[..len]).unwrap();
            let mut back = vec![0u8; len];
            bs.read(addr, &mut back).unwrap();
            prop_assert_eq!(&back[..], &data[..len]);
        }

        #[test]
        fn straddling_write_leaves_neighbours(
            edge in 1u32..UNITS as u32,
            before in 1u32..UNIT,
            after in 1u32..UNIT,
            fill in any::<u8>(),
        ) {
            let total = (UNIT * UNITS as u32) as usize;
            let mut bs = store(UNITS, UNIT);
            bs.write(0, &vec![fill; total]).unwrap();

            let addr = edge * UNIT - before;
            let data: Vec<u8> = (0..before + after).map(|i| !fill ^ i as u8).collect();
            bs.write(addr, &data).unwrap();

            let mut whole = vec![0u8; total];
            bs.read(0, &mut whole).unwrap();
            let end = (addr + before + after) as usize;
            prop_assert_eq!(&whole[addr as usize..end], &data[..]);
            prop_assert!(whole[..addr as usize].iter().all(|&b| b == fill));
            prop_assert!(whole[end..].iter().all(|&b| b == fill));
        }
    }
}
