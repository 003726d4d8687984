//! Control and Status Registers
//!
//! Machine-mode subset plus the core-local timer. CSR numbers the core does
//! not implement are forwarded to the bus.

use serde::{Deserialize, Serialize};

// Machine CSRs
pub const CSR_MSTATUS: u32 = 0x300;
pub const CSR_MISA: u32 = 0x301;
pub const CSR_MIE: u32 = 0x304;
pub const CSR_MTVEC: u32 = 0x305;
pub const CSR_MSCRATCH: u32 = 0x340;
pub const CSR_MEPC: u32 = 0x341;
pub const CSR_MCAUSE: u32 = 0x342;
pub const CSR_MTVAL: u32 = 0x343;
pub const CSR_MIP: u32 = 0x344;
pub const CSR_MVENDORID: u32 = 0xF11;
pub const CSR_MHARTID: u32 = 0xF14;

// Counters
pub const CSR_CYCLE: u32 = 0xC00;
pub const CSR_TIME: u32 = 0xC01;
pub const CSR_CYCLEH: u32 = 0xC80;
pub const CSR_TIMEH: u32 = 0xC81;

// MSTATUS bits
pub const MSTATUS_MIE: u32 = 1 << 3;
pub const MSTATUS_MPIE: u32 = 1 << 7;
pub const MSTATUS_MPP: u32 = 3 << 11;

// MIP/MIE bits
pub const MIP_MSIP: u32 = 1 << 3;
pub const MIP_MTIP: u32 = 1 << 7;
pub const MIP_MEIP: u32 = 1 << 11;

/// RV32 (MXL=1) with A, I, M
pub const MISA_VALUE: u32 = 0x4040_1101;
pub const MVENDORID_VALUE: u32 = 0xff0f_f0ff;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Csr {
    pub mstatus: u32,
    pub mie: u32,
    pub mip: u32,
    pub mtvec: u32,
    pub mscratch: u32,
    pub mepc: u32,
    pub mcause: u32,
    pub mtval: u32,

    /// Retired-instruction clock, also the fixed-update time base
    pub cycle: u64,
    /// CLINT mtime in microseconds
    pub timer: u64,
    /// CLINT mtimecmp; zero disables the timer interrupt
    pub timermatch: u64,
}

impl Csr {
    pub fn new() -> Self {
        Csr::default()
    }

    /// Read a core CSR. `None` means the number belongs to the bus.
    pub fn read(&self, addr: u32) -> Option<u32> {
        Some(match addr {
            CSR_MSTATUS => self.mstatus,
            CSR_MISA => MISA_VALUE,
            CSR_MIE => self.mie,
            CSR_MTVEC => self.mtvec,
            CSR_MSCRATCH => self.mscratch,
            CSR_MEPC => self.mepc,
            CSR_MCAUSE => self.mcause,
            CSR_MTVAL => self.mtval,
            CSR_MIP => self.mip,
            CSR_MVENDORID => MVENDORID_VALUE,
            CSR_MHARTID => 0,
            CSR_CYCLE => self.cycle as u32,
            CSR_CYCLEH => (self.cycle >> 32) as u32,
            CSR_TIME => self.timer as u32,
            CSR_TIMEH => (self.timer >> 32) as u32,
            _ => return None,
        })
    }

    /// Write a core CSR. Returns false if the number belongs to the bus.
    pub fn write(&mut self, addr: u32, value: u32) -> bool {
        match addr {
            CSR_MSTATUS => self.mstatus = value,
            CSR_MIE => self.mie = value,
            CSR_MIP => self.mip = value,
            CSR_MTVEC => self.mtvec = value,
            CSR_MSCRATCH => self.mscratch = value,
            CSR_MEPC => self.mepc = value,
            CSR_MCAUSE => self.mcause = value,
            CSR_MTVAL => self.mtval = value,
            // Read-only identity and counters: writes are dropped
            CSR_MISA | CSR_MVENDORID | CSR_MHARTID | CSR_CYCLE | CSR_CYCLEH | CSR_TIME
            | CSR_TIMEH => {}
            _ => return false,
        }
        true
    }

    /// Advance the timer and latch MTIP. Returns true if the timer fired.
    pub fn advance_timer(&mut self, elapsed_us: u64) -> bool {
        self.timer = self.timer.wrapping_add(elapsed_us);
        if self.timermatch != 0 && self.timer >= self.timermatch {
            self.mip |= MIP_MTIP;
            true
        } else {
            self.mip &= !MIP_MTIP;
            false
        }
    }

    pub fn reset(&mut self) {
        *self = Csr::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_csr_is_not_core() {
        let mut csr = Csr::new();
        assert_eq!(csr.read(0x136), None);
        assert!(!csr.write(0x139, 0x41));
    }

    #[test]
    fn test_cycle_split() {
        let mut csr = Csr::new();
        csr.cycle = 0x1_0000_0002;
        assert_eq!(csr.read(CSR_CYCLE), Some(2));
        assert_eq!(csr.read(CSR_CYCLEH), Some(1));
        assert!(csr.write(CSR_CYCLE, 0));
        assert_eq!(csr.cycle, 0x1_0000_0002);
    }

    #[test]
    fn test_timer_latches_mtip() {
        let mut csr = Csr::new();
        assert!(!csr.advance_timer(100));
        csr.timermatch = 150;
        assert!(!csr.advance_timer(10));
        assert_eq!(csr.mip & MIP_MTIP, 0);
        assert!(csr.advance_timer(40));
        assert_ne!(csr.mip & MIP_MTIP, 0);
        csr.timermatch = 1000;
        assert!(!csr.advance_timer(0));
        assert_eq!(csr.mip & MIP_MTIP, 0);
    }
}
