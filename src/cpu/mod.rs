//! RV32IMA CPU module
//!
//! Implements the RISC-V 32-bit base integer instruction set with the M
//! (multiply/divide) and A (atomic) extensions, machine and user privilege,
//! and the core-local CLINT timer and syscon register.

pub mod csr;
mod decode;
mod execute;
pub mod trap;

pub use csr::Csr;
pub use trap::Trap;

use std::fmt;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::config::{FaultPolicy, RAM_IMAGE_OFFSET};
use crate::error::StorageError;
use crate::memory::Bus;

// Core-local MMIO, serviced before the bus
pub const CLINT_TIMERMATCH_LO: u32 = 0x1100_4000;
pub const CLINT_TIMERMATCH_HI: u32 = 0x1100_4004;
pub const CLINT_TIMER_LO: u32 = 0x1100_bff8;
pub const CLINT_TIMER_HI: u32 = 0x1100_bffc;
pub const SYSCON_ADDR: u32 = 0x1110_0000;

pub const SYSCON_POWEROFF: u32 = 0x5555;
pub const SYSCON_REBOOT: u32 = 0x7777;

/// Privilege levels
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrivilegeLevel {
    User = 0,
    Machine = 3,
}

impl From<u8> for PrivilegeLevel {
    fn from(val: u8) -> Self {
        match val & 3 {
            0 => PrivilegeLevel::User,
            _ => PrivilegeLevel::Machine,
        }
    }
}

/// Result of one `step` batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Continue,
    WaitForInterrupt,
    Fault,
    Reboot,
    PowerOff,
    Unknown(u32),
}

impl StepOutcome {
    /// Map a value written to syscon
    pub fn from_syscon(value: u32) -> Self {
        match value {
            SYSCON_REBOOT => StepOutcome::Reboot,
            SYSCON_POWEROFF => StepOutcome::PowerOff,
            other => StepOutcome::Unknown(other),
        }
    }

    /// Numeric code, as reported in diagnostics
    pub fn code(&self) -> u32 {
        match self {
            StepOutcome::Continue => 0,
            StepOutcome::WaitForInterrupt => 1,
            StepOutcome::Fault => 3,
            StepOutcome::Reboot => SYSCON_REBOOT,
            StepOutcome::PowerOff => SYSCON_POWEROFF,
            StepOutcome::Unknown(code) => *code,
        }
    }
}

/// Per-instruction control flow out of the executor
pub(crate) enum Flow {
    Next,
    Wait,
    Syscon(u32),
}

/// Why an instruction did not retire
pub(crate) enum Exception {
    Trap(Trap),
    Host(StorageError),
}

impl From<Trap> for Exception {
    fn from(t: Trap) -> Self {
        Exception::Trap(t)
    }
}

/// CPU state
#[derive(Clone, Serialize, Deserialize)]
pub struct Cpu {
    /// Program counter
    pub pc: u32,
    /// General purpose registers (x0-x31)
    pub regs: [u32; 32],
    /// Control and Status Registers, cycle counter and timer
    pub csr: Csr,
    /// Current privilege level
    pub priv_level: PrivilegeLevel,

    /// Wait for interrupt (WFI executed)
    pub wfi: bool,

    /// Reserved guest address for LR/SC
    pub reservation: Option<u32>,

    pub fault_policy: FaultPolicy,

    /// Guest RAM size; fetches outside [RAM_IMAGE_OFFSET, +ram_size) fault
    ram_size: u32,

    /// Trap that ended the last batch under fail-fast
    #[serde(skip)]
    pub last_fault: Option<Trap>,
}

impl Cpu {
    pub fn new(ram_size: u32) -> Self {
        Cpu {
            pc: RAM_IMAGE_OFFSET,
            regs: [0u32; 32],
            csr: Csr::new(),
            priv_level: PrivilegeLevel::Machine,
            wfi: false,
            reservation: None,
            fault_policy: FaultPolicy::default(),
            ram_size,
            last_fault: None,
        }
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    pub fn ram_size(&self) -> u32 {
        self.ram_size
    }

    /// Read register (x0 always returns 0)
    #[inline(always)]
    pub fn read_reg(&self, reg: u32) -> u32 {
        if reg == 0 {
            0
        } else {
            self.regs[reg as usize & 0x1F]
        }
    }

    /// Write register (x0 writes are ignored)
    #[inline(always)]
    pub fn write_reg(&mut self, reg: u32, value: u32) {
        if reg != 0 {
            self.regs[reg as usize & 0x1F] = value;
        }
    }

    /// Run up to `max_instructions` instructions.
    ///
    /// The timer advances by `elapsed_us` first. A pending enabled interrupt
    /// is taken instead of executing anything. A trap ends the batch early;
    /// what happens to it depends on `fault_policy`. Backing-store failures
    /// come back as `Err` and leave the CPU where it stopped.
    pub fn step(
        &mut self,
        bus: &mut impl Bus,
        max_instructions: u32,
        elapsed_us: u64,
    ) -> Result<StepOutcome, StorageError> {
        if self.csr.advance_timer(elapsed_us) {
            self.wfi = false;
        }
        if self.wfi {
            return Ok(StepOutcome::WaitForInterrupt);
        }

        if let Some(irq) = trap::check_pending_interrupts(self) {
            trace!("interrupt {:?} at pc {:08x}", irq, self.pc);
            self.handle_trap(irq);
            return Ok(StepOutcome::Continue);
        }

        for _ in 0..max_instructions {
            match self.execute_one(bus) {
                Ok(Flow::Next) => {}
                Ok(Flow::Wait) => return Ok(StepOutcome::WaitForInterrupt),
                Ok(Flow::Syscon(value)) => return Ok(StepOutcome::from_syscon(value)),
                Err(Exception::Trap(t)) => return Ok(self.on_trap(t)),
                Err(Exception::Host(e)) => return Err(e),
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn on_trap(&mut self, t: Trap) -> StepOutcome {
        match self.fault_policy {
            FaultPolicy::FailFast => {
                debug!("fault {:?} at pc {:08x}", t, self.pc);
                self.last_fault = Some(t);
                StepOutcome::Fault
            }
            FaultPolicy::Delegate => {
                trace!("trap {:?} at pc {:08x}", t, self.pc);
                self.handle_trap(t);
                StepOutcome::Continue
            }
        }
    }

    /// Count `n` cycles that passed without executing, e.g. while waiting
    pub fn advance_cycles(&mut self, n: u64) {
        self.csr.cycle = self.csr.cycle.wrapping_add(n);
    }

    /// Boot convention: hart 0 in a0, device tree address in a1,
    /// machine mode, pc at the image base
    pub fn boot_reset(&mut self, dtb_addr: u32) {
        self.regs = [0u32; 32];
        self.csr.reset();
        self.regs[10] = 0;
        self.regs[11] = dtb_addr;
        self.pc = RAM_IMAGE_OFFSET;
        self.priv_level = PrivilegeLevel::Machine;
        self.wfi = false;
        self.reservation = None;
        self.last_fault = None;
    }

    pub fn handle_trap(&mut self, trap: Trap) {
        trap::handle_trap(self, trap);
    }
}

const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "PC: {:08x} priv: {:?} cycle: {} mstatus: {:08x} mcause: {:08x} mepc: {:08x}",
            self.pc,
            self.priv_level,
            self.csr.cycle,
            self.csr.mstatus,
            self.csr.mcause,
            self.csr.mepc
        )?;
        for (i, name) in ABI_NAMES.iter().enumerate() {
            write!(f, "{:>4}:{:08x}", name, self.regs[i])?;
            if i % 8 == 7 {
                writeln!(f)?;
            } else {
                write!(f, " ")?;
            }
        }
        Ok(())
    }
}
