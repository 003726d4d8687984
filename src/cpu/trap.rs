//! Trap handling (exceptions and interrupts)
//!
//! Machine mode is the only trap target. There is no delegation.

use super::csr::*;
use super::{Cpu, PrivilegeLevel};

/// Exception/interrupt cause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    // Exceptions (synchronous)
    InstructionAddressMisaligned(u32),
    InstructionAccessFault(u32),
    IllegalInstruction(u32),
    Breakpoint(u32),
    LoadAddressMisaligned(u32),
    LoadAccessFault(u32),
    StoreAddressMisaligned(u32),
    StoreAccessFault(u32),
    EnvironmentCallFromU,
    EnvironmentCallFromM,

    // Interrupts (asynchronous)
    MachineSoftwareInterrupt,
    MachineTimerInterrupt,
    MachineExternalInterrupt,
}

impl Trap {
    /// mcause value
    pub fn code(&self) -> u32 {
        match self {
            Trap::InstructionAddressMisaligned(_) => 0,
            Trap::InstructionAccessFault(_) => 1,
            Trap::IllegalInstruction(_) => 2,
            Trap::Breakpoint(_) => 3,
            Trap::LoadAddressMisaligned(_) => 4,
            Trap::LoadAccessFault(_) => 5,
            Trap::StoreAddressMisaligned(_) => 6,
            Trap::StoreAccessFault(_) => 7,
            Trap::EnvironmentCallFromU => 8,
            Trap::EnvironmentCallFromM => 11,

            Trap::MachineSoftwareInterrupt => 0x8000_0000 | 3,
            Trap::MachineTimerInterrupt => 0x8000_0000 | 7,
            Trap::MachineExternalInterrupt => 0x8000_0000 | 11,
        }
    }

    /// mtval value (bad address, instruction bits, or pc)
    pub fn value(&self) -> u32 {
        match self {
            Trap::InstructionAddressMisaligned(v)
            | Trap::InstructionAccessFault(v)
            | Trap::IllegalInstruction(v)
            | Trap::Breakpoint(v)
            | Trap::LoadAddressMisaligned(v)
            | Trap::LoadAccessFault(v)
            | Trap::StoreAddressMisaligned(v)
            | Trap::StoreAccessFault(v) => *v,
            _ => 0,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        (self.code() & 0x8000_0000) != 0
    }
}

/// Highest-priority interrupt that is pending, enabled and not masked
pub fn check_pending_interrupts(cpu: &Cpu) -> Option<Trap> {
    let pending = cpu.csr.mip & cpu.csr.mie;
    if pending == 0 {
        return None;
    }

    // Lower privilege always takes machine interrupts
    let enabled =
        cpu.priv_level < PrivilegeLevel::Machine || (cpu.csr.mstatus & MSTATUS_MIE) != 0;
    if !enabled {
        return None;
    }

    // Priority: MEI > MSI > MTI
    if pending & MIP_MEIP != 0 {
        Some(Trap::MachineExternalInterrupt)
    } else if pending & MIP_MSIP != 0 {
        Some(Trap::MachineSoftwareInterrupt)
    } else if pending & MIP_MTIP != 0 {
        Some(Trap::MachineTimerInterrupt)
    } else {
        None
    }
}

/// Enter the machine trap handler. `cpu.pc` must hold the epc.
pub fn handle_trap(cpu: &mut Cpu, trap: Trap) {
    let cause = trap.code();

    cpu.csr.mepc = cpu.pc;
    cpu.csr.mcause = cause;
    cpu.csr.mtval = trap.value();

    // MPIE = MIE, MIE = 0, MPP = current privilege
    let mie = cpu.csr.mstatus & MSTATUS_MIE;
    cpu.csr.mstatus = (mie << 4) | ((cpu.priv_level as u32) << 11);

    cpu.priv_level = PrivilegeLevel::Machine;
    cpu.wfi = false;

    let base = cpu.csr.mtvec & !3;
    let vectored = (cpu.csr.mtvec & 3) == 1;
    cpu.pc = if vectored && trap.is_interrupt() {
        base.wrapping_add(4 * (cause & 0x7FFF_FFFF))
    } else {
        base
    };
}

/// MRET: restore privilege and interrupt enable, jump to mepc
pub fn handle_mret(cpu: &mut Cpu) {
    let status = cpu.csr.mstatus;
    let mpp = (status & MSTATUS_MPP) >> 11;
    let mpie = status & MSTATUS_MPIE;

    // MIE = MPIE, MPIE = 1, MPP = U
    cpu.csr.mstatus = (status & !(MSTATUS_MIE | MSTATUS_MPP)) | (mpie >> 4) | MSTATUS_MPIE;

    cpu.priv_level = PrivilegeLevel::from(mpp as u8);
    cpu.pc = cpu.csr.mepc;
}
