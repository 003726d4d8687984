//! Instruction execution
//!
//! RV32IMA semantics over the `Bus`. Misaligned accesses trap rather than
//! being split, so every bus access stays inside one cache line.

use super::csr::MSTATUS_MIE;
use super::decode::*;
use super::trap::{self, Trap};
use super::{
    Cpu, Exception, Flow, PrivilegeLevel, CLINT_TIMERMATCH_HI, CLINT_TIMERMATCH_LO, CLINT_TIMER_HI,
    CLINT_TIMER_LO, SYSCON_ADDR,
};
use crate::config::RAM_IMAGE_OFFSET;
use crate::memory::{Bus, BusError};

/// An unmapped access becomes `trap`; a storage failure ends the session
#[inline]
fn bus_fault(e: BusError, trap: Trap) -> Exception {
    match e {
        BusError::Unmapped(_) => Exception::Trap(trap),
        BusError::Storage(e) => Exception::Host(e),
    }
}

impl Cpu {
    /// Fetch, decode and execute one instruction. On a trap the pc still
    /// points at the faulting instruction.
    pub(crate) fn execute_one(&mut self, bus: &mut impl Bus) -> Result<Flow, Exception> {
        let pc = self.pc;
        if pc & 3 != 0 {
            return Err(Trap::InstructionAddressMisaligned(pc).into());
        }
        if pc.wrapping_sub(RAM_IMAGE_OFFSET) >= self.ram_size {
            return Err(Trap::InstructionAccessFault(pc).into());
        }
        let raw = bus
            .read32(pc)
            .map_err(|e| bus_fault(e, Trap::InstructionAccessFault(pc)))?;
        self.csr.cycle = self.csr.cycle.wrapping_add(1);

        let inst = Inst(raw);
        let mut next_pc = pc.wrapping_add(4);
        let mut flow = Flow::Next;

        match inst.opcode() {
            OP_LUI => self.write_reg(inst.rd(), inst.imm_u()),

            OP_AUIPC => self.write_reg(inst.rd(), pc.wrapping_add(inst.imm_u())),

            OP_JAL => {
                next_pc = jump_target(pc.wrapping_add(inst.imm_j() as u32))?;
                self.write_reg(inst.rd(), pc.wrapping_add(4));
            }

            OP_JALR => {
                let target = self.read_reg(inst.rs1()).wrapping_add(inst.imm_i() as u32) & !1;
                next_pc = jump_target(target)?;
                self.write_reg(inst.rd(), pc.wrapping_add(4));
            }

            OP_BRANCH => {
                let rs1 = self.read_reg(inst.rs1());
                let rs2 = self.read_reg(inst.rs2());
                let taken = match inst.funct3() {
                    FUNCT3_BEQ => rs1 == rs2,
                    FUNCT3_BNE => rs1 != rs2,
                    FUNCT3_BLT => (rs1 as i32) < (rs2 as i32),
                    FUNCT3_BGE => (rs1 as i32) >= (rs2 as i32),
                    FUNCT3_BLTU => rs1 < rs2,
                    FUNCT3_BGEU => rs1 >= rs2,
                    _ => return Err(Trap::IllegalInstruction(raw).into()),
                };
                if taken {
                    next_pc = jump_target(pc.wrapping_add(inst.imm_b() as u32))?;
                }
            }

            OP_LOAD => {
                let addr = self.read_reg(inst.rs1()).wrapping_add(inst.imm_i() as u32);
                let value = self.load(bus, addr, inst.funct3(), raw)?;
                self.write_reg(inst.rd(), value);
            }

            OP_STORE => {
                let addr = self.read_reg(inst.rs1()).wrapping_add(inst.imm_s() as u32);
                let value = self.read_reg(inst.rs2());
                if addr == SYSCON_ADDR {
                    flow = Flow::Syscon(value);
                } else {
                    self.store(bus, addr, value, inst.funct3(), raw)?;
                }
            }

            OP_OP_IMM => {
                let rs1 = self.read_reg(inst.rs1());
                let imm = inst.imm_i() as u32;
                let shamt = imm & 0x1F;
                let value = match inst.funct3() {
                    FUNCT3_ADD_SUB => rs1.wrapping_add(imm),
                    FUNCT3_SLT => ((rs1 as i32) < (imm as i32)) as u32,
                    FUNCT3_SLTU => (rs1 < imm) as u32,
                    FUNCT3_XOR => rs1 ^ imm,
                    FUNCT3_OR => rs1 | imm,
                    FUNCT3_AND => rs1 & imm,
                    FUNCT3_SLL if inst.funct7() == 0 => rs1 << shamt,
                    FUNCT3_SRL_SRA if inst.funct7() == 0 => rs1 >> shamt,
                    FUNCT3_SRL_SRA if inst.funct7() == 0x20 => ((rs1 as i32) >> shamt) as u32,
                    _ => return Err(Trap::IllegalInstruction(raw).into()),
                };
                self.write_reg(inst.rd(), value);
            }

            OP_OP => {
                let rs1 = self.read_reg(inst.rs1());
                let rs2 = self.read_reg(inst.rs2());
                let value = match inst.funct7() {
                    0 => match inst.funct3() {
                        FUNCT3_ADD_SUB => rs1.wrapping_add(rs2),
                        FUNCT3_SLL => rs1 << (rs2 & 0x1F),
                        FUNCT3_SLT => ((rs1 as i32) < (rs2 as i32)) as u32,
                        FUNCT3_SLTU => (rs1 < rs2) as u32,
                        FUNCT3_XOR => rs1 ^ rs2,
                        FUNCT3_SRL_SRA => rs1 >> (rs2 & 0x1F),
                        FUNCT3_OR => rs1 | rs2,
                        _ => rs1 & rs2,
                    },
                    0x20 => match inst.funct3() {
                        FUNCT3_ADD_SUB => rs1.wrapping_sub(rs2),
                        FUNCT3_SRL_SRA => ((rs1 as i32) >> (rs2 & 0x1F)) as u32,
                        _ => return Err(Trap::IllegalInstruction(raw).into()),
                    },
                    FUNCT7_MULDIV => muldiv(inst.funct3(), rs1, rs2),
                    _ => return Err(Trap::IllegalInstruction(raw).into()),
                };
                self.write_reg(inst.rd(), value);
            }

            // FENCE / FENCE.I: single hart, nothing buffered
            OP_MISC_MEM => {}

            OP_SYSTEM => {
                if inst.funct3() == FUNCT3_PRIV {
                    match inst.csr() {
                        PRIV_ECALL => {
                            return Err(match self.priv_level {
                                PrivilegeLevel::User => Trap::EnvironmentCallFromU,
                                PrivilegeLevel::Machine => Trap::EnvironmentCallFromM,
                            }
                            .into());
                        }
                        PRIV_EBREAK => return Err(Trap::Breakpoint(pc).into()),
                        PRIV_MRET if self.priv_level == PrivilegeLevel::Machine => {
                            trap::handle_mret(self);
                            return Ok(Flow::Next);
                        }
                        PRIV_WFI => {
                            // Guests idle with interrupts masked; the timer
                            // must still be able to wake them
                            self.csr.mstatus |= MSTATUS_MIE;
                            self.wfi = true;
                            flow = Flow::Wait;
                        }
                        _ => return Err(Trap::IllegalInstruction(raw).into()),
                    }
                } else {
                    self.execute_csr(bus, inst)?;
                }
            }

            OP_AMO => self.execute_amo(bus, inst)?,

            _ => return Err(Trap::IllegalInstruction(raw).into()),
        }

        self.pc = next_pc;
        Ok(flow)
    }

    fn load(
        &mut self,
        bus: &mut impl Bus,
        addr: u32,
        funct3: u32,
        raw: u32,
    ) -> Result<u32, Exception> {
        match addr {
            CLINT_TIMER_LO => return Ok(self.csr.timer as u32),
            CLINT_TIMER_HI => return Ok((self.csr.timer >> 32) as u32),
            _ => {}
        }

        let width = match funct3 {
            FUNCT3_B | FUNCT3_BU => 1,
            FUNCT3_H | FUNCT3_HU => 2,
            FUNCT3_W => 4,
            _ => return Err(Trap::IllegalInstruction(raw).into()),
        };
        if addr & (width - 1) != 0 {
            return Err(Trap::LoadAddressMisaligned(addr).into());
        }

        let value = match funct3 {
            FUNCT3_B => bus.read8(addr).map(|v| v as i8 as i32 as u32),
            FUNCT3_BU => bus.read8(addr).map(u32::from),
            FUNCT3_H => bus.read16(addr).map(|v| v as i16 as i32 as u32),
            FUNCT3_HU => bus.read16(addr).map(u32::from),
            _ => bus.read32(addr),
        };
        value.map_err(|e| bus_fault(e, Trap::LoadAccessFault(addr)))
    }

    fn store(
        &mut self,
        bus: &mut impl Bus,
        addr: u32,
        value: u32,
        funct3: u32,
        raw: u32,
    ) -> Result<(), Exception> {
        match addr {
            CLINT_TIMERMATCH_LO => {
                self.csr.timermatch = (self.csr.timermatch & !0xFFFF_FFFF) | value as u64;
                return Ok(());
            }
            CLINT_TIMERMATCH_HI => {
                self.csr.timermatch = (self.csr.timermatch & 0xFFFF_FFFF) | ((value as u64) << 32);
                return Ok(());
            }
            _ => {}
        }

        let width = match funct3 {
            FUNCT3_B => 1,
            FUNCT3_H => 2,
            FUNCT3_W => 4,
            _ => return Err(Trap::IllegalInstruction(raw).into()),
        };
        if addr & (width - 1) != 0 {
            return Err(Trap::StoreAddressMisaligned(addr).into());
        }
        if self.reservation == Some(addr & !3) {
            self.reservation = None;
        }

        let result = match width {
            1 => bus.write8(addr, value as u8),
            2 => bus.write16(addr, value as u16),
            _ => bus.write32(addr, value),
        };
        result.map_err(|e| bus_fault(e, Trap::StoreAccessFault(addr)))
    }

    fn execute_csr(&mut self, bus: &mut impl Bus, inst: Inst) -> Result<(), Exception> {
        let csr = inst.csr();
        let funct3 = inst.funct3();
        let illegal = || Exception::Trap(Trap::IllegalInstruction(inst.0));

        // Machine-level CSRs (bits 9:8 == 3) are off limits in user mode
        if self.priv_level == PrivilegeLevel::User && (csr >> 8) & 3 == 3 {
            return Err(illegal());
        }

        let src = if funct3 & 4 != 0 {
            inst.rs1()
        } else {
            self.read_reg(inst.rs1())
        };
        let op = funct3 & 3;
        // CSRRW skips the read when rd is x0; CSRRS/C skip the write when
        // the source is x0 or a zero immediate
        let reads = op != (FUNCT3_CSRRW & 3) || inst.rd() != 0;
        let writes = op == (FUNCT3_CSRRW & 3) || inst.rs1() != 0;

        let old = if reads {
            match self.csr.read(csr) {
                Some(v) => v,
                None => bus
                    .csr_read(csr)
                    .map_err(|e| bus_fault(e, Trap::IllegalInstruction(inst.0)))?,
            }
        } else {
            0
        };

        if writes {
            let new = match funct3 {
                FUNCT3_CSRRW | FUNCT3_CSRRWI => src,
                FUNCT3_CSRRS | FUNCT3_CSRRSI => old | src,
                FUNCT3_CSRRC | FUNCT3_CSRRCI => old & !src,
                _ => return Err(illegal()),
            };
            if !self.csr.write(csr, new) {
                bus.csr_write(csr, new)
                    .map_err(|e| bus_fault(e, Trap::IllegalInstruction(inst.0)))?;
            }
        }

        self.write_reg(inst.rd(), old);
        Ok(())
    }

    fn execute_amo(&mut self, bus: &mut impl Bus, inst: Inst) -> Result<(), Exception> {
        if inst.funct3() != FUNCT3_W {
            return Err(Trap::IllegalInstruction(inst.0).into());
        }
        let addr = self.read_reg(inst.rs1());
        let rs2 = self.read_reg(inst.rs2());
        let funct5 = inst.funct5();

        if addr & 3 != 0 {
            return Err(if funct5 == FUNCT5_LR {
                Trap::LoadAddressMisaligned(addr)
            } else {
                Trap::StoreAddressMisaligned(addr)
            }
            .into());
        }

        match funct5 {
            FUNCT5_LR => {
                let value = bus
                    .read32(addr)
                    .map_err(|e| bus_fault(e, Trap::LoadAccessFault(addr)))?;
                self.reservation = Some(addr);
                self.write_reg(inst.rd(), value);
            }
            FUNCT5_SC => {
                let ok = self.reservation == Some(addr);
                self.reservation = None;
                if ok {
                    bus.write32(addr, rs2)
                        .map_err(|e| bus_fault(e, Trap::StoreAccessFault(addr)))?;
                }
                self.write_reg(inst.rd(), (!ok) as u32);
            }
            _ => {
                let old = bus
                    .read32(addr)
                    .map_err(|e| bus_fault(e, Trap::StoreAccessFault(addr)))?;
                let new = match funct5 {
                    FUNCT5_AMOSWAP => rs2,
                    FUNCT5_AMOADD => old.wrapping_add(rs2),
                    FUNCT5_AMOXOR => old ^ rs2,
                    FUNCT5_AMOAND => old & rs2,
                    FUNCT5_AMOOR => old | rs2,
                    FUNCT5_AMOMIN => (old as i32).min(rs2 as i32) as u32,
                    FUNCT5_AMOMAX => (old as i32).max(rs2 as i32) as u32,
                    FUNCT5_AMOMINU => old.min(rs2),
                    FUNCT5_AMOMAXU => old.max(rs2),
                    _ => return Err(Trap::IllegalInstruction(inst.0).into()),
                };
                bus.write32(addr, new)
                    .map_err(|e| bus_fault(e, Trap::StoreAccessFault(addr)))?;
                if self.reservation == Some(addr) {
                    self.reservation = None;
                }
                self.write_reg(inst.rd(), old);
            }
        }
        Ok(())
    }
}

#[inline]
fn jump_target(target: u32) -> Result<u32, Exception> {
    if target & 3 != 0 {
        Err(Trap::InstructionAddressMisaligned(target).into())
    } else {
        Ok(target)
    }
}

/// M extension
fn muldiv(funct3: u32, rs1: u32, rs2: u32) -> u32 {
    match funct3 {
        FUNCT3_MUL => rs1.wrapping_mul(rs2),
        FUNCT3_MULH => ((rs1 as i32 as i64 * rs2 as i32 as i64) >> 32) as u32,
        FUNCT3_MULHSU => ((rs1 as i32 as i64 * rs2 as u64 as i64) >> 32) as u32,
        FUNCT3_MULHU => ((rs1 as u64 * rs2 as u64) >> 32) as u32,
        FUNCT3_DIV => {
            if rs2 == 0 {
                u32::MAX
            } else {
                (rs1 as i32).wrapping_div(rs2 as i32) as u32
            }
        }
        FUNCT3_DIVU => rs1.checked_div(rs2).unwrap_or(u32::MAX),
        FUNCT3_REM => {
            if rs2 == 0 {
                rs1
            } else {
                (rs1 as i32).wrapping_rem(rs2 as i32) as u32
            }
        }
        _ => rs1.checked_rem(rs2).unwrap_or(rs1),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{run, FlatBus};
    use super::*;
    use crate::config::FaultPolicy;
    use crate::cpu::StepOutcome;

    fn fail_fast(words: &[u32], max: u32) -> (Cpu, StepOutcome) {
        let mut bus = FlatBus::new(0x1000);
        bus.load(words);
        let mut cpu = Cpu::new(0x1000).with_fault_policy(FaultPolicy::FailFast);
        let out = cpu.step(&mut bus, max, 0).unwrap();
        (cpu, out)
    }

    #[test]
    fn test_muldiv_edge_cases() {
        assert_eq!(muldiv(FUNCT3_DIV, 7, 0), u32::MAX);
        assert_eq!(muldiv(FUNCT3_DIVU, 7, 0), u32::MAX);
        assert_eq!(muldiv(FUNCT3_REM, 7, 0), 7);
        assert_eq!(muldiv(FUNCT3_REMU, 7, 0), 7);
        assert_eq!(
            muldiv(FUNCT3_DIV, i32::MIN as u32, u32::MAX),
            i32::MIN as u32
        );
        assert_eq!(muldiv(FUNCT3_REM, i32::MIN as u32, u32::MAX), 0);
        assert_eq!(muldiv(FUNCT3_MULH, u32::MAX, u32::MAX), 0);
        assert_eq!(muldiv(FUNCT3_MULHU, u32::MAX, u32::MAX), 0xFFFF_FFFE);
        assert_eq!(muldiv(FUNCT3_MULHSU, u32::MAX, u32::MAX), u32::MAX);
        assert_eq!(muldiv(FUNCT3_DIV, (-7i32) as u32, 2), (-3i32) as u32);
    }

    #[test]
    fn test_load_store_round_trip() {
        // lui x1, 0x80001 ; addi x2, x0, -2 ; sh x2, 2(x1) ; lh x3, 2(x1) ; lhu x4, 2(x1)
        let (cpu, bus, out) = run(
            &[0x800010b7, 0xffe00113, 0x00209123, 0x00209183, 0x0020d203],
            5,
        );
        assert_eq!(out, StepOutcome::Continue);
        assert_eq!(cpu.read_reg(3), 0xFFFF_FFFE);
        assert_eq!(cpu.read_reg(4), 0xFFFE);
        assert_eq!(&bus.ram[0x1002..0x1004], &[0xFE, 0xFF][..]);
    }

    #[test]
    fn test_misaligned_load_traps() {
        // lui x1, 0x80000 ; lw x2, 1(x1)
        let (cpu, out) = fail_fast(&[0x800000b7, 0x0010a103], 5);
        assert_eq!(out, StepOutcome::Fault);
        assert_eq!(
            cpu.last_fault,
            Some(Trap::LoadAddressMisaligned(0x8000_0001))
        );
        assert_eq!(cpu.pc, 0x8000_0004);
    }

    #[test]
    fn test_unmapped_store_is_access_fault() {
        // lui x1, 0x40000 ; sw x0, 0(x1)
        let (cpu, out) = fail_fast(&[0x400000b7, 0x0000a023], 5);
        assert_eq!(out, StepOutcome::Fault);
        assert_eq!(cpu.last_fault, Some(Trap::StoreAccessFault(0x4000_0000)));
    }

    #[test]
    fn test_illegal_instruction() {
        let (cpu, out) = fail_fast(&[0xFFFF_FFFF], 1);
        assert_eq!(out, StepOutcome::Fault);
        assert_eq!(cpu.last_fault, Some(Trap::IllegalInstruction(0xFFFF_FFFF)));
    }

    #[test]
    fn test_custom_csr_goes_to_bus() {
        // addi x10, x0, 42 ; csrw 0x136, x10 ; csrr x11, 0x140
        let (cpu, bus, _) = run(&[0x02a00513, 0x13651073, 0x140025f3], 3);
        assert_eq!(bus.csr_writes, vec![(0x136, 42)]);
        assert_eq!(cpu.read_reg(11), 0xFFFF_FFFF);
    }

    #[test]
    fn test_lr_sc_and_amoadd() {
        // lui x1, 0x80001 ; addi x2, x0, 5
        // lr.w x3, (x1) ; sc.w x4, x2, (x1) ; sc.w x5, x2, (x1)
        // amoadd.w x6, x2, (x1)
        let (cpu, bus, _) = run(
            &[0x800010b7, 0x00500113, 0x1000a1af, 0x1820a22f, 0x1820a2af, 0x0020a32f],
            6,
        );
        assert_eq!(cpu.read_reg(3), 0);
        assert_eq!(cpu.read_reg(4), 0, "first sc succeeds");
        assert_eq!(cpu.read_reg(5), 1, "reservation consumed");
        assert_eq!(cpu.read_reg(6), 5);
        assert_eq!(&bus.ram[0x1000..0x1004], &10u32.to_le_bytes()[..]);
    }

    #[test]
    fn test_clint_registers() {
        // lui x1, 0x11004 ; addi x2, x0, 100 ; sw x2, 0(x1) ; sw x0, 4(x1)
        // lui x3, 0x1100c ; lw x4, -8(x3)
        let mut bus = FlatBus::new(0x1000);
        bus.load(&[
            0x110040b7, 0x06400113, 0x0020a023, 0x0000a223, 0x1100c1b7, 0xff81a203,
        ]);
        let mut cpu = Cpu::new(0x1000);
        cpu.csr.timer = 0x1_0000_0010;
        cpu.step(&mut bus, 6, 0).unwrap();
        assert_eq!(cpu.csr.timermatch, 100);
        assert_eq!(cpu.read_reg(4), 0x10);
    }

    #[test]
    fn test_ecall_from_user_mode() {
        let mut bus = FlatBus::new(0x1000);
        bus.load(&[0x00000073]);
        let mut cpu = Cpu::new(0x1000);
        cpu.priv_level = PrivilegeLevel::User;
        cpu.csr.mtvec = 0x8000_0800;
        assert_eq!(cpu.step(&mut bus, 1, 0).unwrap(), StepOutcome::Continue);
        assert_eq!(cpu.csr.mcause, 8);
        assert_eq!(cpu.priv_level, PrivilegeLevel::Machine);
        assert_eq!(cpu.pc, 0x8000_0800);
    }
}
