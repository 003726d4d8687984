//! Instruction decoder
//!
//! Field extraction for 32-bit RV32IMA encodings. Fields are pulled out
//! lazily; the executor only asks for the ones its format uses.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inst(pub u32);

impl Inst {
    #[inline(always)]
    pub fn opcode(self) -> u32 {
        self.0 & 0x7F
    }

    #[inline(always)]
    pub fn rd(self) -> u32 {
        (self.0 >> 7) & 0x1F
    }

    #[inline(always)]
    pub fn rs1(self) -> u32 {
        (self.0 >> 15) & 0x1F
    }

    #[inline(always)]
    pub fn rs2(self) -> u32 {
        (self.0 >> 20) & 0x1F
    }

    #[inline(always)]
    pub fn funct3(self) -> u32 {
        (self.0 >> 12) & 0x7
    }

    #[inline(always)]
    pub fn funct7(self) -> u32 {
        self.0 >> 25
    }

    /// AMO operation selector (funct7 without aq/rl)
    #[inline(always)]
    pub fn funct5(self) -> u32 {
        self.0 >> 27
    }

    /// CSR number of a SYSTEM instruction
    #[inline(always)]
    pub fn csr(self) -> u32 {
        self.0 >> 20
    }

    #[inline(always)]
    pub fn imm_i(self) -> i32 {
        (self.0 as i32) >> 20
    }

    #[inline(always)]
    pub fn imm_s(self) -> i32 {
        ((self.0 & 0xFE00_0000) as i32 >> 20) | ((self.0 >> 7) & 0x1F) as i32
    }

    #[inline(always)]
    pub fn imm_b(self) -> i32 {
        let i = self.0;
        ((i & 0x8000_0000) as i32 >> 19)
            | (((i >> 7) & 1) << 11) as i32
            | (((i >> 25) & 0x3F) << 5) as i32
            | (((i >> 8) & 0xF) << 1) as i32
    }

    #[inline(always)]
    pub fn imm_u(self) -> u32 {
        self.0 & 0xFFFF_F000
    }

    #[inline(always)]
    pub fn imm_j(self) -> i32 {
        let i = self.0;
        ((i & 0x8000_0000) as i32 >> 11)
            | (i & 0xF_F000) as i32
            | (((i >> 20) & 1) << 11) as i32
            | (((i >> 21) & 0x3FF) << 1) as i32
    }
}

// Opcodes
pub const OP_LUI: u32 = 0b0110111;
pub const OP_AUIPC: u32 = 0b0010111;
pub const OP_JAL: u32 = 0b1101111;
pub const OP_JALR: u32 = 0b1100111;
pub const OP_BRANCH: u32 = 0b1100011;
pub const OP_LOAD: u32 = 0b0000011;
pub const OP_STORE: u32 = 0b0100011;
pub const OP_OP_IMM: u32 = 0b0010011;
pub const OP_OP: u32 = 0b0110011;
pub const OP_MISC_MEM: u32 = 0b0001111;
pub const OP_SYSTEM: u32 = 0b1110011;
pub const OP_AMO: u32 = 0b0101111;

// Branch funct3
pub const FUNCT3_BEQ: u32 = 0b000;
pub const FUNCT3_BNE: u32 = 0b001;
pub const FUNCT3_BLT: u32 = 0b100;
pub const FUNCT3_BGE: u32 = 0b101;
pub const FUNCT3_BLTU: u32 = 0b110;
pub const FUNCT3_BGEU: u32 = 0b111;

// Load/Store funct3
pub const FUNCT3_B: u32 = 0b000;
pub const FUNCT3_H: u32 = 0b001;
pub const FUNCT3_W: u32 = 0b010;
pub const FUNCT3_BU: u32 = 0b100;
pub const FUNCT3_HU: u32 = 0b101;

// ALU funct3
pub const FUNCT3_ADD_SUB: u32 = 0b000;
pub const FUNCT3_SLL: u32 = 0b001;
pub const FUNCT3_SLT: u32 = 0b010;
pub const FUNCT3_SLTU: u32 = 0b011;
pub const FUNCT3_XOR: u32 = 0b100;
pub const FUNCT3_SRL_SRA: u32 = 0b101;
pub const FUNCT3_OR: u32 = 0b110;
pub const FUNCT3_AND: u32 = 0b111;

// M extension funct3
pub const FUNCT3_MUL: u32 = 0b000;
pub const FUNCT3_MULH: u32 = 0b001;
pub const FUNCT3_MULHSU: u32 = 0b010;
pub const FUNCT3_MULHU: u32 = 0b011;
pub const FUNCT3_DIV: u32 = 0b100;
pub const FUNCT3_DIVU: u32 = 0b101;
pub const FUNCT3_REM: u32 = 0b110;
pub const FUNCT3_REMU: u32 = 0b111;
pub const FUNCT7_MULDIV: u32 = 0b0000001;

// System funct3
pub const FUNCT3_PRIV: u32 = 0b000;
pub const FUNCT3_CSRRW: u32 = 0b001;
pub const FUNCT3_CSRRS: u32 = 0b010;
pub const FUNCT3_CSRRC: u32 = 0b011;
pub const FUNCT3_CSRRWI: u32 = 0b101;
pub const FUNCT3_CSRRSI: u32 = 0b110;
pub const FUNCT3_CSRRCI: u32 = 0b111;

// PRIV imm12
pub const PRIV_ECALL: u32 = 0x000;
pub const PRIV_EBREAK: u32 = 0x001;
pub const PRIV_MRET: u32 = 0x302;
pub const PRIV_WFI: u32 = 0x105;

// AMO funct5
pub const FUNCT5_LR: u32 = 0b00010;
pub const FUNCT5_SC: u32 = 0b00011;
pub const FUNCT5_AMOSWAP: u32 = 0b00001;
pub const FUNCT5_AMOADD: u32 = 0b00000;
pub const FUNCT5_AMOXOR: u32 = 0b00100;
pub const FUNCT5_AMOAND: u32 = 0b01100;
pub const FUNCT5_AMOOR: u32 = 0b01000;
pub const FUNCT5_AMOMIN: u32 = 0b10000;
pub const FUNCT5_AMOMAX: u32 = 0b10100;
pub const FUNCT5_AMOMINU: u32 = 0b11000;
pub const FUNCT5_AMOMAXU: u32 = 0b11100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediates() {
        // addi x1, x0, -1
        let i = Inst(0xfff00093);
        assert_eq!(i.opcode(), OP_OP_IMM);
        assert_eq!(i.rd(), 1);
        assert_eq!(i.imm_i(), -1);

        // sw x2, -4(x1)
        let s = Inst(0xfe20ae23);
        assert_eq!(s.opcode(), OP_STORE);
        assert_eq!(s.imm_s(), -4);

        // beq x0, x0, -8
        let b = Inst(0xfe000ce3);
        assert_eq!(b.imm_b(), -8);

        // jal x0, 2048
        let j = Inst(0x0010006f);
        assert_eq!(j.imm_j(), 2048);

        // lui x5, 0x10000
        let u = Inst(0x100002b7);
        assert_eq!(u.imm_u(), 0x1000_0000);
    }

    #[test]
    fn test_csr_fields() {
        // csrrw x0, 0x139, x10
        let c = Inst(0x13951073);
        assert_eq!(c.opcode(), OP_SYSTEM);
        assert_eq!(c.funct3(), FUNCT3_CSRRW);
        assert_eq!(c.csr(), 0x139);
        assert_eq!(c.rs1(), 10);
    }
}
