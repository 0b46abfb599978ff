//! RV32I instruction encoders.
//!
//! Small assemblers used by the test suites and the emulator to build guest
//! images. Only produce valid encodings when the arguments are in range;
//! immediates are truncated to their field widths.

use crate::hart::opcodes::*;

/// Make an I-type instruction.
pub fn itype(imm: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (imm & 0xfff) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

/// Make an R- or S-type instruction. The two layouts share field
/// positions; `a` is funct7 (R) or imm[11:5] (S) and `b` is rd (R) or
/// imm[4:0] (S).
pub fn rstype(a: u32, rs2: u32, rs1: u32, funct3: u32, b: u32, opcode: u32) -> u32 {
    a << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | b << 7 | opcode
}

/// Make a U-type instruction from the 20-bit upper immediate.
pub fn utype(imm: u32, rd: u32, opcode: u32) -> u32 {
    (imm & 0xfffff) << 12 | rd << 7 | opcode
}

/// Scramble a byte offset into the J-type immediate field layout.
pub fn jtype(offset: i32, rd: u32, opcode: u32) -> u32 {
    let imm = offset as u32;
    (imm >> 20 & 1) << 31
        | (imm >> 1 & 0x3ff) << 21
        | (imm >> 11 & 1) << 20
        | (imm >> 12 & 0xff) << 12
        | rd << 7
        | opcode
}

/// Scramble a byte offset into the B-type immediate field layout.
pub fn btype(offset: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = offset as u32;
    (imm >> 12 & 1) << 31
        | (imm >> 5 & 0x3f) << 25
        | rs2 << 20
        | rs1 << 15
        | funct3 << 12
        | (imm >> 1 & 0xf) << 8
        | (imm >> 11 & 1) << 7
        | opcode
}

macro_rules! op_imm {
    ($name:ident, $funct3:expr) => {
        pub fn $name(rd: u8, rs1: u8, imm: i32) -> u32 {
            itype(imm as u32, rs1.into(), $funct3, rd.into(), OP_IMM)
        }
    };
}

op_imm!(addi, FUNCT3_ADD);
op_imm!(slti, FUNCT3_SLT);
op_imm!(sltiu, FUNCT3_SLTU);
op_imm!(xori, FUNCT3_XOR);
op_imm!(ori, FUNCT3_OR);
op_imm!(andi, FUNCT3_AND);

macro_rules! op_shift {
    ($name:ident, $funct3:expr, $upper:expr) => {
        pub fn $name(rd: u8, rs1: u8, shamt: u32) -> u32 {
            itype(
                $upper << 5 | (shamt & 0x1f),
                rs1.into(),
                $funct3,
                rd.into(),
                OP_IMM,
            )
        }
    };
}

op_shift!(slli, FUNCT3_SLL, 0);
op_shift!(srli, FUNCT3_SRL, 0);
op_shift!(srai, FUNCT3_SRL, FUNCT7_SUB_SRA);

macro_rules! op_reg {
    ($name:ident, $funct3:expr, $funct7:expr) => {
        pub fn $name(rd: u8, rs1: u8, rs2: u8) -> u32 {
            rstype($funct7, rs2.into(), rs1.into(), $funct3, rd.into(), OP)
        }
    };
}

op_reg!(add, FUNCT3_ADD, 0);
op_reg!(sub, FUNCT3_ADD, FUNCT7_SUB_SRA);
op_reg!(sll, FUNCT3_SLL, 0);
op_reg!(slt, FUNCT3_SLT, 0);
op_reg!(sltu, FUNCT3_SLTU, 0);
op_reg!(xor, FUNCT3_XOR, 0);
op_reg!(srl, FUNCT3_SRL, 0);
op_reg!(sra, FUNCT3_SRL, FUNCT7_SUB_SRA);
op_reg!(or, FUNCT3_OR, 0);
op_reg!(and, FUNCT3_AND, 0);

macro_rules! op_branch {
    ($name:ident, $funct3:expr) => {
        pub fn $name(rs1: u8, rs2: u8, offset: i32) -> u32 {
            btype(offset, rs2.into(), rs1.into(), $funct3, OP_BRANCH)
        }
    };
}

op_branch!(beq, FUNCT3_BEQ);
op_branch!(bne, FUNCT3_BNE);
op_branch!(blt, FUNCT3_BLT);
op_branch!(bge, FUNCT3_BGE);
op_branch!(bltu, FUNCT3_BLTU);
op_branch!(bgeu, FUNCT3_BGEU);

macro_rules! op_load {
    ($name:ident, $funct3:expr) => {
        pub fn $name(rd: u8, rs1: u8, offset: i32) -> u32 {
            itype(offset as u32, rs1.into(), $funct3, rd.into(), OP_LOAD)
        }
    };
}

op_load!(lb, FUNCT3_B);
op_load!(lh, FUNCT3_H);
op_load!(lw, FUNCT3_W);
op_load!(lbu, FUNCT3_BU);
op_load!(lhu, FUNCT3_HU);

macro_rules! op_store {
    ($name:ident, $funct3:expr) => {
        pub fn $name(rs2: u8, rs1: u8, offset: i32) -> u32 {
            let imm = offset as u32;
            rstype(
                imm >> 5 & 0x7f,
                rs2.into(),
                rs1.into(),
                $funct3,
                imm & 0x1f,
                OP_STORE,
            )
        }
    };
}

op_store!(sb, FUNCT3_B);
op_store!(sh, FUNCT3_H);
op_store!(sw, FUNCT3_W);

pub fn lui(rd: u8, imm: u32) -> u32 {
    utype(imm, rd.into(), OP_LUI)
}

pub fn auipc(rd: u8, imm: u32) -> u32 {
    utype(imm, rd.into(), OP_AUIPC)
}

pub fn jal(rd: u8, offset: i32) -> u32 {
    jtype(offset, rd.into(), OP_JAL)
}

pub fn jalr(rd: u8, rs1: u8, offset: i32) -> u32 {
    itype(offset as u32, rs1.into(), FUNCT3_JALR, rd.into(), OP_JALR)
}

pub fn fence() -> u32 {
    OP_MISC_MEM
}

pub fn ecall() -> u32 {
    OP_SYSTEM
}

pub fn ebreak() -> u32 {
    1 << 20 | OP_SYSTEM
}

/// Render a program as the little-endian byte image the DMA loader ships.
pub fn to_bytes(program: &[u32]) -> Vec<u8> {
    program.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hart::fields;

    #[test]
    fn check_addi_round_trip() {
        let instr = addi(1, 2, -23);
        assert_eq!(fields::opcode(instr), OP_IMM);
        assert_eq!(fields::rd(instr), 1);
        assert_eq!(fields::rs1(instr), 2);
        assert_eq!(fields::imm_i(instr), (-23_i32) as u32);
    }

    #[test]
    fn check_branch_offset_round_trip() {
        for offset in [-4096, -16, -2, 0, 2, 30, 4094] {
            let instr = beq(1, 2, offset);
            assert_eq!(fields::imm_b(instr), offset as u32, "offset {offset}");
        }
    }

    #[test]
    fn check_jal_offset_round_trip() {
        for offset in [-1048576, -4, 0, 2, 64, 1048574] {
            let instr = jal(1, offset);
            assert_eq!(fields::imm_j(instr), offset as u32, "offset {offset}");
        }
    }

    #[test]
    fn check_store_offset_round_trip() {
        let instr = sw(1, 2, -15);
        assert_eq!(fields::imm_s(instr), (-15_i32) as u32);
        assert_eq!(fields::rs2(instr), 1);
        assert_eq!(fields::rs1(instr), 2);
    }

    #[test]
    fn check_known_encodings() {
        // Cross-checked against the standard assembler output
        assert_eq!(addi(5, 10, 0), 0x0005_0293);
        assert_eq!(addi(6, 11, 0), 0x0005_8313);
        assert_eq!(addi(7, 12, 0), 0x0006_0393);
        assert_eq!(ecall(), 0x0000_0073);
        assert_eq!(addi(10, 5, 0), 0x0002_8513);
        assert_eq!(jalr(0, 1, 0), 0x0000_8067);
    }
}
