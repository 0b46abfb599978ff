//! Single-cycle instruction execution.
//!
//! Every instruction resolves to a [`Transaction`], the writeback contract:
//! whether it finished, whether (and with what) it writes rd, the next pc,
//! and whether it faulted. The functions here cover the instructions that
//! complete without touching memory; the load/store micro-sequencers in the
//! hart use the extraction and splicing helpers at the bottom.
//!
//! Instruction behaviour follows the RV32I chapter of the unprivileged
//! specification version 20191213.

use super::decode::Decoded;
use super::fields::sign_extend;
use super::opcodes::*;
use super::Transaction;

/// Branch targets and jump targets must stay 4-byte aligned; a taken
/// control transfer to an unaligned address faults instead of jumping.
fn control_transfer(rd_value: Option<u32>, target: u32) -> Transaction {
    Transaction {
        finished: true,
        set_rd: rd_value.is_some(),
        new_rd: rd_value.unwrap_or(0),
        new_pc: target,
        error: target % 4 != 0,
    }
}

/// The shared ALU. `subtract` selects SUB on the ADD code (register form
/// only) and `arithmetic` selects SRA on the SRL code; both come from bit
/// 30 of the instruction.
fn alu(funct3: u32, subtract: bool, arithmetic: bool, a: u32, b: u32) -> u32 {
    match funct3 {
        FUNCT3_ADD => {
            if subtract {
                a.wrapping_sub(b)
            } else {
                a.wrapping_add(b)
            }
        }
        FUNCT3_SLL => a << (b & 0x1f),
        FUNCT3_SLT => ((a as i32) < (b as i32)) as u32,
        FUNCT3_SLTU => (a < b) as u32,
        FUNCT3_XOR => a ^ b,
        FUNCT3_SRL => {
            if arithmetic {
                ((a as i32) >> (b & 0x1f)) as u32
            } else {
                a >> (b & 0x1f)
            }
        }
        FUNCT3_OR => a | b,
        FUNCT3_AND => a & b,
        _ => unreachable!("funct3 is three bits"),
    }
}

fn rd_result(pc: u32, value: u32) -> Transaction {
    Transaction {
        finished: true,
        set_rd: true,
        new_rd: value,
        new_pc: pc.wrapping_add(4),
        error: false,
    }
}

pub fn execute_op_imm(d: &Decoded, pc: u32) -> Transaction {
    // There is no subtract-immediate; bit 30 only ever selects SRAI
    let arithmetic = d.funct3 == FUNCT3_SRL && d.funct7 == FUNCT7_SUB_SRA;
    rd_result(pc, alu(d.funct3, false, arithmetic, d.rs1_value, d.imm_i))
}

pub fn execute_op(d: &Decoded, pc: u32) -> Transaction {
    let modifier = d.funct7 == FUNCT7_SUB_SRA;
    let subtract = d.funct3 == FUNCT3_ADD && modifier;
    let arithmetic = d.funct3 == FUNCT3_SRL && modifier;
    rd_result(pc, alu(d.funct3, subtract, arithmetic, d.rs1_value, d.rs2_value))
}

pub fn execute_lui(d: &Decoded, pc: u32) -> Transaction {
    rd_result(pc, d.imm_u)
}

pub fn execute_auipc(d: &Decoded, pc: u32) -> Transaction {
    rd_result(pc, pc.wrapping_add(d.imm_u))
}

pub fn execute_jal(d: &Decoded, pc: u32) -> Transaction {
    control_transfer(Some(pc.wrapping_add(4)), pc.wrapping_add(d.imm_j))
}

pub fn execute_jalr(d: &Decoded, pc: u32) -> Transaction {
    let target = 0xffff_fffe & d.rs1_value.wrapping_add(d.imm_i);
    control_transfer(Some(pc.wrapping_add(4)), target)
}

pub fn execute_branch(d: &Decoded, pc: u32) -> Transaction {
    let taken = match d.funct3 {
        FUNCT3_BEQ => d.rs1_value == d.rs2_value,
        FUNCT3_BNE => d.rs1_value != d.rs2_value,
        FUNCT3_BLT => (d.rs1_value as i32) < (d.rs2_value as i32),
        FUNCT3_BGE => (d.rs1_value as i32) >= (d.rs2_value as i32),
        FUNCT3_BLTU => d.rs1_value < d.rs2_value,
        FUNCT3_BGEU => d.rs1_value >= d.rs2_value,
        _ => return Transaction::fault(),
    };
    if taken {
        control_transfer(None, pc.wrapping_add(d.imm_b))
    } else {
        Transaction::advance(pc)
    }
}

/// FENCE: ordering is trivial in a single shared memory, so it reduces to
/// advancing the pc.
pub fn execute_misc_mem(_d: &Decoded, pc: u32) -> Transaction {
    Transaction::advance(pc)
}

/// SYSTEM instructions other than ECALL (EBREAK, the CSR group) are
/// unsupported. The original hardware reports them with `error` raised and
/// `new_rd = 1`, preserved here for compatibility.
pub fn execute_system_unsupported(pc: u32) -> Transaction {
    Transaction {
        finished: true,
        set_rd: true,
        new_rd: 1,
        new_pc: pc.wrapping_add(4),
        error: true,
    }
}

/// True when `funct3` is not a load the hart implements.
pub fn invalid_load(funct3: u32) -> bool {
    !matches!(
        funct3,
        FUNCT3_B | FUNCT3_H | FUNCT3_W | FUNCT3_BU | FUNCT3_HU
    )
}

/// True when `funct3` is not a store the hart implements.
pub fn invalid_store(funct3: u32) -> bool {
    !matches!(funct3, FUNCT3_B | FUNCT3_H | FUNCT3_W)
}

/// Loads and stores must be naturally aligned: the backing store is word
/// granular, so a sub-word access may not cross its word.
pub fn access_misaligned(funct3: u32, address: u32) -> bool {
    match funct3 & 0b011 {
        FUNCT3_H => address % 2 != 0,
        FUNCT3_W => address % 4 != 0,
        _ => false,
    }
}

/// Select and extend the loaded value out of the aligned word returned by
/// the memory controller.
pub fn extract_load(word: u32, address: u32, funct3: u32) -> u32 {
    let byte_offset = address % 4;
    match funct3 {
        FUNCT3_B => sign_extend(word >> (8 * byte_offset) & 0xff, 7),
        FUNCT3_BU => word >> (8 * byte_offset) & 0xff,
        FUNCT3_H => sign_extend(word >> (8 * byte_offset) & 0xffff, 15),
        FUNCT3_HU => word >> (8 * byte_offset) & 0xffff,
        _ => word,
    }
}

/// Replace the addressed bytes of `word` with the low bytes of `value`,
/// for the read-modify-write step of a sub-word store.
pub fn splice_store(word: u32, address: u32, funct3: u32, value: u32) -> u32 {
    let shift = 8 * (address % 4);
    match funct3 {
        FUNCT3_B => (word & !(0xff << shift)) | (value & 0xff) << shift,
        FUNCT3_H => (word & !(0xffff << shift)) | (value & 0xffff) << shift,
        _ => value,
    }
}
