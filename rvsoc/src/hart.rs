//! RV32I hart.
//!
//! One in-order execution context, built as an explicit state machine:
//! fetch issues a read on the instruction channel, decode splits the fetched
//! word and reads the register file, execute dispatches by opcode, and
//! writeback applies the resulting [`Transaction`]. Loads and stores run
//! micro-sequencers against the data read and write channels; sub-word
//! stores read the containing word, splice the addressed bytes and write the
//! whole word back, because the backing store is word granular.
//!
//! A faulting transaction latches the error state: the hart stops issuing
//! requests and the pc stops advancing, leaving the registers inspectable.
//! The ECALL instruction parks the hart until the host answers through the
//! ECALL port; the answer's `new_rd` lands in x5, which is where the guest
//! calling convention looks for it (the instruction's own rd is x0, so the
//! ordinary rd path could never carry the result).

use log::{debug, trace};

use crate::bus::{align_down, ReadRequest, ReadResponse, WriteRequest, WriteResponse};
use crate::stream::Stream;

pub mod decode;
pub mod exec;
pub mod fields;
pub mod opcodes;
pub mod registers;

use decode::{decode, Decoded};
use opcodes::*;
use registers::Registers;

/// Register that receives an ECALL transaction's `new_rd`.
pub const ECALL_RESULT_REGISTER: u8 = 5;

/// The writeback contract every instruction resolves to. Multi-cycle
/// instructions report `finished = false` until their sequencer completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transaction {
    pub finished: bool,
    pub set_rd: bool,
    pub new_rd: u32,
    pub new_pc: u32,
    pub error: bool,
}

impl Transaction {
    /// Advance to the next instruction without touching rd.
    pub fn advance(pc: u32) -> Self {
        Self {
            finished: true,
            set_rd: false,
            new_rd: 0,
            new_pc: pc.wrapping_add(4),
            error: false,
        }
    }

    /// A finished, faulting transaction.
    pub fn fault() -> Self {
        Self {
            finished: true,
            set_rd: false,
            new_rd: 0,
            new_pc: 0,
            error: true,
        }
    }
}

/// Per-cycle inputs from the memory controller and the ECALL host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HartInputs {
    pub fetch_ack: bool,
    pub fetch_response: Stream<ReadResponse>,
    pub load_ack: bool,
    pub load_response: Stream<ReadResponse>,
    pub store_ack: bool,
    pub store_response: Stream<WriteResponse>,
    /// Host answer to a pending ECALL. Ignored unless the hart is parked
    /// on the ECALL port; the hart resumes on the first answer with
    /// `finished = true`.
    pub ecall_transaction: Option<Transaction>,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Fetch,
    FetchWait,
    Execute(Decoded),
    LoadIssue(Decoded, u32),
    LoadWait(Decoded, u32),
    StoreReadIssue(Decoded, u32),
    StoreReadWait(Decoded, u32),
    StoreWriteIssue(Decoded, u32, u32),
    StoreWriteWait(Decoded),
    Ecall,
    Halted,
}

#[derive(Debug)]
pub struct Hart {
    pc: u32,
    registers: Registers,
    state: State,
    errored: bool,
}

impl Default for Hart {
    fn default() -> Self {
        Self::new()
    }
}

impl Hart {
    pub fn new() -> Self {
        Self {
            pc: 0,
            registers: Registers::default(),
            state: State::Fetch,
            errored: false,
        }
    }

    /// Zero the registers and pc and restart from fetch.
    pub fn clear(&mut self) {
        self.pc = 0;
        self.registers.clear();
        self.state = State::Fetch;
        self.errored = false;
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Read register `xn`.
    pub fn x(&self, n: u8) -> u32 {
        self.registers.read(n)
    }

    /// True once a faulting transaction has latched; the hart no longer
    /// issues requests or advances the pc.
    pub fn errored(&self) -> bool {
        self.errored
    }

    /// True while the hart is parked on the ECALL port waiting for the
    /// host's transaction.
    pub fn ecall_pending(&self) -> bool {
        matches!(self.state, State::Ecall)
    }

    /// This cycle's instruction-fetch offer.
    pub fn fetch_request(&self) -> Stream<ReadRequest> {
        match self.state {
            State::Fetch => Stream::offer(ReadRequest { address: self.pc }),
            _ => Stream::idle(),
        }
    }

    /// This cycle's data-load offer. Sub-word stores also read through this
    /// channel for their read-modify-write sequence.
    pub fn load_request(&self) -> Stream<ReadRequest> {
        match self.state {
            State::LoadIssue(_, address) | State::StoreReadIssue(_, address) => {
                Stream::offer(ReadRequest {
                    address: align_down(address),
                })
            }
            _ => Stream::idle(),
        }
    }

    /// This cycle's data-store offer.
    pub fn store_request(&self) -> Stream<WriteRequest> {
        match self.state {
            State::StoreWriteIssue(_, address, data) => Stream::offer(WriteRequest {
                address: align_down(address),
                write_data: data,
            }),
            _ => Stream::idle(),
        }
    }

    /// Advance one clock.
    pub fn step(&mut self, inputs: &HartInputs) {
        self.state = match self.state {
            State::Fetch => {
                if inputs.fetch_ack {
                    State::FetchWait
                } else {
                    State::Fetch
                }
            }
            State::FetchWait => match inputs.fetch_response.get() {
                Some(response) if response.error => {
                    debug!("hart: instruction fetch fault at pc {:#010x}", self.pc);
                    self.latch_error();
                    State::Halted
                }
                Some(response) => {
                    let d = decode(response.read_data, &self.registers);
                    trace!(
                        "hart: pc {:#010x} instr {:#010x}",
                        self.pc,
                        response.read_data
                    );
                    State::Execute(d)
                }
                None => State::FetchWait,
            },
            State::Execute(d) => self.execute(&d),
            State::LoadIssue(d, address) => {
                if inputs.load_ack {
                    State::LoadWait(d, address)
                } else {
                    State::LoadIssue(d, address)
                }
            }
            State::LoadWait(d, address) => match inputs.load_response.get() {
                Some(response) if response.error => self.writeback(&Transaction::fault(), d.rd),
                Some(response) => {
                    let value = exec::extract_load(response.read_data, address, d.funct3);
                    self.writeback(
                        &Transaction {
                            finished: true,
                            set_rd: true,
                            new_rd: value,
                            new_pc: self.pc.wrapping_add(4),
                            error: false,
                        },
                        d.rd,
                    )
                }
                None => State::LoadWait(d, address),
            },
            State::StoreReadIssue(d, address) => {
                if inputs.load_ack {
                    State::StoreReadWait(d, address)
                } else {
                    State::StoreReadIssue(d, address)
                }
            }
            State::StoreReadWait(d, address) => match inputs.load_response.get() {
                Some(response) if response.error => self.writeback(&Transaction::fault(), d.rd),
                Some(response) => {
                    let word =
                        exec::splice_store(response.read_data, address, d.funct3, d.rs2_value);
                    State::StoreWriteIssue(d, address, word)
                }
                None => State::StoreReadWait(d, address),
            },
            State::StoreWriteIssue(d, address, data) => {
                if inputs.store_ack {
                    State::StoreWriteWait(d)
                } else {
                    State::StoreWriteIssue(d, address, data)
                }
            }
            State::StoreWriteWait(d) => match inputs.store_response.get() {
                Some(response) => {
                    let transaction = if response.error {
                        Transaction::fault()
                    } else {
                        Transaction::advance(self.pc)
                    };
                    self.writeback(&transaction, d.rd)
                }
                None => State::StoreWriteWait(d),
            },
            State::Ecall => match inputs.ecall_transaction {
                Some(transaction) if transaction.finished => {
                    self.writeback(&transaction, ECALL_RESULT_REGISTER)
                }
                _ => State::Ecall,
            },
            State::Halted => State::Halted,
        };
    }

    /// Opcode dispatch for the execute stage. Memory instructions hand over
    /// to their sequencer states; everything else resolves to a transaction
    /// on the spot.
    fn execute(&mut self, d: &Decoded) -> State {
        match d.opcode {
            OP_IMM => self.writeback(&exec::execute_op_imm(d, self.pc), d.rd),
            OP => self.writeback(&exec::execute_op(d, self.pc), d.rd),
            OP_LUI => self.writeback(&exec::execute_lui(d, self.pc), d.rd),
            OP_AUIPC => self.writeback(&exec::execute_auipc(d, self.pc), d.rd),
            OP_JAL => self.writeback(&exec::execute_jal(d, self.pc), d.rd),
            OP_JALR => self.writeback(&exec::execute_jalr(d, self.pc), d.rd),
            OP_BRANCH => self.writeback(&exec::execute_branch(d, self.pc), d.rd),
            OP_MISC_MEM => self.writeback(&exec::execute_misc_mem(d, self.pc), d.rd),
            OP_LOAD => {
                let address = d.rs1_value.wrapping_add(d.imm_i);
                if exec::invalid_load(d.funct3) || exec::access_misaligned(d.funct3, address) {
                    self.writeback(&Transaction::fault(), d.rd)
                } else {
                    State::LoadIssue(*d, address)
                }
            }
            OP_STORE => {
                let address = d.rs1_value.wrapping_add(d.imm_s);
                if exec::invalid_store(d.funct3) || exec::access_misaligned(d.funct3, address) {
                    self.writeback(&Transaction::fault(), d.rd)
                } else if d.funct3 == FUNCT3_W {
                    // Whole-word stores skip the read-modify-write
                    State::StoreWriteIssue(*d, address, d.rs2_value)
                } else {
                    State::StoreReadIssue(*d, address)
                }
            }
            OP_SYSTEM => {
                if d.funct3 == FUNCT3_ECALL && d.imm_i == 0 {
                    debug!("hart: ecall at pc {:#010x}", self.pc);
                    State::Ecall
                } else {
                    self.writeback(&exec::execute_system_unsupported(self.pc), d.rd)
                }
            }
            _ => {
                debug!(
                    "hart: illegal opcode {:#04x} at pc {:#010x}",
                    d.opcode, self.pc
                );
                self.writeback(&Transaction::fault(), d.rd)
            }
        }
    }

    /// Apply a finished transaction: commit rd, then either latch the error
    /// or advance the pc and return to fetch.
    fn writeback(&mut self, transaction: &Transaction, rd: u8) -> State {
        if transaction.set_rd {
            self.registers.write(rd, transaction.new_rd);
        }
        if transaction.error {
            self.latch_error();
            State::Halted
        } else {
            self.pc = transaction.new_pc;
            State::Fetch
        }
    }

    fn latch_error(&mut self) {
        debug!("hart: error latched at pc {:#010x}", self.pc);
        self.errored = true;
    }
}
