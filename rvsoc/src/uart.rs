//! Bit-banged UART.
//!
//! One wire per direction, idle high. A frame is a low start bit, eight
//! data bits LSB first, an optional even parity bit, and `stop_bits` high
//! stop bits, each lasting `clock_frequency / baud_rate` cycles. The
//! receiver detects the falling start edge and samples every subsequent bit
//! at the middle of its period.
//!
//! The receiver reports `parity_error` and `stop_bit_unstable` alongside
//! the data but still forwards the byte; recovering from a desynchronised
//! stream is the packet framer's job (it scans for the next header byte).

use log::trace;
use thiserror::Error;

use crate::stream::Stream;

#[derive(Debug, Clone, Copy)]
pub struct UartConfig {
    pub clock_frequency: u32,
    pub baud_rate: u32,
    /// Append an even parity bit when true.
    pub parity: bool,
    pub stop_bits: u32,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            clock_frequency: 8,
            baud_rate: 1,
            parity: false,
            stop_bits: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum UartConfigError {
    #[error("baud rate must be non-zero")]
    ZeroBaudRate,
    #[error("bit period {0} is too short; the clock must run at least twice the baud rate")]
    BitPeriodTooShort(u32),
    #[error("stop bits must be 1 or 2, got {0}")]
    InvalidStopBits(u32),
}

impl UartConfig {
    /// Clock cycles per wire bit.
    pub fn bit_period(&self) -> u32 {
        self.clock_frequency / self.baud_rate
    }

    /// Cycles occupied by one full frame on the wire.
    pub fn frame_period(&self) -> u32 {
        let bits = 1 + 8 + u32::from(self.parity) + self.stop_bits;
        bits * self.bit_period()
    }

    pub fn validate(&self) -> Result<(), UartConfigError> {
        if self.baud_rate == 0 {
            return Err(UartConfigError::ZeroBaudRate);
        }
        if self.bit_period() < 2 {
            return Err(UartConfigError::BitPeriodTooShort(self.bit_period()));
        }
        if self.stop_bits == 0 || self.stop_bits > 2 {
            return Err(UartConfigError::InvalidStopBits(self.stop_bits));
        }
        Ok(())
    }
}

fn even_parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 1
}

#[derive(Debug, Clone, Copy)]
enum TxState {
    Idle,
    Start,
    Data(u32),
    Parity,
    Stop(u32),
}

/// Transmit engine: accepts one byte at a time through a valid/ready input
/// and drives the line.
#[derive(Debug)]
pub struct UartTx {
    config: UartConfig,
    state: TxState,
    /// Cycles left in the current bit period.
    counter: u32,
    shift: u8,
}

impl UartTx {
    pub fn new(config: UartConfig) -> Self {
        Self {
            config,
            state: TxState::Idle,
            counter: 0,
            shift: 0,
        }
    }

    /// Ready to accept the next byte.
    pub fn input_ready(&self) -> bool {
        matches!(self.state, TxState::Idle)
    }

    /// Current line level.
    pub fn line(&self) -> bool {
        match self.state {
            TxState::Idle | TxState::Stop(_) => true,
            TxState::Start => false,
            TxState::Data(bit) => self.shift >> bit & 1 == 1,
            TxState::Parity => even_parity(self.shift),
        }
    }

    pub fn clear(&mut self) {
        self.state = TxState::Idle;
        self.counter = 0;
    }

    /// Advance one clock. The input transfers when the engine is idle and
    /// `input.valid` is set.
    pub fn step(&mut self, input: Stream<u8>) {
        match self.state {
            TxState::Idle => {
                if let Some(&byte) = input.get() {
                    trace!("uart tx: frame {byte:#04x}");
                    self.shift = byte;
                    self.state = TxState::Start;
                    self.counter = self.config.bit_period();
                }
            }
            _ => {
                self.counter -= 1;
                if self.counter == 0 {
                    self.counter = self.config.bit_period();
                    self.state = match self.state {
                        TxState::Start => TxState::Data(0),
                        TxState::Data(7) => {
                            if self.config.parity {
                                TxState::Parity
                            } else {
                                TxState::Stop(self.config.stop_bits)
                            }
                        }
                        TxState::Data(bit) => TxState::Data(bit + 1),
                        TxState::Parity => TxState::Stop(self.config.stop_bits),
                        TxState::Stop(1) => TxState::Idle,
                        TxState::Stop(n) => TxState::Stop(n - 1),
                        TxState::Idle => TxState::Idle,
                    };
                    if matches!(self.state, TxState::Idle) {
                        self.counter = 0;
                    }
                }
            }
        }
    }
}

/// A byte recovered from the wire, with receiver status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxByte {
    pub data: u8,
    pub parity_error: bool,
    pub stop_bit_unstable: bool,
}

#[derive(Debug, Clone, Copy)]
enum RxState {
    Idle,
    Start,
    Data(u32),
    Parity,
    Stop(u32),
}

/// Receive engine: watches the line and emits one [`RxByte`] pulse per
/// frame. There is no backpressure at the wire level.
#[derive(Debug)]
pub struct UartRx {
    config: UartConfig,
    state: RxState,
    /// Cycles until the next mid-bit sample point.
    counter: u32,
    shift: u8,
    parity_error: bool,
    stop_bit_unstable: bool,
    received: Option<RxByte>,
}

impl UartRx {
    pub fn new(config: UartConfig) -> Self {
        Self {
            config,
            state: RxState::Idle,
            counter: 0,
            shift: 0,
            parity_error: false,
            stop_bit_unstable: false,
            received: None,
        }
    }

    /// The byte completed on the most recent step, if any. Valid for one
    /// cycle.
    pub fn received(&self) -> Option<RxByte> {
        self.received
    }

    pub fn clear(&mut self) {
        self.state = RxState::Idle;
        self.counter = 0;
        self.received = None;
    }

    /// Advance one clock with the current line level.
    pub fn step(&mut self, line: bool) {
        self.received = None;
        match self.state {
            RxState::Idle => {
                if !line {
                    // Falling edge: aim for the middle of the start bit
                    self.state = RxState::Start;
                    self.counter = self.config.bit_period() / 2;
                }
            }
            _ => {
                self.counter -= 1;
                if self.counter == 0 {
                    self.sample(line);
                }
            }
        }
    }

    fn sample(&mut self, line: bool) {
        self.counter = self.config.bit_period();
        self.state = match self.state {
            RxState::Start => {
                if line {
                    // Glitch, not a real start bit
                    RxState::Idle
                } else {
                    self.shift = 0;
                    self.parity_error = false;
                    self.stop_bit_unstable = false;
                    RxState::Data(0)
                }
            }
            RxState::Data(bit) => {
                self.shift |= u8::from(line) << bit;
                if bit == 7 {
                    if self.config.parity {
                        RxState::Parity
                    } else {
                        RxState::Stop(self.config.stop_bits)
                    }
                } else {
                    RxState::Data(bit + 1)
                }
            }
            RxState::Parity => {
                self.parity_error = line != even_parity(self.shift);
                RxState::Stop(self.config.stop_bits)
            }
            RxState::Stop(n) => {
                if !line {
                    self.stop_bit_unstable = true;
                }
                if n == 1 {
                    trace!(
                        "uart rx: byte {:#04x} (parity_error={}, stop_bit_unstable={})",
                        self.shift,
                        self.parity_error,
                        self.stop_bit_unstable
                    );
                    self.received = Some(RxByte {
                        data: self.shift,
                        parity_error: self.parity_error,
                        stop_bit_unstable: self.stop_bit_unstable,
                    });
                    RxState::Idle
                } else {
                    RxState::Stop(n - 1)
                }
            }
            RxState::Idle => RxState::Idle,
        };
    }
}
