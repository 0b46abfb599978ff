//! Top-level system integration.
//!
//! [`System`] instantiates the memory controller with one channel slot per
//! client and advances every component in dependency order, one call to
//! [`System::step`] per clock:
//!
//! 1. latch every client's request offers (pure functions of their state),
//! 2. step the memory controller (arbitration, same-cycle acks, matured
//!    responses),
//! 3. dispatch hart 0's pending ECALL to the DMA transmit engine,
//! 4. step the serial pipeline (receiver, framer, packet writer, packet
//!    reader, transmitter),
//! 5. step the harts with their acks, responses and ECALL answers,
//! 6. step the video timing generator and framebuffer expander.
//!
//! Channel slots are assigned in a fixed order: reads `[video] [dma]
//! [fetch, load]` per hart, writes `[dma] [store]` per hart, with the
//! optional slots simply absent when the corresponding engine is disabled.
//!
//! A [`System::clear`] zeroes the harts and resets every state machine;
//! memory contents survive, since seeding memory is the host's job (over
//! the DMA wire, or directly for tests).

use log::debug;
use thiserror::Error;

use crate::arbiter::Arbitration;
use crate::bus::{ReadRequest, WriteRequest};
use crate::controller::{MemoryConfig, MemoryConfigError, MemoryController};
use crate::dma::{MemoryToPacket, PacketToMemory, SendCommand, SerialToPacket, PACKET_HEADER};
use crate::hart::{Hart, HartInputs, Transaction};
use crate::stream::Stream;
use crate::uart::{UartConfig, UartConfigError, UartRx, UartTx};
use crate::video::{FrameExpander, TimingGen, VideoConfig, VideoConfigError};

/// Build-time configuration of the whole system.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Capacity of the shared memory in bytes.
    pub num_bytes: usize,
    /// Number of harts; only hart 0 is wired to the ECALL/DMA port.
    pub num_harts: usize,
    pub arbitration: Arbitration,
    pub request_delay: usize,
    pub read_latency: usize,
    /// Serial port and DMA pipeline, or none to omit their channel slots.
    pub uart: Option<UartConfig>,
    /// Video scan-out engine, or none to omit its channel slot.
    pub video: Option<VideoConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_bytes: 0x10000,
            num_harts: 1,
            arbitration: Arbitration::RoundRobin,
            request_delay: 0,
            read_latency: 0,
            uart: Some(UartConfig::default()),
            video: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SystemConfigError {
    #[error("at least one hart is required")]
    NoHarts,
    #[error(transparent)]
    Memory(#[from] MemoryConfigError),
    #[error(transparent)]
    Uart(#[from] UartConfigError),
    #[error(transparent)]
    Video(#[from] VideoConfigError),
}

/// Serial port plus the DMA engines behind it.
#[derive(Debug)]
struct IoController {
    rx: UartRx,
    tx: UartTx,
    framer: SerialToPacket,
    writer: PacketToMemory,
    reader: MemoryToPacket,
}

#[derive(Debug)]
struct VideoOut {
    timing: TimingGen,
    expander: FrameExpander,
}

/// One cycle of video output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelSample {
    pub data_enable: bool,
    pub hsync: bool,
    pub vsync: bool,
    pub on: bool,
}

#[derive(Debug)]
pub struct System {
    memory: MemoryController,
    harts: Vec<Hart>,
    io: Option<IoController>,
    video: Option<VideoOut>,
    /// Host-driven receive line level; idles high.
    rx_line: bool,
    cycle: u64,
}

impl System {
    pub fn new(config: &SystemConfig) -> Result<Self, SystemConfigError> {
        if config.num_harts == 0 {
            return Err(SystemConfigError::NoHarts);
        }
        if let Some(uart) = &config.uart {
            uart.validate()?;
        }
        if let Some(video) = &config.video {
            video.validate()?;
        }
        let has_io = config.uart.is_some();
        let has_video = config.video.is_some();
        let memory = MemoryController::new(&MemoryConfig {
            num_bytes: config.num_bytes,
            read_channels: usize::from(has_video) + usize::from(has_io) + 2 * config.num_harts,
            write_channels: usize::from(has_io) + config.num_harts,
            arbitration: config.arbitration,
            request_delay: config.request_delay,
            read_latency: config.read_latency,
        })?;
        let io = config.uart.map(|uart| IoController {
            rx: UartRx::new(uart),
            tx: UartTx::new(uart),
            framer: SerialToPacket::new(PACKET_HEADER),
            writer: PacketToMemory::new(),
            reader: MemoryToPacket::new(Some(PACKET_HEADER)),
        });
        let video = config.video.map(|video| VideoOut {
            timing: TimingGen::new(video.timing),
            expander: FrameExpander::new(video),
        });
        Ok(Self {
            memory,
            harts: (0..config.num_harts).map(|_| Hart::new()).collect(),
            io,
            video,
            rx_line: true,
            cycle: 0,
        })
    }

    // Channel slot assignment. Reads: [video] [dma] then fetch/load pairs;
    // writes: [dma] then stores.

    fn video_read_channel(&self) -> usize {
        0
    }

    fn dma_read_channel(&self) -> usize {
        usize::from(self.video.is_some())
    }

    fn fetch_channel(&self, hart: usize) -> usize {
        usize::from(self.video.is_some()) + usize::from(self.io.is_some()) + 2 * hart
    }

    fn load_channel(&self, hart: usize) -> usize {
        self.fetch_channel(hart) + 1
    }

    fn dma_write_channel(&self) -> usize {
        0
    }

    fn store_channel(&self, hart: usize) -> usize {
        usize::from(self.io.is_some()) + hart
    }

    /// Advance the whole system one clock.
    pub fn step(&mut self) {
        let read_channels = self.fetch_channel(self.harts.len() - 1) + 2;
        let write_channels = self.store_channel(self.harts.len() - 1) + 1;
        let mut read_requests: Vec<Stream<ReadRequest>> = vec![Stream::idle(); read_channels];
        let mut write_requests: Vec<Stream<WriteRequest>> = vec![Stream::idle(); write_channels];
        if let Some(video) = &self.video {
            read_requests[self.video_read_channel()] = video.expander.read_request();
        }
        if let Some(io) = &self.io {
            read_requests[self.dma_read_channel()] = io.reader.read_request();
            write_requests[self.dma_write_channel()] = io.writer.write_request();
        }
        for n in 0..self.harts.len() {
            read_requests[self.fetch_channel(n)] = self.harts[n].fetch_request();
            read_requests[self.load_channel(n)] = self.harts[n].load_request();
            write_requests[self.store_channel(n)] = self.harts[n].store_request();
        }

        self.memory.step(&read_requests, &write_requests);

        // Hart 0's ECALL reaches the DMA transmit engine; the handler
        // decodes the guest convention (x5 mode, x6 address, x7 length)
        // and answers accepted (1) or busy (0).
        let mut send: Option<SendCommand> = None;
        let mut hart0_transaction: Option<Transaction> = None;
        if self.harts[0].ecall_pending() {
            let hart = &self.harts[0];
            let mode = hart.x(5);
            let idle = matches!(&self.io, Some(io) if !io.reader.busy());
            let accepted = mode == 0 && idle;
            if accepted {
                let command = SendCommand {
                    address: hart.x(6),
                    length: hart.x(7) as u16,
                };
                debug!(
                    "ecall: send accepted, {} bytes from {:#010x}",
                    command.length, command.address
                );
                send = Some(command);
            }
            hart0_transaction = Some(Transaction {
                finished: true,
                set_rd: true,
                new_rd: u32::from(accepted),
                new_pc: hart.pc().wrapping_add(4),
                error: false,
            });
        }

        let dma_read = self.dma_read_channel();
        let dma_write = self.dma_write_channel();
        if let Some(io) = &mut self.io {
            io.rx.step(self.rx_line);
            let rx_byte = io.rx.received().map(|byte| byte.data);

            let framer_out = io.framer.output();
            let framer_fired = framer_out.fires(io.writer.input_ready());
            io.writer.step(
                framer_fired.then_some(framer_out.data),
                self.memory.write_ack(dma_write),
            );
            io.framer.step(rx_byte, framer_fired);

            let reader_out = io.reader.output();
            let tx_fired = reader_out.fires(io.tx.input_ready());
            io.reader.step(
                send,
                self.memory.read_ack(dma_read),
                self.memory.read_response(dma_read),
                tx_fired,
            );
            let tx_input = if tx_fired {
                Stream::offer(reader_out.data.data)
            } else {
                Stream::idle()
            };
            io.tx.step(tx_input);
        }

        for n in 0..self.harts.len() {
            let ecall_transaction = if n == 0 {
                hart0_transaction
            } else if self.harts[n].ecall_pending() {
                // Only hart 0 is wired to the host; the rest get a no-op
                Some(Transaction {
                    finished: true,
                    set_rd: true,
                    new_rd: 0,
                    new_pc: self.harts[n].pc().wrapping_add(4),
                    error: false,
                })
            } else {
                None
            };
            let inputs = HartInputs {
                fetch_ack: self.memory.read_ack(self.fetch_channel(n)),
                fetch_response: self.memory.read_response(self.fetch_channel(n)),
                load_ack: self.memory.read_ack(self.load_channel(n)),
                load_response: self.memory.read_response(self.load_channel(n)),
                store_ack: self.memory.write_ack(self.store_channel(n)),
                store_response: self.memory.write_response(self.store_channel(n)),
                ecall_transaction,
            };
            self.harts[n].step(&inputs);
        }

        let video_channel = self.video_read_channel();
        if let Some(video) = &mut self.video {
            video.timing.step();
            video.expander.step(
                &video.timing,
                self.memory.read_ack(video_channel),
                self.memory.read_response(video_channel),
            );
        }

        self.cycle += 1;
    }

    /// Run `cycles` clocks.
    pub fn run(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.step();
        }
    }

    /// System-level clear: zero the harts, reset every state machine and
    /// drop in-flight memory traffic. Memory contents are preserved.
    pub fn clear(&mut self) {
        for hart in &mut self.harts {
            hart.clear();
        }
        self.memory.clear();
        if let Some(io) = &mut self.io {
            io.rx.clear();
            io.tx.clear();
            io.framer.clear();
            io.writer.clear();
            io.reader.clear();
        }
        if let Some(video) = &mut self.video {
            video.timing.clear();
            video.expander.clear();
        }
        self.rx_line = true;
        self.cycle = 0;
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn hart(&self, n: usize) -> &Hart {
        &self.harts[n]
    }

    pub fn num_harts(&self) -> usize {
        self.harts.len()
    }

    /// Drive the serial receive line for the next cycle.
    pub fn set_rx_line(&mut self, level: bool) {
        self.rx_line = level;
    }

    /// Current serial transmit line level (idle high when no serial port
    /// is fitted).
    pub fn tx_line(&self) -> bool {
        match &self.io {
            Some(io) => io.tx.line(),
            None => true,
        }
    }

    /// The DMA transmit engine is mid-transfer.
    pub fn dma_send_busy(&self) -> bool {
        matches!(&self.io, Some(io) if io.reader.busy())
    }

    /// This cycle's video output signals (all low when no video out is
    /// fitted).
    pub fn pixel(&self) -> PixelSample {
        match &self.video {
            Some(video) => PixelSample {
                data_enable: video.timing.data_enable(),
                hsync: video.timing.hsync(),
                vsync: video.timing.vsync(),
                on: video.expander.pixel(&video.timing),
            },
            None => PixelSample::default(),
        }
    }

    // Host-side memory access, bypassing the channel model.

    pub fn peek_word(&self, address: u32) -> u32 {
        self.memory.peek_word(address)
    }

    pub fn peek_byte(&self, address: u32) -> u8 {
        self.memory.peek_byte(address)
    }

    pub fn poke_word(&mut self, address: u32, data: u32) {
        self.memory.poke_word(address, data);
    }

    pub fn load_image(&mut self, address: u32, bytes: &[u8]) {
        self.memory.load_image(address, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    fn minimal() -> System {
        System::new(&SystemConfig::default()).unwrap()
    }

    #[test]
    fn check_program_executes_from_memory() {
        let mut system = minimal();
        let program = [encode::addi(1, 0, 41), encode::addi(1, 1, 1)];
        system.load_image(0, &encode::to_bytes(&program));
        system.run(50);
        assert_eq!(system.hart(0).x(1), 42);
        assert_eq!(system.hart(0).pc(), 8);
    }

    #[test]
    fn check_clear_preserves_memory_but_zeroes_hart() {
        let mut system = minimal();
        let program = [encode::addi(1, 0, 7)];
        system.load_image(0, &encode::to_bytes(&program));
        system.run(20);
        assert_eq!(system.hart(0).x(1), 7);
        system.clear();
        assert_eq!(system.hart(0).x(1), 0);
        assert_eq!(system.hart(0).pc(), 0);
        // Program still in memory; it runs again
        system.run(20);
        assert_eq!(system.hart(0).x(1), 7);
    }

    #[test]
    fn check_ecall_without_io_reports_busy() {
        let mut system = System::new(&SystemConfig {
            uart: None,
            ..SystemConfig::default()
        })
        .unwrap();
        let program = [
            encode::addi(5, 0, 0),
            encode::ecall(),
            encode::addi(9, 5, 0),
            encode::jal(0, 0), // park
        ];
        system.load_image(0, &encode::to_bytes(&program));
        system.run(50);
        // The answer is busy (0) but execution continues
        assert_eq!(system.hart(0).x(9), 0);
        assert_eq!(system.hart(0).pc(), 12);
        assert!(!system.hart(0).errored());
    }

    #[test]
    fn check_second_hart_ecall_is_a_no_op() {
        let mut system = System::new(&SystemConfig {
            num_harts: 2,
            ..SystemConfig::default()
        })
        .unwrap();
        // Both harts run the same image: ecall, copy x5 to x9, park
        let program = [encode::ecall(), encode::addi(9, 5, 0), encode::jal(0, 0)];
        system.load_image(0, &encode::to_bytes(&program));
        system.run(100);
        assert_eq!(system.hart(1).pc(), 8);
        assert_eq!(system.hart(1).x(9), 0);
        assert!(!system.hart(1).errored());
    }

    #[test]
    fn check_zero_harts_rejected() {
        let result = System::new(&SystemConfig {
            num_harts: 0,
            ..SystemConfig::default()
        });
        assert!(matches!(result, Err(SystemConfigError::NoHarts)));
    }

    #[test]
    fn check_boot_empty_latches_error() {
        // Cleared system, all-zero memory: instruction word 0 is illegal
        let mut system = minimal();
        system.clear();
        system.run(20);
        assert!(system.hart(0).errored());
        assert_eq!(system.hart(0).pc(), 0);
    }
}
