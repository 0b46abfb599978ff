//! Memory controller.
//!
//! A single-port word array shared by every client in the system. The
//! controller exposes `read_channels` read channels and `write_channels`
//! write channels; on each cycle it arbitrates one winner per port (reads
//! and writes are independent ports and may proceed in parallel), acks the
//! winner in the same cycle, and carries the request through an internal
//! delay pipeline before touching the backing store.
//!
//! Responses are registered: with `request_delay = read_latency = 0` the
//! response asserts on the cycle after the ack, so the observable round
//! trip is `request_delay + read_latency + 1` cycles for reads and
//! `request_delay + 1` for writes.
//!
//! When a read and a write to the same word complete on the same cycle the
//! read returns the pre-write value (read-before-write ordering).
//!
//! Addresses index the store modulo its word count, so clients running past
//! the end of memory alias back to the start. The only fault the controller
//! reports is word misalignment, surfaced as the `error` flag on the
//! response; the backing store is untouched and no other channel is
//! affected.

use std::collections::VecDeque;

use log::trace;
use thiserror::Error;

use crate::arbiter::{Arbiter, Arbitration};
use crate::bus::{
    word_aligned, ReadRequest, ReadResponse, WriteRequest, WriteResponse, BYTES_PER_WORD,
};
use crate::stream::Stream;

/// Construction parameters for the controller.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Capacity of the backing store in bytes. Must be a non-zero multiple
    /// of the word size.
    pub num_bytes: usize,
    pub read_channels: usize,
    pub write_channels: usize,
    pub arbitration: Arbitration,
    /// Cycles between accepting a request and presenting it to the store.
    pub request_delay: usize,
    /// Further cycles between reading the store and asserting the response.
    pub read_latency: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            num_bytes: 0x10000,
            read_channels: 2,
            write_channels: 1,
            arbitration: Arbitration::RoundRobin,
            request_delay: 0,
            read_latency: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum MemoryConfigError {
    #[error("backing store capacity must be non-zero")]
    ZeroCapacity,
    #[error("backing store capacity {0} is not a multiple of the word size")]
    UnalignedCapacity(usize),
}

#[derive(Debug)]
struct InFlightRead {
    remaining: usize,
    channel: usize,
    address: u32,
}

#[derive(Debug)]
struct InFlightWrite {
    remaining: usize,
    channel: usize,
    address: u32,
    data: u32,
}

#[derive(Debug)]
pub struct MemoryController {
    words: Vec<u32>,
    read_arb: Arbiter,
    write_arb: Arbiter,
    read_total_delay: usize,
    write_total_delay: usize,
    read_pipe: VecDeque<InFlightRead>,
    write_pipe: VecDeque<InFlightWrite>,
    // Registered per-channel outputs for the current cycle
    read_acks: Vec<bool>,
    write_acks: Vec<bool>,
    read_responses: Vec<Stream<ReadResponse>>,
    write_responses: Vec<Stream<WriteResponse>>,
}

impl MemoryController {
    pub fn new(config: &MemoryConfig) -> Result<Self, MemoryConfigError> {
        if config.num_bytes == 0 {
            return Err(MemoryConfigError::ZeroCapacity);
        }
        if config.num_bytes % BYTES_PER_WORD as usize != 0 {
            return Err(MemoryConfigError::UnalignedCapacity(config.num_bytes));
        }
        Ok(Self {
            words: vec![0; config.num_bytes / BYTES_PER_WORD as usize],
            read_arb: Arbiter::new(config.arbitration, config.read_channels),
            write_arb: Arbiter::new(config.arbitration, config.write_channels),
            read_total_delay: config.request_delay + config.read_latency,
            write_total_delay: config.request_delay,
            read_pipe: VecDeque::new(),
            write_pipe: VecDeque::new(),
            read_acks: vec![false; config.read_channels],
            write_acks: vec![false; config.write_channels],
            read_responses: vec![Stream::idle(); config.read_channels],
            write_responses: vec![Stream::idle(); config.write_channels],
        })
    }

    pub fn num_bytes(&self) -> usize {
        self.words.len() * BYTES_PER_WORD as usize
    }

    fn word_index(&self, address: u32) -> usize {
        (address / BYTES_PER_WORD) as usize % self.words.len()
    }

    /// Advance one clock. `read_requests` and `write_requests` are the
    /// per-channel offers for this cycle; acks and responses become
    /// observable through the accessors until the next call.
    pub fn step(
        &mut self,
        read_requests: &[Stream<ReadRequest>],
        write_requests: &[Stream<WriteRequest>],
    ) {
        self.read_acks.fill(false);
        self.write_acks.fill(false);
        self.read_responses.fill(Stream::idle());
        self.write_responses.fill(Stream::idle());

        // Complete pipeline entries that have matured. Reads are serviced
        // before writes so a same-cycle collision on one word observes the
        // pre-write value.
        if let Some(front) = self.read_pipe.front() {
            if front.remaining == 0 {
                let done = self.read_pipe.pop_front().unwrap();
                let response = if word_aligned(done.address) {
                    ReadResponse {
                        read_data: self.words[self.word_index(done.address)],
                        error: false,
                    }
                } else {
                    ReadResponse {
                        read_data: 0,
                        error: true,
                    }
                };
                trace!(
                    "mem: read ch{} addr {:#010x} -> {:#010x} (error={})",
                    done.channel,
                    done.address,
                    response.read_data,
                    response.error
                );
                self.read_responses[done.channel] = Stream::offer(response);
            }
        }
        if let Some(front) = self.write_pipe.front() {
            if front.remaining == 0 {
                let done = self.write_pipe.pop_front().unwrap();
                let error = !word_aligned(done.address);
                if !error {
                    let index = self.word_index(done.address);
                    self.words[index] = done.data;
                }
                trace!(
                    "mem: write ch{} addr {:#010x} <- {:#010x} (error={})",
                    done.channel,
                    done.address,
                    done.data,
                    error
                );
                self.write_responses[done.channel] = Stream::offer(WriteResponse { error });
            }
        }
        for entry in self.read_pipe.iter_mut() {
            entry.remaining -= 1;
        }
        for entry in self.write_pipe.iter_mut() {
            entry.remaining -= 1;
        }

        // Arbitrate this cycle's offers. The winner is acked combinationally
        // and its request enters the pipeline.
        let read_valids: Vec<bool> = read_requests.iter().map(|r| r.valid).collect();
        if let Some(channel) = self.read_arb.select(&read_valids) {
            self.read_acks[channel] = true;
            self.read_pipe.push_back(InFlightRead {
                remaining: self.read_total_delay,
                channel,
                address: read_requests[channel].data.address,
            });
        }
        let write_valids: Vec<bool> = write_requests.iter().map(|r| r.valid).collect();
        if let Some(channel) = self.write_arb.select(&write_valids) {
            self.write_acks[channel] = true;
            let request = write_requests[channel].data;
            self.write_pipe.push_back(InFlightWrite {
                remaining: self.write_total_delay,
                channel,
                address: request.address,
                data: request.write_data,
            });
        }
        self.read_arb.advance();
        self.write_arb.advance();
    }

    pub fn read_ack(&self, channel: usize) -> bool {
        self.read_acks[channel]
    }

    pub fn write_ack(&self, channel: usize) -> bool {
        self.write_acks[channel]
    }

    pub fn read_response(&self, channel: usize) -> Stream<ReadResponse> {
        self.read_responses[channel]
    }

    pub fn write_response(&self, channel: usize) -> Stream<WriteResponse> {
        self.write_responses[channel]
    }

    /// Drop in-flight requests and pending responses, and reset the
    /// arbitration pointers. The backing store keeps its contents: seeding
    /// and re-seeding memory is the host's job.
    pub fn clear(&mut self) {
        self.read_pipe.clear();
        self.write_pipe.clear();
        self.read_acks.fill(false);
        self.write_acks.fill(false);
        self.read_responses.fill(Stream::idle());
        self.write_responses.fill(Stream::idle());
        self.read_arb.clear();
        self.write_arb.clear();
    }

    // Host-side accessors, used by tests and by the emulator's direct
    // loading path. These bypass the channel model entirely.

    pub fn peek_word(&self, address: u32) -> u32 {
        self.words[self.word_index(address)]
    }

    pub fn poke_word(&mut self, address: u32, data: u32) {
        let index = self.word_index(address);
        self.words[index] = data;
    }

    pub fn peek_byte(&self, address: u32) -> u8 {
        let word = self.peek_word(address);
        (word >> (8 * (address % BYTES_PER_WORD))) as u8
    }

    /// Patch `bytes` into the store starting at `address` (little-endian
    /// within each word, like every bus client sees it).
    pub fn load_image(&mut self, address: u32, bytes: &[u8]) {
        for (offset, &byte) in bytes.iter().enumerate() {
            let address = address.wrapping_add(offset as u32);
            let index = self.word_index(address);
            let shift = 8 * (address % BYTES_PER_WORD);
            self.words[index] = (self.words[index] & !(0xff << shift)) | u32::from(byte) << shift;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(read_channels: usize, write_channels: usize) -> MemoryController {
        MemoryController::new(&MemoryConfig {
            num_bytes: 256,
            read_channels,
            write_channels,
            ..MemoryConfig::default()
        })
        .unwrap()
    }

    fn idle_reads(n: usize) -> Vec<Stream<ReadRequest>> {
        vec![Stream::idle(); n]
    }

    fn idle_writes(n: usize) -> Vec<Stream<WriteRequest>> {
        vec![Stream::idle(); n]
    }

    #[test]
    fn check_capacity_must_be_word_multiple() {
        let result = MemoryController::new(&MemoryConfig {
            num_bytes: 6,
            ..MemoryConfig::default()
        });
        assert!(matches!(result, Err(MemoryConfigError::UnalignedCapacity(6))));
    }

    #[test]
    fn check_store_zero_initialised() {
        let mem = controller(1, 1);
        for address in (0..256).step_by(4) {
            assert_eq!(mem.peek_word(address), 0);
        }
    }

    #[test]
    fn check_write_then_read_round_trip() {
        let mut mem = controller(1, 1);
        mem.step(
            &idle_reads(1),
            &[Stream::offer(WriteRequest {
                address: 16,
                write_data: 0xdead_beef,
            })],
        );
        assert!(mem.write_ack(0));
        // Zero-delay configuration: response on the next cycle
        mem.step(&idle_reads(1), &idle_writes(1));
        let response = mem.write_response(0);
        assert!(response.valid);
        assert!(!response.data.error);

        mem.step(
            &[Stream::offer(ReadRequest { address: 16 })],
            &idle_writes(1),
        );
        assert!(mem.read_ack(0));
        mem.step(&idle_reads(1), &idle_writes(1));
        let response = mem.read_response(0);
        assert!(response.valid);
        assert_eq!(response.data.read_data, 0xdead_beef);
        assert!(!response.data.error);
    }

    #[test]
    fn check_unaligned_read_reports_error() {
        let mut mem = controller(1, 1);
        mem.step(
            &[Stream::offer(ReadRequest { address: 2 })],
            &idle_writes(1),
        );
        assert!(mem.read_ack(0));
        mem.step(&idle_reads(1), &idle_writes(1));
        let response = mem.read_response(0);
        assert!(response.valid);
        assert!(response.data.error);
    }

    #[test]
    fn check_unaligned_write_leaves_store_untouched() {
        let mut mem = controller(1, 1);
        mem.step(
            &idle_reads(1),
            &[Stream::offer(WriteRequest {
                address: 5,
                write_data: 0x1234_5678,
            })],
        );
        mem.step(&idle_reads(1), &idle_writes(1));
        let response = mem.write_response(0);
        assert!(response.valid);
        assert!(response.data.error);
        assert_eq!(mem.peek_word(4), 0);
    }

    #[test]
    fn check_request_delay_stretches_response() {
        let mut mem = MemoryController::new(&MemoryConfig {
            num_bytes: 64,
            read_channels: 1,
            write_channels: 1,
            request_delay: 2,
            read_latency: 1,
            ..MemoryConfig::default()
        })
        .unwrap();
        mem.poke_word(8, 77);
        mem.step(
            &[Stream::offer(ReadRequest { address: 8 })],
            &idle_writes(1),
        );
        assert!(mem.read_ack(0));
        // request_delay + read_latency + 1 = 4 cycles from ack to response
        for _ in 0..3 {
            mem.step(&idle_reads(1), &idle_writes(1));
            assert!(!mem.read_response(0).valid);
        }
        mem.step(&idle_reads(1), &idle_writes(1));
        let response = mem.read_response(0);
        assert!(response.valid);
        assert_eq!(response.data.read_data, 77);
    }

    #[test]
    fn check_one_ack_per_port_per_cycle() {
        let mut mem = controller(2, 1);
        mem.step(
            &[
                Stream::offer(ReadRequest { address: 0 }),
                Stream::offer(ReadRequest { address: 4 }),
            ],
            &idle_writes(1),
        );
        let acks = [mem.read_ack(0), mem.read_ack(1)];
        assert_eq!(acks.iter().filter(|&&a| a).count(), 1);
    }

    #[test]
    fn check_responses_return_on_the_requesting_channel() {
        let mut mem = controller(2, 1);
        mem.poke_word(12, 0x31);
        // Channel 1 requests alone
        mem.step(
            &[
                Stream::idle(),
                Stream::offer(ReadRequest { address: 12 }),
            ],
            &idle_writes(1),
        );
        assert!(!mem.read_ack(0));
        assert!(mem.read_ack(1));
        mem.step(&idle_reads(2), &idle_writes(1));
        assert!(!mem.read_response(0).valid);
        let response = mem.read_response(1);
        assert!(response.valid);
        assert_eq!(response.data.read_data, 0x31);
    }

    #[test]
    fn check_same_cycle_collision_reads_before_writing() {
        let mut mem = controller(1, 1);
        mem.poke_word(20, 0xaaaa_aaaa);
        // Issue the read and the write on the same cycle; with equal
        // pipeline depth both complete on the same later cycle.
        mem.step(
            &[Stream::offer(ReadRequest { address: 20 })],
            &[Stream::offer(WriteRequest {
                address: 20,
                write_data: 0x5555_5555,
            })],
        );
        mem.step(&idle_reads(1), &idle_writes(1));
        let read = mem.read_response(0);
        assert!(read.valid);
        assert_eq!(read.data.read_data, 0xaaaa_aaaa);
        assert_eq!(mem.peek_word(20), 0x5555_5555);
    }

    #[test]
    fn check_address_wraps_modulo_capacity() {
        let mut mem = controller(1, 1);
        // 256-byte store: address 256 aliases address 0
        mem.step(
            &idle_reads(1),
            &[Stream::offer(WriteRequest {
                address: 256,
                write_data: 9,
            })],
        );
        mem.step(&idle_reads(1), &idle_writes(1));
        assert_eq!(mem.peek_word(0), 9);
    }

    #[test]
    fn check_clear_drops_in_flight_requests() {
        let mut mem = controller(1, 1);
        mem.step(
            &[Stream::offer(ReadRequest { address: 0 })],
            &idle_writes(1),
        );
        mem.clear();
        mem.step(&idle_reads(1), &idle_writes(1));
        assert!(!mem.read_response(0).valid);
    }

    #[test]
    fn check_load_image_patches_bytes() {
        let mut mem = controller(1, 1);
        mem.load_image(2, &[0x11, 0x22, 0x33]);
        assert_eq!(mem.peek_word(0), 0x2211_0000);
        assert_eq!(mem.peek_word(4), 0x0000_0033);
        assert_eq!(mem.peek_byte(3), 0x22);
    }
}
