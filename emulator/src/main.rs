//! Host-side runner for the system model.
//!
//! Loads a guest image (raw binary or ELF), delivers it over the UART wire
//! as framed DMA packets (or pokes it straight into memory with
//! `--direct`), clears the machine and runs a cycle budget while draining
//! the transmit line to stdout. Optionally dumps the framebuffer as ASCII
//! art at the end.

use std::process::ExitCode;

use clap::Parser;
use clap_num::maybe_hex;
use log::info;

use rvsoc::dma::PACKET_HEADER;
use rvsoc::stream::Stream;
use rvsoc::system::{System, SystemConfig};
use rvsoc::uart::{UartConfig, UartRx, UartTx};
use rvsoc::video::VideoConfig;

mod loader;

/// Run a guest program on the RV32I system-on-chip model
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the guest image (ELF or raw binary)
    input: String,

    /// Load address for raw binaries (use 0x prefix for hexadecimal)
    #[arg(short, long, value_parser = maybe_hex::<u32>, default_value_t = 0)]
    load_address: u32,

    /// Number of clock cycles to run after reset
    #[arg(short, long, default_value_t = 10_000_000)]
    cycles: u64,

    /// Number of harts
    #[arg(long, default_value_t = 1)]
    harts: usize,

    /// Backing store capacity in bytes
    #[arg(long, value_parser = maybe_hex::<u32>, default_value_t = 0x10000)]
    memory: u32,

    /// Poke the image straight into memory instead of framing it through
    /// the serial port
    #[arg(short, long)]
    direct: bool,

    /// Fit the video scan-out engine and dump one framebuffer's worth of
    /// ASCII art when the run ends
    #[arg(short, long)]
    video: bool,
}

/// Bit-bang `bytes` into the system's receive line as one DMA packet per
/// call, stepping the system as the wire toggles.
fn send_packet(system: &mut System, config: UartConfig, address: u32, payload: &[u8]) {
    let mut wire = vec![PACKET_HEADER];
    wire.extend_from_slice(&((payload.len() + 4) as u16).to_be_bytes());
    wire.extend_from_slice(&address.to_be_bytes());
    wire.extend_from_slice(payload);

    let mut tx = UartTx::new(config);
    let mut feed = wire.iter().copied();
    let mut next = feed.next();
    let mut idle = 0;
    while idle < config.frame_period() * 2 {
        let input = match next {
            Some(byte) if tx.input_ready() => {
                next = feed.next();
                Stream::offer(byte)
            }
            _ => Stream::idle(),
        };
        if next.is_none() && tx.input_ready() {
            idle += 1;
        }
        system.set_rx_line(tx.line());
        tx.step(input);
        system.step();
    }
}

fn dump_framebuffer(system: &System, video: &VideoConfig) {
    println!("framebuffer {}x{}:", video.input_width, video.input_height);
    for y in 0..video.input_height {
        let mut line = String::new();
        for x in 0..video.input_width {
            let bit = u64::from(y) * u64::from(video.input_width) + u64::from(x);
            let word = system.peek_word(video.framebuffer_address + (bit / 32 * 4) as u32);
            line.push(if word >> (bit % 32) & 1 == 1 { '#' } else { '.' });
        }
        println!("{line}");
    }
}

fn run(args: &Args) -> Result<(), String> {
    let uart = UartConfig::default();
    let video = VideoConfig::default();
    let config = SystemConfig {
        num_bytes: args.memory as usize,
        num_harts: args.harts,
        uart: Some(uart),
        video: args.video.then_some(video),
        ..SystemConfig::default()
    };
    let mut system = System::new(&config).map_err(|e| e.to_string())?;

    let file = std::fs::read(&args.input).map_err(|e| format!("{}: {e}", args.input))?;
    let segments = if loader::is_elf(&file) {
        loader::load_elf(&file).map_err(|e| e.to_string())?
    } else {
        vec![loader::Segment {
            name: String::from("raw"),
            address: args.load_address,
            bytes: file,
        }]
    };

    for segment in &segments {
        info!(
            "loading {} ({} bytes at {:#010x}){}",
            segment.name,
            segment.bytes.len(),
            segment.address,
            if args.direct { " directly" } else { " over the wire" }
        );
        if args.direct {
            system.load_image(segment.address, &segment.bytes);
        } else {
            // The packet length field is 16 bits; ship large sections in
            // chunks
            for (n, chunk) in segment.bytes.chunks(0x8000).enumerate() {
                send_packet(
                    &mut system,
                    uart,
                    segment.address + (n * 0x8000) as u32,
                    chunk,
                );
            }
        }
    }

    // Start the machine from a clean state; the image stays in memory
    system.clear();
    info!("running for {} cycles", args.cycles);

    let mut host_rx = UartRx::new(uart);
    let mut output = Vec::new();
    for _ in 0..args.cycles {
        host_rx.step(system.tx_line());
        system.step();
        if let Some(byte) = host_rx.received() {
            output.push(byte.data);
        }
        if system.hart(0).errored() && !system.dma_send_busy() {
            break;
        }
    }

    if !output.is_empty() {
        println!("uart tx: {}", String::from_utf8_lossy(&output));
    }
    for n in 0..config.num_harts {
        let hart = system.hart(n);
        println!(
            "hart {n}: pc={:#010x} errored={} x1={:#x} x2={:#x} a0={:#x}",
            hart.pc(),
            hart.errored(),
            hart.x(1),
            hart.x(2),
            hart.x(10),
        );
    }
    if args.video {
        dump_framebuffer(&system, &video);
    }
    info!("stopped after {} cycles", system.cycle());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
