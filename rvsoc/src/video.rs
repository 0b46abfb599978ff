//! Video scan-out.
//!
//! A timing generator walks the full horizontal/vertical raster (active,
//! front porch, sync, back porch) one pixel per clock, producing hsync,
//! vsync and data-enable. The framebuffer expander follows it, mapping each
//! output pixel back to a bit of the compact framebuffer and scaling by
//! pixel replication.
//!
//! The framebuffer is a row-major bitvector packed LSB first into
//! little-endian words. The expander keeps the words spanning one input row
//! in an on-chip cache and refills it through its memory read channel
//! during blanking, ahead of the first output line that needs the row, so
//! every active pixel is served from the cache within its one-cycle
//! deadline. A vsync edge invalidates the cache and the prefetch of row
//! zero happens in the vertical back porch.

use log::trace;
use thiserror::Error;

use crate::bus::{ReadRequest, ReadResponse, BYTES_PER_WORD};
use crate::stream::Stream;

/// One axis of the raster: active pixels then front porch, sync and back
/// porch, all in pixel clocks.
#[derive(Debug, Clone, Copy)]
pub struct TimingParams {
    pub active: u32,
    pub front_porch: u32,
    pub sync: u32,
    pub back_porch: u32,
}

impl TimingParams {
    pub fn total(&self) -> u32 {
        self.active + self.front_porch + self.sync + self.back_porch
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    pub horizontal: TimingParams,
    pub vertical: TimingParams,
}

/// Raster walker. `x` counts pixel clocks along the line, `y` counts
/// lines; both include the blanking regions.
#[derive(Debug)]
pub struct TimingGen {
    config: TimingConfig,
    x: u32,
    y: u32,
}

impl TimingGen {
    pub fn new(config: TimingConfig) -> Self {
        Self { config, x: 0, y: 0 }
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    /// In the active region of both axes.
    pub fn data_enable(&self) -> bool {
        self.x < self.config.horizontal.active && self.y < self.config.vertical.active
    }

    pub fn hsync(&self) -> bool {
        let h = &self.config.horizontal;
        self.x >= h.active + h.front_porch && self.x < h.active + h.front_porch + h.sync
    }

    pub fn vsync(&self) -> bool {
        let v = &self.config.vertical;
        self.y >= v.active + v.front_porch && self.y < v.active + v.front_porch + v.sync
    }

    pub fn clear(&mut self) {
        self.x = 0;
        self.y = 0;
    }

    /// Advance one pixel clock.
    pub fn step(&mut self) {
        self.x += 1;
        if self.x == self.config.horizontal.total() {
            self.x = 0;
            self.y += 1;
            if self.y == self.config.vertical.total() {
                self.y = 0;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VideoConfig {
    pub input_width: u32,
    pub input_height: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub framebuffer_address: u32,
    pub timing: TimingConfig,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            input_width: 32,
            input_height: 32,
            output_width: 64,
            output_height: 64,
            framebuffer_address: 0x8000,
            timing: TimingConfig {
                horizontal: TimingParams {
                    active: 64,
                    front_porch: 4,
                    sync: 8,
                    back_porch: 8,
                },
                vertical: TimingParams {
                    active: 64,
                    front_porch: 2,
                    sync: 2,
                    back_porch: 4,
                },
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum VideoConfigError {
    #[error("input and output dimensions must be non-zero")]
    ZeroDimension,
    #[error("output {output}x is smaller than input {input} on one axis")]
    OutputSmallerThanInput { input: u32, output: u32 },
    #[error("timing active region {active} does not match output dimension {output}")]
    TimingMismatch { active: u32, output: u32 },
}

impl VideoConfig {
    pub fn validate(&self) -> Result<(), VideoConfigError> {
        if self.input_width == 0
            || self.input_height == 0
            || self.output_width == 0
            || self.output_height == 0
        {
            return Err(VideoConfigError::ZeroDimension);
        }
        for (input, output) in [
            (self.input_width, self.output_width),
            (self.input_height, self.output_height),
        ] {
            if output < input {
                return Err(VideoConfigError::OutputSmallerThanInput { input, output });
            }
        }
        for (active, output) in [
            (self.timing.horizontal.active, self.output_width),
            (self.timing.vertical.active, self.output_height),
        ] {
            if active != output {
                return Err(VideoConfigError::TimingMismatch { active, output });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum FetchState {
    Idle,
    Issue { word: u32 },
    Wait { word: u32 },
}

/// Expands the framebuffer to the output raster through a one-row cache.
#[derive(Debug)]
pub struct FrameExpander {
    config: VideoConfig,
    row_cache: Vec<u32>,
    /// Input row currently held by the cache, once a fetch completed.
    cached_row: Option<u32>,
    /// Input row a fetch in progress is filling.
    fetching_row: u32,
    fetch: FetchState,
    prev_vsync: bool,
}

impl FrameExpander {
    pub fn new(config: VideoConfig) -> Self {
        let words = words_per_row(config.input_width);
        Self {
            config,
            row_cache: vec![0; words as usize],
            cached_row: None,
            fetching_row: 0,
            fetch: FetchState::Idle,
            prev_vsync: false,
        }
    }

    /// This cycle's memory read offer.
    pub fn read_request(&self) -> Stream<ReadRequest> {
        match self.fetch {
            FetchState::Issue { word } => Stream::offer(ReadRequest {
                address: self.row_address(self.fetching_row, word),
            }),
            _ => Stream::idle(),
        }
    }

    /// The pixel for the timing generator's current position: the selected
    /// framebuffer bit during data-enable, zero through blanking (and on a
    /// cache miss, which the blanking prefetch exists to prevent).
    pub fn pixel(&self, timing: &TimingGen) -> bool {
        if !timing.data_enable() {
            return false;
        }
        let row = self.input_row(timing.y());
        if self.cached_row != Some(row) {
            return false;
        }
        let column =
            (u64::from(timing.x()) * u64::from(self.config.input_width)
                / u64::from(self.config.output_width)) as u32;
        let bit = u64::from(row) * u64::from(self.config.input_width) + u64::from(column);
        let word = (bit / 32) as u32 - self.first_word_of_row(row);
        self.row_cache[word as usize] >> (bit % 32) & 1 == 1
    }

    pub fn clear(&mut self) {
        self.cached_row = None;
        self.fetch = FetchState::Idle;
        self.prev_vsync = false;
        self.row_cache.fill(0);
    }

    /// Advance one clock. Call after the timing generator has stepped so
    /// `timing` reflects the current pixel.
    pub fn step(&mut self, timing: &TimingGen, read_ack: bool, read_response: Stream<ReadResponse>) {
        // Start-of-frame: drop the cache on the vsync edge, then let the
        // back porch prefetch row zero.
        let vsync = timing.vsync();
        if vsync && !self.prev_vsync {
            trace!("video: vsync, invalidating row cache");
            self.cached_row = None;
            self.fetch = FetchState::Idle;
        }
        self.prev_vsync = vsync;

        match self.fetch {
            FetchState::Idle => {
                if !vsync {
                    if let Some(row) = self.wanted_row(timing) {
                        if self.cached_row != Some(row) {
                            trace!("video: prefetching input row {row}");
                            self.fetching_row = row;
                            self.fetch = FetchState::Issue { word: 0 };
                        }
                    }
                }
            }
            FetchState::Issue { word } => {
                if read_ack {
                    self.fetch = FetchState::Wait { word };
                }
            }
            FetchState::Wait { word } => {
                if let Some(response) = read_response.get() {
                    self.row_cache[word as usize] = response.read_data;
                    let next = word + 1;
                    if next == self.row_words(self.fetching_row) {
                        self.cached_row = Some(self.fetching_row);
                        self.fetch = FetchState::Idle;
                    } else {
                        self.fetch = FetchState::Issue { word: next };
                    }
                }
            }
        }
    }

    /// Input row feeding output line `y`.
    fn input_row(&self, y: u32) -> u32 {
        (u64::from(y) * u64::from(self.config.input_height) / u64::from(self.config.output_height))
            as u32
    }

    /// The input row the cache should hold right now: the current line's
    /// row during the active region, the next line's row once the line
    /// enters horizontal blanking, and row zero through vertical blanking.
    fn wanted_row(&self, timing: &TimingGen) -> Option<u32> {
        let v_active = self.config.output_height;
        let h_active = self.config.output_width;
        if timing.y() >= v_active {
            Some(0)
        } else if timing.x() >= h_active {
            let next_line = timing.y() + 1;
            if next_line >= v_active {
                Some(0)
            } else {
                Some(self.input_row(next_line))
            }
        } else {
            Some(self.input_row(timing.y()))
        }
    }

    /// First framebuffer word spanned by `row`.
    fn first_word_of_row(&self, row: u32) -> u32 {
        (u64::from(row) * u64::from(self.config.input_width) / 32) as u32
    }

    /// Number of words spanned by `row` (rows need not be word aligned).
    fn row_words(&self, row: u32) -> u32 {
        let first_bit = u64::from(row) * u64::from(self.config.input_width);
        let last_bit = first_bit + u64::from(self.config.input_width) - 1;
        ((last_bit / 32) - (first_bit / 32) + 1) as u32
    }

    fn row_address(&self, row: u32, word: u32) -> u32 {
        self.config
            .framebuffer_address
            .wrapping_add((self.first_word_of_row(row) + word) * BYTES_PER_WORD)
    }
}

fn words_per_row(input_width: u32) -> u32 {
    // Worst case: an unaligned row spans one extra word
    input_width / 32 + 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_timing() -> TimingConfig {
        TimingConfig {
            horizontal: TimingParams {
                active: 8,
                front_porch: 2,
                sync: 2,
                back_porch: 2,
            },
            vertical: TimingParams {
                active: 8,
                front_porch: 1,
                sync: 1,
                back_porch: 2,
            },
        }
    }

    #[test]
    fn check_timing_counters_wrap() {
        let mut timing = TimingGen::new(tiny_timing());
        let h_total = 14;
        let v_total = 12;
        for _ in 0..h_total * v_total {
            timing.step();
        }
        assert_eq!(timing.x(), 0);
        assert_eq!(timing.y(), 0);
    }

    #[test]
    fn check_data_enable_window() {
        let mut timing = TimingGen::new(tiny_timing());
        let mut enabled = 0;
        for _ in 0..14 * 12 {
            if timing.data_enable() {
                enabled += 1;
            }
            timing.step();
        }
        assert_eq!(enabled, 8 * 8);
    }

    #[test]
    fn check_sync_pulse_positions() {
        let mut timing = TimingGen::new(tiny_timing());
        let mut hsync_cycles = 0;
        let mut vsync_lines = 0;
        for _ in 0..14 * 12 {
            if timing.hsync() {
                hsync_cycles += 1;
            }
            if timing.vsync() && timing.x() == 0 {
                vsync_lines += 1;
            }
            timing.step();
        }
        // 2 hsync cycles per line, 12 lines
        assert_eq!(hsync_cycles, 2 * 12);
        assert_eq!(vsync_lines, 1);
    }

    #[test]
    fn check_video_config_validation() {
        assert!(VideoConfig::default().validate().is_ok());
        let bad = VideoConfig {
            output_width: 16,
            ..VideoConfig::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(VideoConfigError::TimingMismatch { .. })
        ));
        let bad = VideoConfig {
            input_width: 0,
            ..VideoConfig::default()
        };
        assert!(matches!(bad.validate(), Err(VideoConfigError::ZeroDimension)));
    }

    /// Scan one whole frame against a word-array framebuffer, collecting
    /// the active pixels.
    fn scan_frame(config: VideoConfig, framebuffer: &[u32]) -> Vec<Vec<bool>> {
        let mut timing = TimingGen::new(config.timing);
        let mut expander = FrameExpander::new(config);
        let mut read_pending: Option<u32> = None;
        let mut frame =
            vec![vec![false; config.output_width as usize]; config.output_height as usize];
        let cycles = config.timing.horizontal.total() * config.timing.vertical.total();
        // Two frames: the first warms the cache mid-frame, the second is
        // the one we check
        for pass in 0..2 {
            for _ in 0..cycles {
                let response = match read_pending.take() {
                    Some(address) => {
                        let index =
                            ((address - config.framebuffer_address) / BYTES_PER_WORD) as usize;
                        Stream::offer(ReadResponse {
                            read_data: framebuffer.get(index).copied().unwrap_or(0),
                            error: false,
                        })
                    }
                    None => Stream::idle(),
                };
                let request = expander.read_request();
                let ack = request.valid;
                if ack {
                    read_pending = Some(request.data.address);
                }
                timing.step();
                expander.step(&timing, ack, response);
                if pass == 1 && timing.data_enable() {
                    frame[timing.y() as usize][timing.x() as usize] = expander.pixel(&timing);
                }
            }
        }
        frame
    }

    fn bitmap_config() -> VideoConfig {
        VideoConfig {
            input_width: 4,
            input_height: 4,
            output_width: 8,
            output_height: 8,
            framebuffer_address: 0x100,
            timing: tiny_timing(),
        }
    }

    #[test]
    fn check_single_bit_expands_to_block() {
        // Bit (1, 1) of a 4x4 framebuffer: bit index 1*4 + 1 = 5
        let framebuffer = [1 << 5];
        let frame = scan_frame(bitmap_config(), &framebuffer);
        for y in 0..8 {
            for x in 0..8 {
                let expected = (2..4).contains(&x) && (2..4).contains(&y);
                assert_eq!(frame[y][x], expected, "pixel ({x},{y})");
            }
        }
    }

    #[test]
    fn check_blank_framebuffer_scans_dark() {
        let frame = scan_frame(bitmap_config(), &[0]);
        assert!(frame.iter().flatten().all(|&p| !p));
    }

    #[test]
    fn check_row_striping() {
        // Rows 0 and 2 lit: bits 0..4 and 8..12
        let framebuffer = [0x0000_0f0f];
        let frame = scan_frame(bitmap_config(), &framebuffer);
        for y in 0..8 {
            let lit = frame[y].iter().filter(|&&p| p).count();
            let expected = if y / 2 % 2 == 0 { 8 } else { 0 };
            assert_eq!(lit, expected, "line {y}");
        }
    }
}
