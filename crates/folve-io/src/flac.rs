//! Streaming FLAC encoder.
//!
//! Encodes fixed-size blocks front-to-back through a [`ByteSink`], which is
//! what the conversion pipeline needs: the stream header goes out before any
//! audio exists, every frame is final the moment it is written, and nothing
//! ever seeks. The STREAMINFO total-sample field is therefore written as
//! zero and the MD5 signature left unset; the pipeline patches the sample
//! count into the already-written header bytes when it knows better.
//!
//! Subframes use CONSTANT, VERBATIM or FIXED prediction (orders 0..=4) with
//! single-partition Rice coding, picking whichever is smallest per channel.

use crate::error::AudioError;
use crate::sink::ByteSink;
use folve_dsp::FrameWriter;
use std::io;

/// Block size all output streams are encoded with.
pub const FLAC_BLOCK_SIZE: usize = 4096;

/// Largest 4-bit Rice parameter; 0b1111 escapes to raw residuals.
const MAX_RICE_PARAM: u32 = 14;

/// Output stream parameters.
#[derive(Debug, Clone, Copy)]
pub struct FlacSpec {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (1..=8, independently coded).
    pub channels: usize,
    /// Output bit depth, 16 or 24.
    pub bits_per_sample: u32,
    /// Samples per frame; the last frame may be shorter.
    pub block_size: usize,
}

impl FlacSpec {
    /// Spec with the standard block size.
    pub fn new(sample_rate: u32, channels: usize, bits_per_sample: u32) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            block_size: FLAC_BLOCK_SIZE,
        }
    }
}

/// FLAC encoder writing complete frames through a [`ByteSink`].
pub struct FlacStreamWriter {
    sink: Box<dyn ByteSink>,
    spec: FlacSpec,
    /// Interleaved quantised samples not yet covering a whole block.
    pending: Vec<i32>,
    frame_index: u64,
    finalized: bool,
}

impl FlacStreamWriter {
    /// Create the writer and immediately emit `fLaC` + STREAMINFO through
    /// the sink.
    pub fn new(sink: Box<dyn ByteSink>, spec: FlacSpec) -> Result<Self, AudioError> {
        if !(1..=8).contains(&spec.channels) {
            return Err(AudioError::Unsupported(format!(
                "{} channels not encodable as FLAC",
                spec.channels
            )));
        }
        if spec.bits_per_sample != 16 && spec.bits_per_sample != 24 {
            return Err(AudioError::Unsupported(format!(
                "{} bit output not supported",
                spec.bits_per_sample
            )));
        }
        if spec.block_size < 16 || spec.block_size > 32768 {
            return Err(AudioError::Unsupported(format!(
                "block size {} out of range",
                spec.block_size
            )));
        }

        let writer = Self {
            sink,
            spec,
            pending: Vec::new(),
            frame_index: 0,
            finalized: false,
        };
        writer.write_stream_header().map_err(AudioError::Encode)?;
        Ok(writer)
    }

    fn write_stream_header(&self) -> io::Result<()> {
        let mut header = Vec::with_capacity(4 + 4 + 34);
        header.extend_from_slice(b"fLaC");
        // STREAMINFO, marked as the last metadata block, 34 bytes.
        header.push(0x80);
        header.extend_from_slice(&[0, 0, 34]);

        let bs = self.spec.block_size as u16;
        header.extend_from_slice(&bs.to_be_bytes());
        header.extend_from_slice(&bs.to_be_bytes());
        // Min/max frame size: unknown in a streamed encode.
        header.extend_from_slice(&[0, 0, 0, 0, 0, 0]);

        // 20 bits rate | 3 bits channels-1 | 5 bits bps-1 | 36 bits samples.
        let packed: u64 = (u64::from(self.spec.sample_rate) << 44)
            | (((self.spec.channels - 1) as u64) << 41)
            | (u64::from(self.spec.bits_per_sample - 1) << 36);
        header.extend_from_slice(&packed.to_be_bytes());

        // MD5 of the audio data: unset (all zero).
        header.extend_from_slice(&[0u8; 16]);

        self.sink.write_bytes(&header)
    }

    fn encode_frame(&mut self, frames: usize) -> io::Result<()> {
        let channels = self.spec.channels;
        let samples: Vec<i32> = self.pending.drain(..frames * channels).collect();

        let mut bw = BitWriter::new();
        bw.put_bits(0b1111_1111_1111_10, 14); // sync
        bw.put_bits(0, 1); // reserved
        bw.put_bits(0, 1); // fixed block size stream
        let (bs_code, bs_followup) = block_size_code(frames);
        bw.put_bits(u64::from(bs_code), 4);
        bw.put_bits(0b0000, 4); // sample rate: from STREAMINFO
        bw.put_bits((channels - 1) as u64, 4); // independent channels
        bw.put_bits(u64::from(sample_size_code(self.spec.bits_per_sample)), 3);
        bw.put_bits(0, 1); // reserved
        for byte in utf8_coded(self.frame_index) {
            bw.put_bits(u64::from(byte), 8);
        }
        match bs_followup {
            BlockSizeFollowup::None => {}
            BlockSizeFollowup::U8(v) => bw.put_bits(u64::from(v), 8),
            BlockSizeFollowup::U16(v) => bw.put_bits(u64::from(v), 16),
        }
        let header_crc = crc8(bw.bytes());
        bw.put_bits(u64::from(header_crc), 8);

        let bits = self.spec.bits_per_sample;
        for ch in 0..channels {
            let chan: Vec<i64> = samples
                .iter()
                .skip(ch)
                .step_by(channels)
                .map(|&v| i64::from(v))
                .collect();
            encode_subframe(&mut bw, &chan, bits);
        }

        bw.align_to_byte();
        let frame_crc = crc16(bw.bytes());
        bw.put_bits(u64::from(frame_crc), 16);

        self.sink.write_bytes(bw.bytes())?;
        self.frame_index += 1;
        Ok(())
    }

    /// Flush the trailing partial block. Idempotent.
    pub fn finalize(&mut self) -> io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        let frames = self.pending.len() / self.spec.channels;
        if frames > 0 {
            self.encode_frame(frames)?;
        }
        self.finalized = true;
        Ok(())
    }

    /// Frames encoded so far, not counting buffered ones.
    pub fn frames_written(&self) -> u64 {
        self.frame_index
    }
}

impl FrameWriter for FlacStreamWriter {
    fn write_frames(&mut self, interleaved: &[f32]) -> io::Result<()> {
        debug_assert!(!self.finalized);
        debug_assert_eq!(interleaved.len() % self.spec.channels, 0);
        let bits = self.spec.bits_per_sample;
        self.pending
            .extend(interleaved.iter().map(|&s| quantize(s, bits)));
        while self.pending.len() >= self.spec.block_size * self.spec.channels {
            self.encode_frame(self.spec.block_size)?;
        }
        Ok(())
    }
}

/// Quantise `sample` to `bits`, clamping out-of-range values instead of
/// wrapping.
fn quantize(sample: f32, bits: u32) -> i32 {
    let scale = (1i64 << (bits - 1)) as f32;
    let v = (sample * scale).round();
    v.clamp(-scale, scale - 1.0) as i32
}

enum BlockSizeFollowup {
    None,
    U8(u8),
    U16(u16),
}

fn block_size_code(frames: usize) -> (u8, BlockSizeFollowup) {
    match frames {
        192 => (1, BlockSizeFollowup::None),
        576 => (2, BlockSizeFollowup::None),
        1152 => (3, BlockSizeFollowup::None),
        2304 => (4, BlockSizeFollowup::None),
        4608 => (5, BlockSizeFollowup::None),
        256 => (8, BlockSizeFollowup::None),
        512 => (9, BlockSizeFollowup::None),
        1024 => (10, BlockSizeFollowup::None),
        2048 => (11, BlockSizeFollowup::None),
        4096 => (12, BlockSizeFollowup::None),
        8192 => (13, BlockSizeFollowup::None),
        16384 => (14, BlockSizeFollowup::None),
        32768 => (15, BlockSizeFollowup::None),
        n if n <= 256 => (6, BlockSizeFollowup::U8((n - 1) as u8)),
        n => (7, BlockSizeFollowup::U16((n - 1) as u16)),
    }
}

fn sample_size_code(bits: u32) -> u8 {
    match bits {
        16 => 0b100,
        24 => 0b110,
        _ => unreachable!("validated in FlacStreamWriter::new"),
    }
}

/// UTF-8-style coding of the frame number (up to 36 bits).
fn utf8_coded(value: u64) -> Vec<u8> {
    if value < 0x80 {
        return vec![value as u8];
    }
    let mut n = 2usize;
    while n < 7 && value >= (1u64 << (5 * n + 1)) {
        n += 1;
    }
    let mut out = Vec::with_capacity(n);
    let prefix: u8 = match n {
        2 => 0xC0,
        3 => 0xE0,
        4 => 0xF0,
        5 => 0xF8,
        6 => 0xFC,
        _ => 0xFE,
    };
    let head_bits = 7 - n as u32;
    out.push(prefix | ((value >> (6 * (n - 1))) as u8 & ((1u8 << head_bits) - 1)));
    for k in (0..n - 1).rev() {
        out.push(0x80 | ((value >> (6 * k)) as u8 & 0x3F));
    }
    out
}

/// Residuals of the FLAC fixed predictors, order 0..=4.
fn fixed_residuals(samples: &[i64], order: usize) -> Vec<i64> {
    let n = samples.len();
    let mut out = Vec::with_capacity(n - order);
    for i in order..n {
        let r = match order {
            0 => samples[i],
            1 => samples[i] - samples[i - 1],
            2 => samples[i] - 2 * samples[i - 1] + samples[i - 2],
            3 => samples[i] - 3 * samples[i - 1] + 3 * samples[i - 2] - samples[i - 3],
            _ => {
                samples[i] - 4 * samples[i - 1] + 6 * samples[i - 2] - 4 * samples[i - 3]
                    + samples[i - 4]
            }
        };
        out.push(r);
    }
    out
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

/// Bits needed to store `v` as two's complement.
fn signed_bit_len(v: i64) -> u32 {
    let magnitude = if v >= 0 { v } else { !v };
    65 - magnitude.leading_zeros()
}

/// Cost in bits of Rice-coding `residuals` with parameter `p`.
fn rice_cost(residuals: &[i64], p: u32) -> u64 {
    residuals
        .iter()
        .map(|&r| (zigzag(r) >> p) + 1 + u64::from(p))
        .sum()
}

/// Best 4-bit Rice parameter and its cost.
fn best_rice_param(residuals: &[i64]) -> (u32, u64) {
    let mut best = (0u32, u64::MAX);
    for p in 0..=MAX_RICE_PARAM {
        let cost = rice_cost(residuals, p);
        if cost < best.1 {
            best = (p, cost);
        }
    }
    best
}

/// Append one partition-order-0 residual section.
fn write_residuals(bw: &mut BitWriter, residuals: &[i64]) {
    bw.put_bits(0b00, 2); // 4-bit Rice parameters
    bw.put_bits(0, 4); // partition order 0

    let (param, rice_bits) = best_rice_param(residuals);
    let raw_bits = residuals.iter().map(|&r| signed_bit_len(r)).max().unwrap_or(1);
    let escape_bits = 5 + raw_bits as u64 * residuals.len() as u64;

    if escape_bits < rice_bits {
        bw.put_bits(0b1111, 4);
        bw.put_bits(u64::from(raw_bits), 5);
        for &r in residuals {
            bw.put_signed(r, raw_bits);
        }
    } else {
        bw.put_bits(u64::from(param), 4);
        for &r in residuals {
            let u = zigzag(r);
            bw.put_unary(u >> param);
            bw.put_bits(u & ((1u64 << param) - 1), param);
        }
    }
}

/// Encode one channel of a frame, choosing the cheapest subframe type.
fn encode_subframe(bw: &mut BitWriter, samples: &[i64], bits: u32) {
    let n = samples.len();

    if samples.iter().all(|&s| s == samples[0]) {
        bw.put_bits(0, 1);
        bw.put_bits(0b000000, 6); // CONSTANT
        bw.put_bits(0, 1);
        bw.put_signed(samples[0], bits);
        return;
    }

    // Pick the fixed predictor order with the smallest residual energy.
    let max_order = 4.min(n - 1);
    let mut best_order = 0;
    let mut best_sum = u64::MAX;
    for order in 0..=max_order {
        let sum: u64 = fixed_residuals(samples, order)
            .iter()
            .map(|&r| r.unsigned_abs())
            .sum();
        if sum < best_sum {
            best_sum = sum;
            best_order = order;
        }
    }
    let residuals = fixed_residuals(samples, best_order);
    let (_, rice_bits) = best_rice_param(&residuals);
    let fixed_bits = best_order as u64 * u64::from(bits) + 6 + rice_bits;
    let verbatim_bits = n as u64 * u64::from(bits);

    if verbatim_bits < fixed_bits {
        bw.put_bits(0, 1);
        bw.put_bits(0b000001, 6); // VERBATIM
        bw.put_bits(0, 1);
        for &s in samples {
            bw.put_signed(s, bits);
        }
        return;
    }

    bw.put_bits(0, 1);
    bw.put_bits(0b001000 | best_order as u64, 6); // FIXED
    bw.put_bits(0, 1);
    for &s in &samples[..best_order] {
        bw.put_signed(s, bits);
    }
    write_residuals(bw, &residuals);
}

/// MSB-first bit accumulator.
struct BitWriter {
    bytes: Vec<u8>,
    acc: u64,
    nbits: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            acc: 0,
            nbits: 0,
        }
    }

    fn put_bits(&mut self, value: u64, bits: u32) {
        debug_assert!(bits <= 32);
        if bits == 0 {
            return;
        }
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        self.acc = (self.acc << bits) | (value & mask);
        self.nbits += bits;
        while self.nbits >= 8 {
            self.nbits -= 8;
            self.bytes.push((self.acc >> self.nbits) as u8);
        }
    }

    fn put_signed(&mut self, value: i64, bits: u32) {
        let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        self.put_bits((value as u64) & mask, bits);
    }

    /// `q` zero bits followed by a one bit.
    fn put_unary(&mut self, mut q: u64) {
        while q >= 32 {
            self.put_bits(0, 32);
            q -= 32;
        }
        self.put_bits(1, q as u32 + 1);
    }

    fn align_to_byte(&mut self) {
        if self.nbits > 0 {
            let pad = 8 - self.nbits;
            self.put_bits(0, pad);
        }
    }

    /// The byte-aligned output so far. Callers only read this at aligned
    /// points (after headers, after align_to_byte).
    fn bytes(&self) -> &[u8] {
        debug_assert_eq!(self.nbits, 0);
        &self.bytes
    }
}

/// CRC-8 with polynomial 0x07, as used for FLAC frame headers.
fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
        }
    }
    crc
}

/// CRC-16 with polynomial 0x8005, as used for whole FLAC frames.
fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
        }
    }
    crc
}
