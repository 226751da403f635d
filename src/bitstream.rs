// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-level access to a buffered byte window.
//!
//! [`BitReader`] owns the window an external depacketizer made resident and a
//! bit cursor into it. All reads are MSB-first. Contrary to a plain forward
//! cursor, the reader supports peeking, rewinding and byte alignment, which
//! the slice-header decoder and the emulation-prevention scan rely on.
//!
//! Exp-Golomb decoding (the `ue(v)`/`se(v)` descriptors of the H.264 syntax
//! tables) is provided directly on the reader.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitReadError {
    #[error("reader exhausted: needed {needed} more bits, {available} available")]
    Exhausted { needed: usize, available: usize },
    #[error("{requested} bits were requested, at most {max} are supported")]
    TooManyBits { requested: usize, max: usize },
    #[error("moving {0} bits would exit the buffered window")]
    OutOfWindow(usize),
    #[error("invalid Exp-Golomb code: {0}")]
    InvalidCode(&'static str),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

pub type BitReadResult<T> = Result<T, BitReadError>;

/// A bit cursor over a buffered byte window.
///
/// The window is a contiguous run of stream bytes starting at an absolute
/// byte offset. Emulation-prevention removal shrinks the window in place and
/// accounts for the dropped bytes so that [`BitReader::absolute_byte_offset`]
/// keeps referring to positions in the original stream.
#[derive(Debug, Default)]
pub struct BitReader {
    /// The buffered bytes.
    window: Vec<u8>,
    /// Bit offset of the cursor within `window`.
    pos: usize,
    /// Absolute byte offset of `window[0]` in the original stream.
    window_start: u64,
    /// For each removed emulation-prevention byte, the index in the cleaned
    /// window of the byte that followed it. Kept sorted.
    epb_positions: Vec<usize>,
}

impl BitReader {
    pub fn new() -> Self {
        Default::default()
    }

    /// Replaces the window with `data`, positioned at absolute byte `offset`.
    ///
    /// The bit cursor and the removed-escape accounting are reset.
    pub fn load_window(&mut self, offset: u64, data: &[u8]) {
        self.window.clear();
        self.window.extend_from_slice(data);
        self.pos = 0;
        self.window_start = offset;
        self.epb_positions.clear();
    }

    pub fn window(&self) -> &[u8] {
        &self.window
    }

    pub(crate) fn window_mut(&mut self) -> &mut Vec<u8> {
        &mut self.window
    }

    pub(crate) fn record_epb_removals(&mut self, positions: &[usize]) {
        self.epb_positions.extend_from_slice(positions);
    }

    /// Number of unread bits left in the window.
    pub fn remaining_bits(&self) -> usize {
        self.window.len() * 8 - self.pos
    }

    /// Bit offset of the cursor within the window.
    pub fn bit_position(&self) -> usize {
        self.pos
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.pos % 8 == 0
    }

    /// Absolute byte offset of the cursor in the original stream. Only the
    /// removed emulation-prevention bytes behind the cursor shift it; escapes
    /// still ahead do not.
    pub fn absolute_byte_offset(&self) -> u64 {
        let byte = self.pos / 8;
        let behind = self.epb_positions.partition_point(|&p| p <= byte);
        self.window_start + byte as u64 + behind as u64
    }

    /// Number of emulation-prevention bytes removed from the window.
    pub fn discarded_bytes(&self) -> u64 {
        self.epb_positions.len() as u64
    }

    fn extract_bits(&self, mut pos: usize, num_bits: usize) -> u32 {
        let mut out: u32 = 0;
        let mut left = num_bits;

        while left > 0 {
            let byte = u32::from(self.window[pos / 8]);
            let avail = 8 - pos % 8;
            let take = std::cmp::min(avail, left);

            let bits = (byte >> (avail - take)) & ((1 << take) - 1);
            out = (out << take) | bits;

            pos += take;
            left -= take;
        }

        out
    }

    fn check_available(&self, num_bits: usize) -> BitReadResult<()> {
        let available = self.remaining_bits();
        if num_bits > available {
            Err(BitReadError::Exhausted {
                needed: num_bits - available,
                available,
            })
        } else {
            Ok(())
        }
    }

    /// Reads the next `num_bits` bits (1 to 32), MSB-first, advancing the
    /// cursor.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> BitReadResult<U> {
        if num_bits == 0 || num_bits > 32 {
            return Err(BitReadError::TooManyBits {
                requested: num_bits,
                max: 32,
            });
        }
        self.check_available(num_bits)?;

        let out = self.extract_bits(self.pos, num_bits);
        self.pos += num_bits;

        U::try_from(out).map_err(|_| BitReadError::ConversionFailed)
    }

    /// Reads a single bit.
    pub fn read_bit(&mut self) -> BitReadResult<bool> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Reads up to 64 bits losslessly.
    pub fn read_bits64(&mut self, num_bits: usize) -> BitReadResult<u64> {
        if num_bits == 0 || num_bits > 64 {
            return Err(BitReadError::TooManyBits {
                requested: num_bits,
                max: 64,
            });
        }
        self.check_available(num_bits)?;

        if num_bits <= 32 {
            return Ok(u64::from(self.read_bits::<u32>(num_bits)?));
        }

        let hi: u32 = self.read_bits(num_bits - 32)?;
        let lo: u32 = self.read_bits(32)?;
        Ok(u64::from(hi) << 32 | u64::from(lo))
    }

    /// Returns the next `num_bits` bits without advancing the cursor.
    pub fn peek_bits(&self, num_bits: usize) -> BitReadResult<u32> {
        if num_bits == 0 || num_bits > 32 {
            return Err(BitReadError::TooManyBits {
                requested: num_bits,
                max: 32,
            });
        }
        self.check_available(num_bits)?;
        Ok(self.extract_bits(self.pos, num_bits))
    }

    /// Advances the cursor `num_bits` bits without returning data.
    pub fn skip_bits(&mut self, num_bits: usize) -> BitReadResult<()> {
        self.check_available(num_bits)?;
        self.pos += num_bits;
        Ok(())
    }

    /// Moves the cursor back `num_bits` bits. Fails without moving if that
    /// would exit the buffered window.
    pub fn rewind_bits(&mut self, num_bits: usize) -> BitReadResult<()> {
        if num_bits > self.pos {
            return Err(BitReadError::OutOfWindow(num_bits));
        }
        self.pos -= num_bits;
        Ok(())
    }

    /// Advances the cursor 0 to 7 bits to the next byte boundary.
    pub fn align_to_byte(&mut self) {
        self.pos = (self.pos + 7) & !7;
    }

    /// Whether RBSP data remains before the stop bit. Implements
    /// `more_rbsp_data()` from the specification.
    pub fn has_more_rbsp_data(&self) -> bool {
        // The stop bit is the lowest set bit of the last non-zero byte.
        let mut last = self.window.len();
        while last > 0 && self.window[last - 1] == 0 {
            last -= 1;
        }
        if last == 0 {
            return false;
        }

        let stop_bit = (last - 1) * 8 + 7 - self.window[last - 1].trailing_zeros() as usize;
        self.pos < stop_bit
    }

    /// Reads an unsigned Exp-Golomb code: `k` leading zero bits, a marker bit,
    /// and a `k`-bit suffix, decoding to `(1 << k) - 1 + suffix`.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> BitReadResult<U> {
        let mut num_zeroes = 0;

        while !self.read_bit()? {
            num_zeroes += 1;
            if num_zeroes > 31 {
                return Err(BitReadError::InvalidCode(
                    "more than 31 leading zero bits in ue(v)",
                ));
            }
        }

        let mut value: u32 = (1 << num_zeroes) - 1;

        // A 31-zero prefix is only accepted with an all-zero suffix; no
        // syntax element legitimately reaches 2^31.
        if num_zeroes == 31 {
            if self.read_bits::<u32>(num_zeroes)? != 0 {
                return Err(BitReadError::InvalidCode("ue(v) does not fit 32 bits"));
            }
            return U::try_from(value).map_err(|_| BitReadError::ConversionFailed);
        }

        if num_zeroes > 0 {
            value += self.read_bits::<u32>(num_zeroes)?;
        }

        U::try_from(value).map_err(|_| BitReadError::ConversionFailed)
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> BitReadResult<U> {
        let ue: u32 = self.read_ue()?;
        if ue < min || ue > max {
            return Err(BitReadError::InvalidCode("ue(v) out of bounds"));
        }
        U::try_from(ue).map_err(|_| BitReadError::ConversionFailed)
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> BitReadResult<U> {
        self.read_ue_bounded(0, max)
    }

    /// Reads a signed Exp-Golomb code: the unsigned code 0, 1, 2, 3, 4, ...
    /// maps to 0, 1, -1, 2, -2, ...
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> BitReadResult<U> {
        let ue = self.read_ue::<u32>()? as i32;

        let se = if ue % 2 == 0 { -(ue / 2) } else { ue / 2 + 1 };
        U::try_from(se).map_err(|_| BitReadError::ConversionFailed)
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> BitReadResult<U> {
        let se: i32 = self.read_se()?;
        if se < min || se > max {
            return Err(BitReadError::InvalidCode("se(v) out of bounds"));
        }
        U::try_from(se).map_err(|_| BitReadError::ConversionFailed)
    }
}

/// An MSB-first bit accumulator, the write-side counterpart of [`BitReader`].
///
/// Used to synthesize conformant parameter sets and slice headers, mainly in
/// tests. Emulation prevention is not applied; callers escaping a payload do
/// so themselves.
#[derive(Debug, Default)]
pub struct BitWriter {
    out: Vec<u8>,
    curr_byte: u8,
    used_bits: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends the lowest `num_bits` bits of `value`, MSB-first.
    pub fn write_bits(&mut self, value: u32, num_bits: usize) {
        assert!(num_bits <= 32);

        for i in (0..num_bits).rev() {
            let bit = (value >> i) & 1;
            self.curr_byte = (self.curr_byte << 1) | bit as u8;
            self.used_bits += 1;

            if self.used_bits == 8 {
                self.out.push(self.curr_byte);
                self.curr_byte = 0;
                self.used_bits = 0;
            }
        }
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.write_bits(bit as u32, 1);
    }

    pub fn write_ue(&mut self, value: u32) {
        // In u64 so that the code for u32::MAX, 1 << 32, does not overflow.
        let code = u64::from(value) + 1;
        let bits = 64 - code.leading_zeros() as usize;
        self.write_bits(0, bits - 1);
        if bits > 32 {
            self.write_bits((code >> 32) as u32, bits - 32);
            self.write_bits(code as u32, 32);
        } else {
            self.write_bits(code as u32, bits);
        }
    }

    pub fn write_se(&mut self, value: i32) {
        let code = if value > 0 {
            2 * value as u32 - 1
        } else {
            2 * (-value) as u32
        };
        self.write_ue(code);
    }

    /// Pads the current byte with zero bits.
    pub fn align_to_byte(&mut self) {
        while self.used_bits != 0 {
            self.write_bit(false);
        }
    }

    /// Appends the RBSP stop bit and returns the accumulated bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.write_bit(true);
        self.align_to_byte();
        self.out
    }

    /// Returns the accumulated bytes without appending a stop bit.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.align_to_byte();
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_stream_without_trailing_zero_bytes() {
        let mut reader = BitReader::new();
        reader.load_window(0, &[0x01, 0x23, 0x45, 0x67, 0x89, 0xa0]);

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.remaining_bits(), 47);
        assert!(reader.has_more_rbsp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.remaining_bits(), 39);
        assert!(reader.has_more_rbsp_data());

        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);
        assert_eq!(reader.remaining_bits(), 8);
        assert!(reader.has_more_rbsp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 1);
        assert_eq!(reader.remaining_bits(), 7);
        assert!(reader.has_more_rbsp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.remaining_bits(), 6);
        assert!(!reader.has_more_rbsp_data());
    }

    #[test]
    fn stop_bit_occupies_full_byte() {
        let mut reader = BitReader::new();
        reader.load_window(0, &[0xab, 0x80]);

        assert_eq!(reader.remaining_bits(), 16);
        assert!(reader.has_more_rbsp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0xab);
        assert!(!reader.has_more_rbsp_data());
    }

    #[test]
    fn read_rewind_restores_state() {
        let data: Vec<u8> = (0..16).map(|i| (i * 37 + 11) as u8).collect();

        for n in 1..=32 {
            let mut reader = BitReader::new();
            reader.load_window(0, &data);
            reader.skip_bits(5).unwrap();

            let before = reader.bit_position();
            let value = reader.read_bits::<u32>(n).unwrap();
            reader.rewind_bits(n).unwrap();

            assert_eq!(reader.bit_position(), before);
            assert_eq!(reader.read_bits::<u32>(n).unwrap(), value);
        }
    }

    #[test]
    fn peek_does_not_advance() {
        let mut reader = BitReader::new();
        reader.load_window(0, &[0xde, 0xad, 0xbe, 0xef]);

        assert_eq!(reader.peek_bits(16).unwrap(), 0xdead);
        assert_eq!(reader.bit_position(), 0);
        assert_eq!(reader.read_bits::<u32>(16).unwrap(), 0xdead);
        assert_eq!(reader.peek_bits(16).unwrap(), 0xbeef);
    }

    #[test]
    fn rewind_past_window_start_fails_without_moving() {
        let mut reader = BitReader::new();
        reader.load_window(0, &[0xff, 0xff]);
        reader.skip_bits(4).unwrap();

        assert_eq!(
            reader.rewind_bits(5).unwrap_err(),
            BitReadError::OutOfWindow(5)
        );
        assert_eq!(reader.bit_position(), 4);
    }

    #[test]
    fn exhausted_reports_shortfall() {
        let mut reader = BitReader::new();
        reader.load_window(0, &[0xaa]);
        reader.skip_bits(3).unwrap();

        match reader.read_bits::<u32>(8) {
            Err(BitReadError::Exhausted { needed, available }) => {
                assert_eq!(needed, 3);
                assert_eq!(available, 5);
            }
            other => panic!("unexpected result {:?}", other),
        }
        // A failed read must not advance the cursor.
        assert_eq!(reader.bit_position(), 3);
    }

    #[test]
    fn align_to_byte_advances_up_to_seven_bits() {
        let mut reader = BitReader::new();
        reader.load_window(0, &[0x12, 0x34]);

        reader.align_to_byte();
        assert_eq!(reader.bit_position(), 0);

        reader.skip_bits(1).unwrap();
        reader.align_to_byte();
        assert_eq!(reader.bit_position(), 8);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x34);
    }

    #[test]
    fn sixty_four_bit_reads_are_lossless() {
        let value: u64 = 0xfedc_ba98_7654_3210;
        let mut writer = BitWriter::new();
        writer.write_bits(0, 3); // unaligned on purpose
        writer.write_bits((value >> 32) as u32, 32);
        writer.write_bits(value as u32, 32);

        let mut reader = BitReader::new();
        reader.load_window(0, &writer.into_bytes());
        reader.skip_bits(3).unwrap();
        assert_eq!(reader.read_bits64(64).unwrap(), value);

        let mut reader2 = BitReader::new();
        reader2.load_window(0, &[0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(reader2.read_bits64(64).unwrap(), 0x8000_0000_0000_0001);
    }

    #[test]
    fn ue_round_trip() {
        let mut writer = BitWriter::new();
        for v in 0..=10000u32 {
            writer.write_ue(v);
        }

        let mut reader = BitReader::new();
        reader.load_window(0, &writer.into_bytes());
        for v in 0..=10000u32 {
            assert_eq!(reader.read_ue::<u32>().unwrap(), v);
        }
    }

    #[test]
    fn se_round_trip() {
        let mut writer = BitWriter::new();
        for v in -5000..=5000i32 {
            writer.write_se(v);
        }

        let mut reader = BitReader::new();
        reader.load_window(0, &writer.into_bytes());
        for v in -5000..=5000i32 {
            assert_eq!(reader.read_se::<i32>().unwrap(), v);
        }
    }

    #[test]
    fn ue_writer_handles_the_maximum_value() {
        // The code for u32::MAX is 1 << 32: 32 leading zeroes, the marker bit
        // and a 32-bit all-zero suffix.
        let mut writer = BitWriter::new();
        writer.write_ue(u32::MAX);

        let mut reader = BitReader::new();
        reader.load_window(0, &writer.into_bytes());
        assert_eq!(reader.read_bits64(33).unwrap(), 1);
        assert_eq!(reader.read_bits64(32).unwrap(), 0);

        // The largest value the reader itself accepts still round-trips.
        let mut writer = BitWriter::new();
        writer.write_ue(0x7fff_ffff);

        let mut reader = BitReader::new();
        reader.load_window(0, &writer.into_bytes());
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0x7fff_ffff);
    }

    #[test]
    fn se_mapping_of_small_codes() {
        // ue codes 0, 1, 2, 3, 4 map to 0, 1, -1, 2, -2.
        let mut writer = BitWriter::new();
        for code in 0..5u32 {
            writer.write_ue(code);
        }

        let mut reader = BitReader::new();
        reader.load_window(0, &writer.into_bytes());
        for expected in [0, 1, -1, 2, -2] {
            assert_eq!(reader.read_se::<i32>().unwrap(), expected);
        }
    }

    #[test]
    fn ue_with_unbounded_zero_run_fails() {
        let mut reader = BitReader::new();
        reader.load_window(0, &[0x00; 8]);

        assert_eq!(
            reader.read_ue::<u32>().unwrap_err(),
            BitReadError::InvalidCode("more than 31 leading zero bits in ue(v)")
        );
    }

    #[test]
    fn bounded_reads_reject_out_of_bounds_values() {
        let mut writer = BitWriter::new();
        writer.write_ue(12);
        writer.write_se(-7);

        let mut reader = BitReader::new();
        reader.load_window(0, &writer.into_bytes());
        assert!(reader.read_ue_max::<u32>(11).is_err());

        // The failed bounded read still consumed the code.
        assert!(reader.read_se_bounded::<i32>(-6, 6).is_err());
    }

    #[test]
    fn absolute_offset_tracks_window_start() {
        let mut reader = BitReader::new();
        reader.load_window(1000, &[0xaa, 0xbb, 0xcc]);

        assert_eq!(reader.absolute_byte_offset(), 1000);
        reader.skip_bits(12).unwrap();
        assert_eq!(reader.absolute_byte_offset(), 1001);
        reader.align_to_byte();
        assert_eq!(reader.absolute_byte_offset(), 1002);
    }
}
