// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The NAL unit layer: header parsing (including the SVC/MVC/3D extension
//! group) and in-place removal of emulation-prevention bytes from the
//! reader's window.

use enumn::N;

use crate::bitstream::BitReader;
use crate::error::ParseError;
use crate::error::ParseResult;
use crate::error::UnsupportedFeature;

#[derive(N, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum NaluType {
    #[default]
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

/// The SVC part of the NAL unit header extension. See G.7.3.1.1.
///
/// Parsed but never acted upon; dispatching a unit carrying one yields
/// [`UnsupportedFeature::ScalableExtension`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SvcExtension {
    pub idr_flag: bool,
    pub priority_id: u8,
    pub no_inter_layer_pred_flag: bool,
    pub dependency_id: u8,
    pub quality_id: u8,
    pub temporal_id: u8,
    pub use_ref_base_pic_flag: bool,
    pub discardable_flag: bool,
    pub output_flag: bool,
}

impl SvcExtension {
    fn parse(r: &mut BitReader, offset: u64) -> ParseResult<Self> {
        let ext = SvcExtension {
            idr_flag: r.read_bit()?,
            priority_id: r.read_bits(6)?,
            no_inter_layer_pred_flag: r.read_bit()?,
            dependency_id: r.read_bits(3)?,
            quality_id: r.read_bits(4)?,
            temporal_id: r.read_bits(3)?,
            use_ref_base_pic_flag: r.read_bit()?,
            discardable_flag: r.read_bit()?,
            output_flag: r.read_bit()?,
        };

        let reserved_three_2bits: u32 = r.read_bits(2)?;
        if reserved_three_2bits != 0b11 {
            return Err(ParseError::invalid(
                offset,
                "reserved_three_2bits in SVC extension is not 0b11",
            ));
        }

        Ok(ext)
    }
}

/// The MVC/3D part of the NAL unit header extension. See H.7.3.1.1.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MvcExtension {
    pub non_idr_flag: bool,
    pub priority_id: u8,
    pub view_id: u16,
    pub temporal_id: u8,
    pub anchor_pic_flag: bool,
    pub inter_view_flag: bool,
}

impl MvcExtension {
    fn parse(r: &mut BitReader, offset: u64) -> ParseResult<Self> {
        let ext = MvcExtension {
            non_idr_flag: r.read_bit()?,
            priority_id: r.read_bits(6)?,
            view_id: r.read_bits(10)?,
            temporal_id: r.read_bits(3)?,
            anchor_pic_flag: r.read_bit()?,
            inter_view_flag: r.read_bit()?,
        };

        if !r.read_bit()? {
            return Err(ParseError::invalid(
                offset,
                "reserved_one_bit in MVC extension is not 1",
            ));
        }

        Ok(ext)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    /// The raw 5-bit unit type, kept for types without a [`NaluType`] mapping.
    pub raw_type: u8,
    pub idr_pic_flag: bool,
    pub svc: Option<SvcExtension>,
    pub mvc: Option<MvcExtension>,
}

impl NaluHeader {
    /// Parses the one-byte NAL unit header, plus the three-byte extension
    /// group for prefix (14) and slice-extension (20) units.
    pub fn parse(r: &mut BitReader) -> ParseResult<Self> {
        let offset = r.absolute_byte_offset();

        if r.read_bit()? {
            return Err(ParseError::invalid(offset, "forbidden_zero_bit is set"));
        }

        let ref_idc: u8 = r.read_bits(2)?;
        let raw_type: u8 = r.read_bits(5)?;
        let type_ = NaluType::n(raw_type).unwrap_or(NaluType::Unknown);

        let mut header = NaluHeader {
            ref_idc,
            type_,
            raw_type,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
            svc: None,
            mvc: None,
        };

        if matches!(type_, NaluType::PrefixUnit | NaluType::SliceExt) {
            let svc_extension_flag = r.read_bit()?;
            if svc_extension_flag {
                header.svc = Some(SvcExtension::parse(r, offset)?);
            } else {
                header.mvc = Some(MvcExtension::parse(r, offset)?);
            }
        }

        Ok(header)
    }

    /// Header length in bytes.
    pub fn len(&self) -> usize {
        if self.svc.is_some() || self.mvc.is_some() {
            4
        } else {
            1
        }
    }

    /// The unsupported feature carried by this unit's extension, if any.
    pub fn extension_feature(&self) -> Option<UnsupportedFeature> {
        if self.svc.is_some() {
            Some(UnsupportedFeature::ScalableExtension)
        } else if self.mvc.is_some() {
            Some(UnsupportedFeature::MultiviewExtension)
        } else {
            None
        }
    }
}

/// Processing phase of the current NAL unit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    #[default]
    SeekingStart,
    HeaderParsed,
    Cleaned,
    Consumed,
}

/// The NAL unit currently being processed.
///
/// One instance lives for the whole session and is reset, not reallocated,
/// between units.
#[derive(Debug, Default)]
pub struct NalUnit {
    /// Absolute byte offset of the unit header in the original stream.
    pub offset: u64,
    pub header: NaluHeader,
    phase: Phase,
}

impl NalUnit {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Clears the unit for reuse.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.header = Default::default();
        self.phase = Phase::SeekingStart;
    }

    /// Parses the unit header at the reader's current position.
    pub fn parse_header(&mut self, r: &mut BitReader) -> ParseResult<()> {
        debug_assert_eq!(self.phase, Phase::SeekingStart);

        self.offset = r.absolute_byte_offset();
        self.header = NaluHeader::parse(r)?;
        self.phase = Phase::HeaderParsed;
        Ok(())
    }

    /// Removes emulation-prevention bytes from the remainder of the reader's
    /// window. A no-op if the unit was already cleaned, which makes cleaning
    /// idempotent at the unit level.
    pub fn clean_emulation_prevention(&mut self, r: &mut BitReader) -> ParseResult<usize> {
        match self.phase {
            Phase::HeaderParsed => {
                let removed = strip_emulation_prevention(r);
                self.phase = Phase::Cleaned;
                Ok(removed)
            }
            Phase::Cleaned => Ok(0),
            _ => Err(ParseError::invalid(
                self.offset,
                "emulation-prevention removal before header parse",
            )),
        }
    }

    /// Marks the unit as fully dispatched.
    pub fn consume(&mut self) {
        self.phase = Phase::Consumed;
    }
}

/// Scans the window from the cursor's byte onward for `00 00 03` with a
/// following byte of at most 3, removing each `03` in place.
///
/// Single pass: bytes are shifted left as the scan goes, never rescanned. The
/// bit cursor is saved and restored around the scan, which starts
/// byte-aligned.
pub fn strip_emulation_prevention(r: &mut BitReader) -> usize {
    debug_assert!(r.is_byte_aligned());

    let saved = r.bit_position();
    let start = saved / 8;

    let window = r.window_mut();
    let mut zero_run = 0usize;
    let mut write = start;
    let mut removed_at = Vec::new();

    for read in start..window.len() {
        let byte = window[read];

        let next_escapable = match window.get(read + 1) {
            Some(b) => *b <= 0x03,
            None => false,
        };

        if zero_run >= 2 && byte == 0x03 && next_escapable {
            // The byte following the escape will land at `write`; any cursor
            // at or past it has this escape behind it.
            removed_at.push(write);
            // Three new bytes are needed before the next candidate.
            zero_run = 0;
            continue;
        }

        window[write] = byte;
        write += 1;

        if byte == 0x00 {
            zero_run += 1;
        } else {
            zero_run = 0;
        }
    }

    window.truncate(write);
    r.record_epb_removals(&removed_at);

    debug_assert_eq!(r.bit_position(), saved);
    removed_at.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_with(data: &[u8]) -> BitReader {
        let mut r = BitReader::new();
        r.load_window(0, data);
        r
    }

    #[test]
    fn parse_idr_header() {
        // forbidden 0, ref_idc 3, type 5 (IDR).
        let mut r = reader_with(&[0x65]);
        let header = NaluHeader::parse(&mut r).unwrap();

        assert_eq!(header.ref_idc, 3);
        assert_eq!(header.type_, NaluType::SliceIdr);
        assert!(header.idr_pic_flag);
        assert_eq!(header.len(), 1);
    }

    #[test]
    fn forbidden_bit_reports_offset() {
        let mut r = BitReader::new();
        r.load_window(0x40, &[0x80]);

        match NaluHeader::parse(&mut r) {
            Err(ParseError::StructuralInvalid { offset, .. }) => assert_eq!(offset, 0x40),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn parse_svc_extension() {
        let mut w = crate::bitstream::BitWriter::new();
        w.write_bits(0, 1); // forbidden_zero_bit
        w.write_bits(2, 2); // ref_idc
        w.write_bits(14, 5); // prefix NAL unit
        w.write_bit(true); // svc_extension_flag
        w.write_bit(true); // idr_flag
        w.write_bits(0x20, 6); // priority_id
        w.write_bit(false); // no_inter_layer_pred_flag
        w.write_bits(5, 3); // dependency_id
        w.write_bits(9, 4); // quality_id
        w.write_bits(2, 3); // temporal_id
        w.write_bit(true); // use_ref_base_pic_flag
        w.write_bit(false); // discardable_flag
        w.write_bit(true); // output_flag
        w.write_bits(0b11, 2); // reserved_three_2bits

        let bytes = w.into_bytes();
        let mut r = reader_with(&bytes);
        let header = NaluHeader::parse(&mut r).unwrap();

        assert_eq!(header.type_, NaluType::PrefixUnit);
        assert_eq!(header.len(), 4);
        let svc = header.svc.unwrap();
        assert!(svc.idr_flag);
        assert_eq!(svc.priority_id, 0x20);
        assert_eq!(svc.dependency_id, 5);
        assert_eq!(svc.quality_id, 9);
        assert_eq!(svc.temporal_id, 2);
        assert!(svc.use_ref_base_pic_flag);
        assert!(!svc.discardable_flag);
        assert!(svc.output_flag);
        assert_eq!(
            header.extension_feature(),
            Some(UnsupportedFeature::ScalableExtension)
        );
    }

    #[test]
    fn svc_reserved_bits_mismatch_is_invalid() {
        let mut w = crate::bitstream::BitWriter::new();
        w.write_bits(0, 1);
        w.write_bits(2, 2);
        w.write_bits(14, 5);
        w.write_bit(true); // svc_extension_flag
        w.write_bits(0, 17); // SVC fields, all zero
        w.write_bits(0b10, 2); // bad reserved_three_2bits

        let bytes = w.into_bytes();
        let mut r = BitReader::new();
        r.load_window(0x100, &bytes);

        match NaluHeader::parse(&mut r) {
            Err(ParseError::StructuralInvalid { offset, .. }) => assert_eq!(offset, 0x100),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn parse_mvc_extension() {
        let mut w = crate::bitstream::BitWriter::new();
        w.write_bits(0, 1);
        w.write_bits(1, 2);
        w.write_bits(20, 5); // slice extension
        w.write_bit(false); // svc_extension_flag unset selects MVC
        w.write_bit(true); // non_idr_flag
        w.write_bits(3, 6); // priority_id
        w.write_bits(0x155, 10); // view_id
        w.write_bits(4, 3); // temporal_id
        w.write_bit(true); // anchor_pic_flag
        w.write_bit(false); // inter_view_flag
        w.write_bit(true); // reserved_one_bit

        let bytes = w.into_bytes();
        let mut r = reader_with(&bytes);
        let header = NaluHeader::parse(&mut r).unwrap();

        assert_eq!(header.type_, NaluType::SliceExt);
        let mvc = header.mvc.unwrap();
        assert!(mvc.non_idr_flag);
        assert_eq!(mvc.view_id, 0x155);
        assert_eq!(mvc.temporal_id, 4);
        assert!(mvc.anchor_pic_flag);
        assert_eq!(
            header.extension_feature(),
            Some(UnsupportedFeature::MultiviewExtension)
        );
    }

    #[test]
    fn strips_single_emulation_prevention_byte() {
        let mut r = reader_with(&[0x42, 0x00, 0x00, 0x03, 0x01, 0x7f]);
        r.skip_bits(8).unwrap();

        let removed = strip_emulation_prevention(&mut r);

        assert_eq!(removed, 1);
        assert_eq!(r.window(), &[0x42, 0x00, 0x00, 0x01, 0x7f]);
        assert_eq!(r.bit_position(), 8);
        assert_eq!(r.discarded_bytes(), 1);
    }

    #[test]
    fn escape_byte_before_large_byte_is_kept() {
        // 00 00 03 followed by a byte above 3 is ordinary data.
        let mut r = reader_with(&[0x00, 0x00, 0x03, 0x44]);
        let removed = strip_emulation_prevention(&mut r);

        assert_eq!(removed, 0);
        assert_eq!(r.window(), &[0x00, 0x00, 0x03, 0x44]);
    }

    #[test]
    fn zero_run_resets_after_removal() {
        // The 03 after an escape needs a fresh pair of zeroes: here the
        // second 03 directly follows the removed one and stays.
        let mut r = reader_with(&[0x00, 0x00, 0x03, 0x03, 0x00]);
        let removed = strip_emulation_prevention(&mut r);

        assert_eq!(removed, 1);
        assert_eq!(r.window(), &[0x00, 0x00, 0x03, 0x00]);
    }

    #[test]
    fn strips_back_to_back_escapes() {
        let mut r = reader_with(&[0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x01]);
        let removed = strip_emulation_prevention(&mut r);

        assert_eq!(removed, 2);
        assert_eq!(r.window(), &[0x00, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn cleaning_is_idempotent_at_the_unit_level() {
        let data = [0x65, 0x00, 0x00, 0x03, 0x02, 0x88];
        let mut r = reader_with(&data);

        let mut unit = NalUnit::new();
        unit.parse_header(&mut r).unwrap();
        assert_eq!(unit.phase(), Phase::HeaderParsed);

        assert_eq!(unit.clean_emulation_prevention(&mut r).unwrap(), 1);
        let cleaned = r.window().to_vec();
        assert_eq!(unit.phase(), Phase::Cleaned);

        assert_eq!(unit.clean_emulation_prevention(&mut r).unwrap(), 0);
        assert_eq!(r.window(), cleaned.as_slice());
    }

    #[test]
    fn discarded_bytes_shift_absolute_offsets() {
        let mut r = BitReader::new();
        r.load_window(500, &[0x65, 0x00, 0x00, 0x03, 0x00, 0xaa]);

        let mut unit = NalUnit::new();
        unit.parse_header(&mut r).unwrap();
        unit.clean_emulation_prevention(&mut r).unwrap();

        // Window is now 65 00 00 00 aa; consuming it all must land past the
        // escape byte in original-stream coordinates.
        r.skip_bits(32).unwrap();
        assert_eq!(r.absolute_byte_offset(), 500 + 6);
    }

    #[test]
    fn offsets_before_an_escape_are_not_shifted() {
        let mut r = BitReader::new();
        r.load_window(500, &[0x65, 0xaa, 0x00, 0x00, 0x03, 0x01]);

        let mut unit = NalUnit::new();
        unit.parse_header(&mut r).unwrap();
        unit.clean_emulation_prevention(&mut r).unwrap();

        // The cursor sits at window byte 1, before the removed escape, so the
        // escape must not shift the reported offset.
        assert_eq!(r.discarded_bytes(), 1);
        assert_eq!(r.absolute_byte_offset(), 501);

        // Window byte 4 followed the escape on the wire, at stream byte 505.
        r.skip_bits(24).unwrap();
        assert_eq!(r.absolute_byte_offset(), 505);
    }

    #[test]
    fn unit_reset_clears_state() {
        let mut r = reader_with(&[0x65]);
        let mut unit = NalUnit::new();
        unit.parse_header(&mut r).unwrap();
        unit.consume();
        assert_eq!(unit.phase(), Phase::Consumed);

        unit.reset();
        assert_eq!(unit.phase(), Phase::SeekingStart);
        assert_eq!(unit.header.type_, NaluType::Unknown);
    }
}
