// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-stream decoding session.
//!
//! A session owns the reader window, the parameter-set stores and the current
//! NAL unit, and drives per-unit dispatch: parse the header, remove
//! emulation-prevention bytes, then decode according to the unit type. Slice
//! data itself is handed off to an external macroblock layer through
//! [`SliceDataSink`].

use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use bytes::BytesMut;

use crate::bitstream::BitReader;
use crate::codec::h264::nalu::NalUnit;
use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::parser::parse_aud;
use crate::codec::h264::parser::parse_sei;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;
use crate::error::ParseError;
use crate::error::ParseResult;
use crate::error::UnsupportedFeature;

/// Consecutive-error threshold past which a session gives up on the stream.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 64;

/// One depacketized byte range, expected to hold a single NAL unit starting
/// at its first byte. `offset` is the absolute position in the original
/// stream and is only used for diagnostics.
#[derive(Clone, Debug)]
pub struct Sample {
    pub offset: u64,
    pub data: Bytes,
}

/// The external depacketizer. Fetching bytes from storage is the
/// implementor's business; the session only sees resident ranges.
pub trait SampleSource {
    /// Returns the next sample, or `None` at end of stream.
    fn next_sample(&mut self) -> anyhow::Result<Option<Sample>>;
}

/// The external macroblock layer.
///
/// Called once per decoded and validated slice header with the reader
/// positioned at the first bit of the slice data and the resolved
/// parameter-set context. An error here is a hard failure for the session.
pub trait SliceDataSink {
    fn decode_slice_data(
        &mut self,
        reader: &mut BitReader,
        sps: &Sps,
        pps: &Pps,
        header: &SliceHeader,
    ) -> anyhow::Result<()>;
}

/// A sink that validates hand-off and discards the slice data.
#[derive(Default)]
pub struct NullSink;

impl SliceDataSink for NullSink {
    fn decode_slice_data(
        &mut self,
        _reader: &mut BitReader,
        _sps: &Sps,
        _pps: &Pps,
        _header: &SliceHeader,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested IDR count was reached.
    Complete,
    /// The source ran dry before the requested IDR count was reached.
    EndOfStream,
    /// The cancellation flag was observed set.
    Cancelled,
    /// A recognized but unimplemented feature ended the session cleanly.
    Unsupported(UnsupportedFeature),
    /// The consecutive-error threshold was reached.
    TooManyErrors,
    /// A hard failure: source error, sink error, or a sample that stayed
    /// short after one refill.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Stopped(StopReason),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionCounters {
    /// Samples handed to dispatch, including rejected ones.
    pub units_seen: u64,
    pub frames_decoded: u64,
    pub idr_count: u64,
    pub consecutive_errors: u32,
}

/// Outcome of dispatching one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Stop(StopReason),
}

/// Drives one elementary stream, NAL unit by NAL unit.
///
/// Single-threaded and synchronous: every operation completes or fails
/// before the next unit is touched. Cancellation is cooperative, checked
/// once per unit, never mid-unit.
pub struct DecodingSession<S: SliceDataSink> {
    reader: BitReader,
    parser: Parser,
    unit: NalUnit,
    sink: S,

    /// The last successfully decoded slice header, for consistency checks.
    current_slice: Option<SliceHeader>,

    counters: SessionCounters,
    state: SessionState,
    cancel: Arc<AtomicBool>,

    /// Number of IDR pictures to decode before stopping with
    /// [`StopReason::Complete`].
    target_idr_count: u64,
}

impl<S: SliceDataSink> DecodingSession<S> {
    pub fn new(sink: S, target_idr_count: u64) -> Self {
        Self {
            reader: BitReader::new(),
            parser: Parser::new(),
            unit: NalUnit::new(),
            sink,
            current_slice: None,
            counters: Default::default(),
            state: SessionState::Created,
            cancel: Arc::new(AtomicBool::new(false)),
            target_idr_count,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn current_slice(&self) -> Option<&SliceHeader> {
        self.current_slice.as_ref()
    }

    /// The cooperative cancellation flag. Setting it stops the session
    /// before the next unit is processed.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Verifies that the active slice resolves through its PPS to an SPS in
    /// the stores.
    pub fn check_consistency(&self) -> ParseResult<()> {
        let Some(slice) = &self.current_slice else {
            return Ok(());
        };

        let pps = self.parser.get_pps(slice.pic_parameter_set_id).ok_or(
            ParseError::UnresolvedReference {
                offset: slice.offset,
                set: "PPS",
                id: u32::from(slice.pic_parameter_set_id),
            },
        )?;

        self.parser
            .get_sps(pps.seq_parameter_set_id)
            .ok_or(ParseError::UnresolvedReference {
                offset: slice.offset,
                set: "SPS",
                id: u32::from(pps.seq_parameter_set_id),
            })?;

        Ok(())
    }

    /// Makes `data` resident at `offset` and processes the NAL unit it
    /// contains. Counterpart of [`DecodingSession::run`] for callers that
    /// drive the loop themselves.
    pub fn feed_buffer(&mut self, offset: u64, data: &[u8]) -> ParseResult<Dispatch> {
        self.counters.units_seen += 1;
        let dispatch = self.process_unit(offset, data)?;
        if let Dispatch::Stop(reason) = dispatch {
            self.state = SessionState::Stopped(reason);
        }
        Ok(dispatch)
    }

    fn process_unit(&mut self, offset: u64, data: &[u8]) -> ParseResult<Dispatch> {
        self.reader.load_window(offset, data);
        self.unit.reset();
        self.unit.parse_header(&mut self.reader)?;
        self.unit.clean_emulation_prevention(&mut self.reader)?;

        let header = self.unit.header;
        let dispatch = self.dispatch(&header)?;
        self.unit.consume();
        Ok(dispatch)
    }

    fn dispatch(&mut self, header: &NaluHeader) -> ParseResult<Dispatch> {
        match header.type_ {
            NaluType::Sps => {
                let sps = self.parser.parse_sps(&mut self.reader)?;
                log::debug!(
                    "stored SPS {} ({}x{})",
                    sps.seq_parameter_set_id,
                    sps.width(),
                    sps.height()
                );
                self.counters.consecutive_errors = 0;
                Ok(Dispatch::Continue)
            }

            NaluType::Pps => {
                let pps = self.parser.parse_pps(&mut self.reader)?;
                log::debug!(
                    "stored PPS {} referencing SPS {}",
                    pps.pic_parameter_set_id,
                    pps.seq_parameter_set_id
                );
                self.counters.consecutive_errors = 0;
                Ok(Dispatch::Continue)
            }

            NaluType::SliceIdr => self.decode_idr(header),

            // Content this session cannot decode, but the stream may still
            // carry decodable IDR pictures later.
            NaluType::Slice | NaluType::SliceDpa | NaluType::SliceDpb | NaluType::SliceDpc => {
                Ok(self.count_error("non-IDR slice"))
            }

            NaluType::Sei => {
                // Best effort: a broken SEI does not taint the stream.
                match parse_sei(&mut self.reader) {
                    Ok(messages) => {
                        for message in &messages {
                            log::debug!(
                                "SEI payload type {} size {}",
                                message.payload_type,
                                message.payload_size
                            );
                        }
                    }
                    Err(e) => log::warn!("undecodable SEI ignored: {}", e),
                }
                Ok(Dispatch::Continue)
            }

            NaluType::AuDelimiter => {
                let primary_pic_type = parse_aud(&mut self.reader)?;
                log::debug!("access unit delimiter, primary_pic_type {}", primary_pic_type);
                Ok(Dispatch::Continue)
            }

            // Scalable and multiview layers cannot be skipped safely once
            // present: the base-layer-only interpretation would be wrong.
            NaluType::PrefixUnit | NaluType::SliceExt => Ok(Dispatch::Stop(
                StopReason::Unsupported(
                    header
                        .extension_feature()
                        .unwrap_or(UnsupportedFeature::ScalableExtension),
                ),
            )),

            _ => Ok(self.count_error("unhandled unit type")),
        }
    }

    fn decode_idr(&mut self, nalu: &NaluHeader) -> ParseResult<Dispatch> {
        let slice = self.parser.parse_slice_header(&mut self.reader, nalu)?;
        self.parser.check_slice_header(&slice, nalu)?;

        let pps = self.parser.get_pps(slice.pic_parameter_set_id).ok_or(
            ParseError::UnresolvedReference {
                offset: slice.offset,
                set: "PPS",
                id: u32::from(slice.pic_parameter_set_id),
            },
        )?;
        let pps = Rc::clone(pps);
        let sps = Rc::clone(&pps.sps);

        if let Err(e) = self
            .sink
            .decode_slice_data(&mut self.reader, &sps, &pps, &slice)
        {
            log::error!("macroblock layer failed on IDR slice: {:#}", e);
            return Ok(Dispatch::Stop(StopReason::Fatal));
        }

        log::debug!(
            "decoded IDR slice at offset {}, SliceQPY {}",
            slice.offset,
            slice.slice_qp_y
        );

        self.current_slice = Some(slice);
        self.counters.consecutive_errors = 0;
        self.counters.idr_count += 1;
        self.counters.frames_decoded += 1;

        if self.counters.idr_count >= self.target_idr_count {
            Ok(Dispatch::Stop(StopReason::Complete))
        } else {
            Ok(Dispatch::Continue)
        }
    }

    fn count_error(&mut self, what: &str) -> Dispatch {
        log::warn!(
            "skipping {:?} unit at offset {}: {}",
            self.unit.header.type_,
            self.unit.offset,
            what
        );

        self.counters.consecutive_errors += 1;
        if self.counters.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            Dispatch::Stop(StopReason::TooManyErrors)
        } else {
            Dispatch::Continue
        }
    }

    /// Folds a parse failure into the error counter. `Unsupported` stops the
    /// session cleanly instead of counting.
    fn on_parse_error(&mut self, e: ParseError) -> Dispatch {
        if let ParseError::Unsupported(feature) = e {
            log::info!("stream requires unsupported feature: {}", feature);
            return Dispatch::Stop(StopReason::Unsupported(feature));
        }

        log::warn!("unit rejected: {}", e);
        self.counters.consecutive_errors += 1;
        if self.counters.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            Dispatch::Stop(StopReason::TooManyErrors)
        } else {
            Dispatch::Continue
        }
    }

    fn stop(&mut self, reason: StopReason) -> StopReason {
        self.state = SessionState::Stopped(reason);
        reason
    }

    /// Pulls samples from `source` until a stop condition is met.
    ///
    /// A unit whose sample is too short is retried exactly once with the
    /// next sample appended; a second shortfall on the same unit is fatal.
    pub fn run(&mut self, source: &mut dyn SampleSource) -> StopReason {
        self.state = SessionState::Running;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return self.stop(StopReason::Cancelled);
            }

            let sample = match source.next_sample() {
                Ok(Some(sample)) => sample,
                Ok(None) => return self.stop(StopReason::EndOfStream),
                Err(e) => {
                    log::error!("sample source failed: {:#}", e);
                    return self.stop(StopReason::Fatal);
                }
            };

            self.counters.units_seen += 1;

            let dispatch = match self.process_unit(sample.offset, &sample.data) {
                Ok(dispatch) => dispatch,
                Err(ParseError::Exhausted { .. }) => {
                    match self.refill_and_retry(source, &sample) {
                        Ok(dispatch) => dispatch,
                        Err(e) => self.on_parse_error(e),
                    }
                }
                Err(e) => self.on_parse_error(e),
            };

            if let Dispatch::Stop(reason) = dispatch {
                return self.stop(reason);
            }
        }
    }

    /// Appends the next sample to a short one and reprocesses the unit from
    /// scratch.
    fn refill_and_retry(
        &mut self,
        source: &mut dyn SampleSource,
        sample: &Sample,
    ) -> ParseResult<Dispatch> {
        let next = match source.next_sample() {
            Ok(Some(next)) => next,
            Ok(None) => {
                log::error!("stream truncated inside unit at offset {}", sample.offset);
                return Ok(Dispatch::Stop(StopReason::Fatal));
            }
            Err(e) => {
                log::error!("sample source failed during refill: {:#}", e);
                return Ok(Dispatch::Stop(StopReason::Fatal));
            }
        };

        log::debug!(
            "unit at offset {} is short, retrying with {} more bytes",
            sample.offset,
            next.data.len()
        );

        let mut combined = BytesMut::from(&sample.data[..]);
        combined.extend_from_slice(&next.data);

        match self.process_unit(sample.offset, &combined) {
            Err(ParseError::Exhausted { .. }) => {
                log::error!("unit at offset {} still short after refill", sample.offset);
                Ok(Dispatch::Stop(StopReason::Fatal))
            }
            other => other,
        }
    }
}
