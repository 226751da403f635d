// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-exact parsing core for H.264 elementary streams.
//!
//! This crate turns opaque byte ranges (as located by an external container
//! demuxer) into a validated semantic model of the stream: NAL unit headers,
//! sequence and picture parameter sets, and slice headers with their optional
//! sub-records. Once a slice header has been decoded and validated, the
//! positioned [`bitstream::BitReader`] and the resolved parameter-set context
//! are handed to an external macroblock-layer decoder.
//!
//! Container demultiplexing, macroblock reconstruction and entropy decoding of
//! slice data are out of scope.

pub mod bitstream;
pub mod codec;
pub mod error;
pub mod session;

pub use error::ParseError;
pub use error::UnsupportedFeature;
