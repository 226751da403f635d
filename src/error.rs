// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Crate-wide error taxonomy.
//!
//! Low-level bit-reader failures propagate unchanged; the syntax decoders
//! translate them and their own validation failures into [`ParseError`]
//! values carrying absolute byte offsets. Callers can always tell an
//! unsupported-but-recognized feature apart from a malformed stream.

use std::fmt;

use thiserror::Error;

use crate::bitstream::BitReadError;

/// A stream feature that is recognized but intentionally not implemented.
///
/// Hitting one of these is a clean stop, not a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedFeature {
    PSlice,
    BSlice,
    SpSlice,
    SiSlice,
    ScalableExtension,
    MultiviewExtension,
    Fmo,
    InterlacedCoding,
}

impl fmt::Display for UnsupportedFeature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            UnsupportedFeature::PSlice => "P slice",
            UnsupportedFeature::BSlice => "B slice",
            UnsupportedFeature::SpSlice => "SP slice",
            UnsupportedFeature::SiSlice => "SI slice",
            UnsupportedFeature::ScalableExtension => "SVC extension",
            UnsupportedFeature::MultiviewExtension => "MVC extension",
            UnsupportedFeature::Fmo => "flexible macroblock ordering",
            UnsupportedFeature::InterlacedCoding => "interlaced or MBAFF coding",
        };
        write!(f, "{}", name)
    }
}

/// Error returned by the syntax decoders.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A forbidden or reserved bit did not match, or a syntax structure was
    /// malformed. The offending unit is rejected.
    #[error("structurally invalid data at byte offset {offset}: {reason}")]
    StructuralInvalid { offset: u64, reason: String },

    /// A decoded id or field fell outside its documented range. The record is
    /// rejected, never silently corrected.
    #[error("{field} out of range at byte offset {offset}: got {value}, expected {min}..={max}")]
    OutOfRange {
        offset: u64,
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// A slice or PPS references a parameter set that is not in the store.
    #[error("unresolved reference at byte offset {offset}: {set} id {id} has not been decoded")]
    UnresolvedReference {
        offset: u64,
        set: &'static str,
        id: u32,
    },

    /// A recognized but unimplemented feature was encountered.
    #[error("unsupported feature: {0}")]
    Unsupported(UnsupportedFeature),

    /// The reader ran out of buffered data.
    #[error("bitstream exhausted: needed {needed} more bits, {available} available")]
    Exhausted { needed: usize, available: usize },
}

impl ParseError {
    /// Whether this error is an unsupported-feature signal rather than a
    /// malformed stream.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ParseError::Unsupported(_))
    }

    pub(crate) fn invalid(offset: u64, reason: impl Into<String>) -> Self {
        ParseError::StructuralInvalid {
            offset,
            reason: reason.into(),
        }
    }
}

impl From<BitReadError> for ParseError {
    fn from(e: BitReadError) -> Self {
        match e {
            BitReadError::Exhausted { needed, available } => {
                ParseError::Exhausted { needed, available }
            }
            // The caller attaches the offset where it is known; reader-level
            // failures other than exhaustion mean the syntax itself is broken.
            other => ParseError::StructuralInvalid {
                offset: 0,
                reason: other.to_string(),
            },
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;
