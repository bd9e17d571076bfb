// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use thiserror::Error;

/// What exactly went wrong while deframing an inbound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingKind {
    BadProtoHdr,
    LengthOverflow,
    ChecksumMismatch,
    BadFlags,
    PduOutOfSequence,
    Truncated,
}

impl fmt::Display for FramingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FramingKind::BadProtoHdr => "bad proto header",
            FramingKind::LengthOverflow => "length overflow",
            FramingKind::ChecksumMismatch => "checksum mismatch",
            FramingKind::BadFlags => "invalid flag combination",
            FramingKind::PduOutOfSequence => "PDU out of sequence",
            FramingKind::Truncated => "truncated frame",
        };
        f.write_str(s)
    }
}

/// Transport error taxonomy.
///
/// The transport never retries; one error instance may fan out to many
/// completion callbacks, hence `Clone` (I/O causes are carried as rendered
/// strings, not live `io::Error` values).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("framing: {kind}: {detail}")]
    Framing { kind: FramingKind, detail: String },

    #[error("stream {lid} terminated ({reason})")]
    StreamTerminated { lid: String, reason: String },

    #[error("destination {dst} not in bundle {trname}")]
    DestinationMissing { dst: String, trname: String },

    #[error("unsized payload requires PDU framing (trname {trname})")]
    UnsizedWithoutPdu { trname: String },

    #[error("wire: {0}")]
    Wire(String),
}

impl TransportError {
    pub fn framing(kind: FramingKind, detail: impl Into<String>) -> Self {
        TransportError::Framing {
            kind,
            detail: detail.into(),
        }
    }

    pub fn wire(err: impl fmt::Display) -> Self {
        TransportError::Wire(err.to_string())
    }

    pub fn is_framing(&self) -> bool {
        matches!(self, TransportError::Framing { .. })
    }
}
