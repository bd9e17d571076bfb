// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io::Write;

use bytes::Bytes;

use crate::errors::TransportError;

/// `Content-Encoding` value advertised by compressed stream bodies.
pub const CONTENT_ENCODING_ZSTD: &str = "zstd";

const DFLT_LEVEL: i32 = 3;

/// Chunk-in/chunk-out zstd encoder over the stream body.
///
/// The framing layer stays byte-opaque: PDUs and headers live inside the
/// compressed substrate. Each pushed chunk is flushed so the receiver makes
/// progress without waiting for the encoder window to fill.
pub struct BodyCompressor {
    enc: zstd::stream::write::Encoder<'static, Vec<u8>>,
}

impl BodyCompressor {
    pub fn new() -> Result<Self, TransportError> {
        let enc = zstd::stream::write::Encoder::new(Vec::new(), DFLT_LEVEL)
            .map_err(TransportError::wire)?;
        Ok(BodyCompressor { enc })
    }

    /// Compress one chunk; the returned bytes may be empty.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Bytes, TransportError> {
        self.enc.write_all(chunk).map_err(TransportError::wire)?;
        self.enc.flush().map_err(TransportError::wire)?;
        Ok(std::mem::take(self.enc.get_mut()).into())
    }

    /// Finish the zstd stream, returning the trailing bytes.
    pub fn finish(self) -> Result<Bytes, TransportError> {
        let out = self.enc.finish().map_err(TransportError::wire)?;
        Ok(out.into())
    }
}

/// Inverse of [`BodyCompressor`] on the receive path.
pub struct BodyDecompressor {
    dec: zstd::stream::write::Decoder<'static, Vec<u8>>,
}

impl BodyDecompressor {
    pub fn new() -> Result<Self, TransportError> {
        let dec = zstd::stream::write::Decoder::new(Vec::new()).map_err(TransportError::wire)?;
        Ok(BodyDecompressor { dec })
    }

    /// Decompress one chunk; the returned bytes may be empty (the decoder
    /// may be mid-block).
    pub fn push(&mut self, chunk: &[u8]) -> Result<Bytes, TransportError> {
        self.dec.write_all(chunk).map_err(TransportError::wire)?;
        self.dec.flush().map_err(TransportError::wire)?;
        Ok(std::mem::take(self.dec.get_mut()).into())
    }

    /// Drain whatever the decoder still buffers at end of body.
    pub fn finish(mut self) -> Result<Bytes, TransportError> {
        self.dec.flush().map_err(TransportError::wire)?;
        Ok(std::mem::take(self.dec.get_mut()).into())
    }
}
