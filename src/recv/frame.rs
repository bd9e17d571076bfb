// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream::BoxStream};

use crate::{
    errors::{FramingKind, TransportError},
    wire::{
        compress::BodyDecompressor,
        proto::{FrameFlags, PROTO_HDR_LEN, ProtoHdr},
    },
};

pub(crate) type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Buffered reader over one inbound HTTP request body: exact reads for
/// proto-headers and frames, bounded partial reads for payload streaming.
/// The optional zstd layer sits below the framing, mirroring the send side.
pub(crate) struct FrameReader {
    src: BodyStream,
    buf: BytesMut,
    src_eof: bool,
    decomp: Option<BodyDecompressor>,
}

impl FrameReader {
    pub fn new(src: BodyStream, compressed: bool) -> Result<Self, TransportError> {
        let decomp = if compressed {
            Some(BodyDecompressor::new()?)
        } else {
            None
        };
        Ok(FrameReader {
            src,
            buf: BytesMut::new(),
            src_eof: false,
            decomp,
        })
    }

    /// Pull one more chunk into the buffer; false on end of body.
    async fn fill(&mut self) -> Result<bool, TransportError> {
        loop {
            if self.src_eof {
                return Ok(false);
            }
            match self.src.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    match &mut self.decomp {
                        Some(d) => {
                            let plain = d.push(&chunk)?;
                            if plain.is_empty() {
                                continue; // decoder mid-block, keep pulling
                            }
                            self.buf.extend_from_slice(&plain);
                        },
                        None => self.buf.extend_from_slice(&chunk),
                    }
                    return Ok(true);
                },
                None => {
                    self.src_eof = true;
                    if let Some(d) = self.decomp.take() {
                        let tail = d.finish()?;
                        if !tail.is_empty() {
                            self.buf.extend_from_slice(&tail);
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                },
            }
        }
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes, TransportError> {
        while self.buf.len() < n {
            if !self.fill().await? {
                return Err(TransportError::framing(
                    FramingKind::Truncated,
                    format!("body ended, need {n} bytes, have {}", self.buf.len()),
                ));
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Next proto-header, or `None` on a clean end-of-body at a frame
    /// boundary. A partial preamble is a framing error.
    pub async fn read_proto_hdr(&mut self) -> Result<Option<ProtoHdr>, TransportError> {
        while self.buf.len() < PROTO_HDR_LEN {
            if !self.fill().await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::framing(
                    FramingKind::Truncated,
                    format!("partial proto header ({} bytes)", self.buf.len()),
                ));
            }
        }
        let raw = self.buf.split_to(PROTO_HDR_LEN);
        Ok(Some(ProtoHdr::read_from(&raw)?))
    }

    /// Read a complete length-validated, checksum-verified frame body.
    pub async fn read_frame(
        &mut self,
        ph: &ProtoHdr,
        flags: FrameFlags,
    ) -> Result<Bytes, TransportError> {
        let len = ph.validate_length(flags)?;
        let body = self.read_exact(len).await?;
        ph.verify_checksum(&body)?;
        Ok(body)
    }

    /// Up to `n` buffered-or-pulled bytes; `None` on end of body.
    pub async fn read_up_to(&mut self, n: usize) -> Result<Option<Bytes>, TransportError> {
        if self.buf.is_empty() && !self.fill().await? {
            return Ok(None);
        }
        let take = n.min(self.buf.len());
        Ok(Some(self.buf.split_to(take).freeze()))
    }
}
