// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::errors::{FramingKind, TransportError};

/// Fixed-size preamble in front of every framed unit on the wire.
pub const PROTO_HDR_LEN: usize = 16;

/// Hard cap on a serialized object header or message frame.
pub const MAX_HDR_SIZE: usize = 4 * 1024;

/// Hard cap on a single PDU payload.
pub const MAX_SIZE_PDU: usize = 128 * 1024;

/// Default PDU payload size when PDU framing is enabled with size 0.
pub const DFLT_SIZE_PDU: usize = 32 * 1024;

bitflags! {
    /// Frame discriminator bits carried by the proto-header.
    ///
    /// A frame with neither `MSG` nor `PDU` set carries a serialized object
    /// header. `PDU_STREAM` on an object-header frame announces that the
    /// payload follows as a sequence of PDU frames; `PDU_LAST` closes it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        const MSG        = 1 << 0;
        const PDU        = 1 << 1;
        const PDU_STREAM = 1 << 2;
        const PDU_LAST   = 1 << 3;
    }
}

/// On-wire proto-header: `{length, flags, checksum}`, big-endian.
///
/// `checksum` is the CRC32-C of the `length` frame bytes that follow,
/// zero-extended to 64 bits. The layout is frozen; both sides reject
/// anything they cannot interpret.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ProtoHdr {
    pub length: U32<BigEndian>,
    pub flags: U32<BigEndian>,
    pub checksum: U64<BigEndian>,
}

/// CRC32-C over a frame body, widened to the proto-header checksum field.
pub fn frame_checksum(frame: &[u8]) -> u64 {
    crc32c::crc32c(frame) as u64
}

impl ProtoHdr {
    pub fn new(frame: &[u8], flags: FrameFlags) -> Self {
        ProtoHdr {
            length: U32::new(frame.len() as u32),
            flags: U32::new(flags.bits()),
            checksum: U64::new(frame_checksum(frame)),
        }
    }

    pub fn read_from(buf: &[u8]) -> Result<Self, TransportError> {
        <Self as ZFromBytes>::read_from_bytes(buf).map_err(|_| {
            TransportError::framing(
                FramingKind::BadProtoHdr,
                format!("need {PROTO_HDR_LEN} bytes, got {}", buf.len()),
            )
        })
    }

    /// Decode flag bits, rejecting unknown bits and nonsense combinations.
    pub fn frame_flags(&self) -> Result<FrameFlags, TransportError> {
        let raw = self.flags.get();
        let flags = FrameFlags::from_bits(raw).ok_or_else(|| {
            TransportError::framing(FramingKind::BadFlags, format!("bits 0x{raw:x}"))
        })?;
        if flags.contains(FrameFlags::MSG) && flags.intersects(FrameFlags::PDU) {
            return Err(TransportError::framing(
                FramingKind::BadFlags,
                "msg frame with pdu bits",
            ));
        }
        if flags.contains(FrameFlags::PDU_LAST) && !flags.contains(FrameFlags::PDU) {
            return Err(TransportError::framing(
                FramingKind::BadFlags,
                "pdu-last without pdu",
            ));
        }
        Ok(flags)
    }

    /// Length sanity per frame kind: headers are bounded by `MAX_HDR_SIZE`,
    /// PDU payloads by `MAX_SIZE_PDU`.
    pub fn validate_length(&self, flags: FrameFlags) -> Result<usize, TransportError> {
        let len = self.length.get() as usize;
        let max = if flags.contains(FrameFlags::PDU) {
            MAX_SIZE_PDU
        } else {
            MAX_HDR_SIZE
        };
        if len > max {
            return Err(TransportError::framing(
                FramingKind::LengthOverflow,
                format!("frame length {len} exceeds {max}"),
            ));
        }
        Ok(len)
    }

    pub fn verify_checksum(&self, frame: &[u8]) -> Result<(), TransportError> {
        let want = self.checksum.get();
        let got = frame_checksum(frame);
        if want != got {
            return Err(TransportError::framing(
                FramingKind::ChecksumMismatch,
                format!("want 0x{want:x}, got 0x{got:x}"),
            ));
        }
        Ok(())
    }
}

/// Build a complete wire frame: proto-header followed by the frame body.
pub fn frame(flags: FrameFlags, body: &[u8]) -> Bytes {
    let ph = ProtoHdr::new(body, flags);
    let mut out = BytesMut::with_capacity(PROTO_HDR_LEN + body.len());
    out.put_slice(ph.as_bytes());
    out.put_slice(body);
    out.freeze()
}
