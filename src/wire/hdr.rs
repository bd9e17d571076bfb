// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail, ensure};
use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{FramingKind, TransportError};

/// Opcodes at or above this value are transport-internal and never surface
/// to user callbacks.
pub const OPC_RESERVED_FLOOR: u16 = u16::MAX - 16;

/// Graceful end of stream; emitted as a header-only frame by `fin()`.
pub const OPC_FIN: u16 = u16::MAX - 1;

/// Collector-posted marker; interpreted by the send loop, never transmitted.
pub const OPC_IDLE_TICK: u16 = u16::MAX - 2;

/// `attrs.size` value denoting an unsized payload (PDU framing required).
pub const SIZE_UNKNOWN: i64 = -1;

/// Object attributes carried inside the object header.
///
/// `custom` is an ordered list of key/value pairs; the wire preserves
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjAttrs {
    pub size: i64,
    /// Modification time, unix nanoseconds.
    pub mtime: i64,
    pub version: String,
    pub cksum_type: String,
    pub cksum_value: String,
    pub custom: Vec<(String, String)>,
}

/// Logical object header: destination bucket, name, sender, opaque control
/// bytes, attributes, and opcode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjHdr {
    pub bucket: String,
    pub obj_name: String,
    pub sender_id: String,
    pub opaque: Vec<u8>,
    pub attrs: ObjAttrs,
    pub opcode: u16,
}

impl ObjHdr {
    pub fn new(bucket: impl Into<String>, obj_name: impl Into<String>) -> Self {
        ObjHdr {
            bucket: bucket.into(),
            obj_name: obj_name.into(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_unsized(&self) -> bool {
        self.attrs.size == SIZE_UNKNOWN
    }

    #[inline]
    pub fn is_header_only(&self) -> bool {
        self.attrs.size == 0
    }

    /// Transport-internal opcode (`FIN`, `IDLE_TICK`, ...).
    #[inline]
    pub fn is_internal(&self) -> bool {
        self.opcode >= OPC_RESERVED_FLOOR
    }

    pub fn fqn(&self) -> String {
        format!("{}/{}", self.bucket, self.obj_name)
    }

    /// Serialize in the frozen field order:
    /// `{bucket, obj_name, sender_id, opaque, attrs_len, attrs, opcode}`,
    /// little-endian, length-prefixed varlen fields.
    pub fn serialize(&self, max_hdr_size: usize) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(128);
        put_str(&mut buf, &self.bucket)?;
        put_str(&mut buf, &self.obj_name)?;
        put_str(&mut buf, &self.sender_id)?;
        put_bytes(&mut buf, &self.opaque)?;

        let attrs = self.attrs.serialize()?;
        buf.put_u32_le(attrs.len() as u32);
        buf.put_slice(&attrs);
        buf.put_u16_le(self.opcode);

        ensure!(
            buf.len() <= max_hdr_size,
            "object header {} exceeds the {max_hdr_size}-byte limit ({} bytes)",
            self.fqn(),
            buf.len()
        );
        Ok(buf.freeze())
    }

    pub fn deserialize(frame: &[u8]) -> Result<Self, TransportError> {
        let mut cur = Cursor::new(frame);
        let bucket = cur.get_str()?;
        let obj_name = cur.get_str()?;
        let sender_id = cur.get_str()?;
        let opaque = cur.get_bytes()?.to_vec();

        let attrs_len = cur.get_u32_le()? as usize;
        let attrs_raw = cur.take(attrs_len)?;
        let attrs = ObjAttrs::deserialize(attrs_raw)?;
        let opcode = cur.get_u16_le()?;
        cur.finish()?;

        Ok(ObjHdr {
            bucket,
            obj_name,
            sender_id,
            opaque,
            attrs,
            opcode,
        })
    }
}

impl ObjAttrs {
    fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_i64_le(self.size);
        buf.put_i64_le(self.mtime);
        put_str(&mut buf, &self.version)?;
        put_str(&mut buf, &self.cksum_type)?;
        put_str(&mut buf, &self.cksum_value)?;
        ensure!(
            self.custom.len() <= u16::MAX as usize,
            "too many custom attributes: {}",
            self.custom.len()
        );
        buf.put_u16_le(self.custom.len() as u16);
        for (k, v) in &self.custom {
            put_str(&mut buf, k)?;
            put_str(&mut buf, v)?;
        }
        Ok(buf.freeze())
    }

    fn deserialize(raw: &[u8]) -> Result<Self, TransportError> {
        let mut cur = Cursor::new(raw);
        let size = cur.get_i64_le()?;
        let mtime = cur.get_i64_le()?;
        let version = cur.get_str()?;
        let cksum_type = cur.get_str()?;
        let cksum_value = cur.get_str()?;
        let n = cur.get_u16_le()? as usize;
        let mut custom = Vec::with_capacity(n);
        for _ in 0..n {
            let k = cur.get_str()?;
            let v = cur.get_str()?;
            custom.push((k, v));
        }
        cur.finish()?;
        Ok(ObjAttrs {
            size,
            mtime,
            version,
            cksum_type,
            cksum_value,
            custom,
        })
    }
}

/// Small control message: sender, opcode, bounded body. No payload follows
/// a message frame on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Msg {
    pub sender_id: String,
    pub opcode: u16,
    pub body: Bytes,
}

impl Msg {
    pub fn new(opcode: u16, body: Bytes) -> Self {
        Msg {
            sender_id: String::new(),
            opcode,
            body,
        }
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        self.opcode >= OPC_RESERVED_FLOOR
    }

    pub fn serialize(&self, max_hdr_size: usize) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(32 + self.body.len());
        put_str(&mut buf, &self.sender_id)?;
        buf.put_u16_le(self.opcode);
        put_bytes(&mut buf, &self.body)?;
        ensure!(
            buf.len() <= max_hdr_size,
            "message (opcode {}) exceeds the {max_hdr_size}-byte limit ({} bytes)",
            self.opcode,
            buf.len()
        );
        Ok(buf.freeze())
    }

    pub fn deserialize(frame: &[u8]) -> Result<Self, TransportError> {
        let mut cur = Cursor::new(frame);
        let sender_id = cur.get_str()?;
        let opcode = cur.get_u16_le()?;
        let body = Bytes::copy_from_slice(cur.get_bytes()?);
        cur.finish()?;
        Ok(Msg {
            sender_id,
            opcode,
            body,
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    put_bytes(buf, s.as_bytes())
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) -> Result<()> {
    if b.len() > u16::MAX as usize {
        bail!("field length {} exceeds u16 prefix", b.len());
    }
    buf.put_u16_le(b.len() as u16);
    buf.put_slice(b);
    Ok(())
}

/// Bounds-checked decode cursor; every short read is a framing error.
struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Cursor { rest }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        if self.rest.len() < n {
            return Err(TransportError::framing(
                FramingKind::Truncated,
                format!("need {n} bytes, have {}", self.rest.len()),
            ));
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn get_u16_le(&mut self) -> Result<u16, TransportError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn get_u32_le(&mut self) -> Result<u32, TransportError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_i64_le(&mut self) -> Result<i64, TransportError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_le_bytes(arr))
    }

    fn get_bytes(&mut self) -> Result<&'a [u8], TransportError> {
        let n = self.get_u16_le()? as usize;
        self.take(n)
    }

    fn get_str(&mut self) -> Result<String, TransportError> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| {
            TransportError::framing(FramingKind::Truncated, "non-utf8 string field")
        })
    }

    fn finish(&self) -> Result<(), TransportError> {
        if !self.rest.is_empty() {
            return Err(TransportError::framing(
                FramingKind::Truncated,
                format!("{} trailing bytes after frame", self.rest.len()),
            ));
        }
        Ok(())
    }
}
