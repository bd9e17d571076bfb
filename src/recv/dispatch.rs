// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use anyhow::{Result, bail};
use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::put,
};
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use futures_util::{StreamExt, TryStreamExt, future::BoxFuture};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    errors::{FramingKind, TransportError},
    recv::{
        frame::FrameReader,
        session::{RxSession, RxSessionSnapshot, SessionTable},
    },
    stream::base::{API_VERSION, MSG_STREAM_PATH, OBJ_STREAM_PATH},
    wire::{
        compress::CONTENT_ENCODING_ZSTD,
        hdr::{Msg, OPC_FIN, ObjHdr},
        proto::{FrameFlags, PROTO_HDR_LEN},
    },
};

const PAYLOAD_CHUNK: usize = 64 * 1024;

/// Object receive callback. The implementation must fully drain `payload`
/// (or return an error); the dispatcher discards an undrained remainder
/// with a warning.
pub trait RecvObj: Send + Sync {
    fn recv<'a>(&'a self, hdr: ObjHdr, payload: &'a mut ObjPayload<'_>) -> BoxFuture<'a, Result<()>>;
}

/// Message receive callback; messages are small and arrive whole.
pub trait RecvMsg: Send + Sync {
    fn recv(&self, msg: Msg) -> Result<()>;
}

enum Mode {
    Empty,
    Sized { left: u64 },
    Pdu(PduState),
}

struct PduState {
    left: usize,
    crc: u32,
    want_crc: u64,
    cur_last: bool,
    done: bool,
}

/// One object's payload, presented chunk-by-chunk to the receive callback:
/// empty, length-limited raw bytes, or PDU-assembled until the terminal PDU.
pub struct ObjPayload<'a> {
    fr: &'a mut FrameReader,
    mode: Mode,
    consumed: u64,
}

impl<'a> ObjPayload<'a> {
    fn new(fr: &'a mut FrameReader, mode: Mode) -> Self {
        ObjPayload {
            fr,
            mode,
            consumed: 0,
        }
    }

    /// Next payload chunk, or `None` once the payload is complete.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        match &mut self.mode {
            Mode::Empty => Ok(None),
            Mode::Sized { left } => {
                if *left == 0 {
                    return Ok(None);
                }
                let want = (*left).min(PAYLOAD_CHUNK as u64) as usize;
                let chunk = self.fr.read_up_to(want).await?.ok_or_else(|| {
                    TransportError::framing(
                        FramingKind::Truncated,
                        format!("body ended with {left} payload bytes missing"),
                    )
                })?;
                *left -= chunk.len() as u64;
                self.consumed += chunk.len() as u64;
                Ok(Some(chunk))
            },
            Mode::Pdu(st) => loop {
                if st.done {
                    return Ok(None);
                }
                if st.left == 0 {
                    // Open the next PDU of this object.
                    let raw = self.fr.read_exact(PROTO_HDR_LEN).await?;
                    let ph = crate::wire::proto::ProtoHdr::read_from(&raw)?;
                    let flags = ph.frame_flags()?;
                    if !flags.contains(FrameFlags::PDU) {
                        return Err(TransportError::framing(
                            FramingKind::PduOutOfSequence,
                            "non-PDU frame inside an open object",
                        ));
                    }
                    st.left = ph.validate_length(flags)?;
                    st.want_crc = ph.checksum.get();
                    st.crc = 0;
                    st.cur_last = flags.contains(FrameFlags::PDU_LAST);
                    if st.left == 0 {
                        if st.want_crc != 0 {
                            return Err(TransportError::framing(
                                FramingKind::ChecksumMismatch,
                                "nonzero checksum on empty PDU",
                            ));
                        }
                        if st.cur_last {
                            st.done = true;
                            return Ok(None);
                        }
                        continue;
                    }
                }
                let want = st.left.min(PAYLOAD_CHUNK);
                let chunk = self.fr.read_up_to(want).await?.ok_or_else(|| {
                    TransportError::framing(
                        FramingKind::Truncated,
                        format!("body ended with {} PDU bytes missing", st.left),
                    )
                })?;
                st.crc = crc32c::crc32c_append(st.crc, &chunk);
                st.left -= chunk.len();
                if st.left == 0 {
                    if st.crc as u64 != st.want_crc {
                        return Err(TransportError::framing(
                            FramingKind::ChecksumMismatch,
                            format!("PDU: want 0x{:x}, got 0x{:x}", st.want_crc, st.crc),
                        ));
                    }
                    if st.cur_last {
                        st.done = true;
                    }
                }
                self.consumed += chunk.len() as u64;
                return Ok(Some(chunk));
            },
        }
    }

    /// Convenience: collect the whole payload. Callers stream `next_chunk`
    /// themselves when the object may be large.
    pub async fn read_all(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub fn drained(&self) -> bool {
        match &self.mode {
            Mode::Empty => true,
            Mode::Sized { left } => *left == 0,
            Mode::Pdu(st) => st.done,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    async fn discard_rest(&mut self) -> Result<u64, TransportError> {
        let before = self.consumed;
        while self.next_chunk().await?.is_some() {}
        Ok(self.consumed - before)
    }
}

struct ObjEndpoint {
    cb: Arc<dyn RecvObj>,
    sessions: SessionTable,
}

struct MsgEndpoint {
    cb: Arc<dyn RecvMsg>,
    sessions: SessionTable,
}

struct DispatcherInner {
    obj: DashMap<String, Arc<ObjEndpoint>>,
    msg: DashMap<String, Arc<MsgEndpoint>>,
}

/// Receive dispatcher: binds transport names to callbacks and serves both
/// stream routes. The host mounts `router()` into its HTTP server;
/// registration is dynamic, requests for unknown trnames get 404.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                obj: DashMap::new(),
                msg: DashMap::new(),
            }),
        }
    }

    pub fn handle_obj_stream(&self, trname: &str, cb: Arc<dyn RecvObj>) -> Result<()> {
        match self.inner.obj.entry(trname.to_string()) {
            Entry::Occupied(_) => bail!("object stream {trname} is already registered"),
            Entry::Vacant(v) => {
                v.insert(Arc::new(ObjEndpoint {
                    cb,
                    sessions: SessionTable::new(),
                }));
                Ok(())
            },
        }
    }

    pub fn handle_msg_stream(&self, trname: &str, cb: Arc<dyn RecvMsg>) -> Result<()> {
        match self.inner.msg.entry(trname.to_string()) {
            Entry::Occupied(_) => bail!("message stream {trname} is already registered"),
            Entry::Vacant(v) => {
                v.insert(Arc::new(MsgEndpoint {
                    cb,
                    sessions: SessionTable::new(),
                }));
                Ok(())
            },
        }
    }

    /// Deregister both flavors of `trname`; requests in flight drain
    /// naturally.
    pub fn unhandle(&self, trname: &str) -> bool {
        let o = self.inner.obj.remove(trname).is_some();
        let m = self.inner.msg.remove(trname).is_some();
        o || m
    }

    /// Per-sender-session receive counters for `trname`.
    pub fn get_stats(&self, trname: &str) -> Option<Vec<RxSessionSnapshot>> {
        if let Some(ep) = self.inner.obj.get(trname) {
            return Some(ep.sessions.snapshot());
        }
        self.inner.msg.get(trname).map(|ep| ep.sessions.snapshot())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(
                &format!("/{API_VERSION}/{OBJ_STREAM_PATH}/{{trname}}"),
                put(put_objstream),
            )
            .route(
                &format!("/{API_VERSION}/{MSG_STREAM_PATH}/{{trname}}"),
                put(put_msgstream),
            )
            .with_state(Arc::clone(&self.inner))
    }
}

/// Matches `QPARAM_SENDER_ID` / `QPARAM_SESSION_ID` on the send side.
#[derive(Deserialize)]
struct SenderQuery {
    #[serde(default)]
    sid: String,
    #[serde(default)]
    sess: u64,
}

enum RecvFail {
    Framing(TransportError),
    Callback(anyhow::Error),
}

impl From<TransportError> for RecvFail {
    fn from(e: TransportError) -> Self {
        RecvFail::Framing(e)
    }
}

fn fail_response(trname: &str, f: RecvFail) -> Response {
    match f {
        RecvFail::Framing(e) => {
            warn!("{trname}: inbound session failed: {e}");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        },
        RecvFail::Callback(e) => {
            warn!("{trname}: receive callback failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
        },
    }
}

fn body_reader(headers: &HeaderMap, body: Body) -> Result<FrameReader, TransportError> {
    let compressed = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        == Some(CONTENT_ENCODING_ZSTD);
    let stream = body
        .into_data_stream()
        .map_err(TransportError::wire)
        .boxed();
    FrameReader::new(stream, compressed)
}

async fn put_objstream(
    State(inner): State<Arc<DispatcherInner>>,
    Path(trname): Path<String>,
    Query(q): Query<SenderQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(ep) = inner.obj.get(&trname).map(|e| Arc::clone(e.value())) else {
        return (
            StatusCode::NOT_FOUND,
            format!("no object stream registered at {trname}"),
        )
            .into_response();
    };
    let fr = match body_reader(&headers, body) {
        Ok(fr) => fr,
        Err(e) => return fail_response(&trname, RecvFail::Framing(e)),
    };
    match obj_session(&ep, &q, fr).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(f) => fail_response(&trname, f),
    }
}

/// One incarnation of one sender-side object stream.
async fn obj_session(
    ep: &ObjEndpoint,
    q: &SenderQuery,
    mut fr: FrameReader,
) -> Result<(), RecvFail> {
    let sess: Arc<RxSession> = ep.sessions.touch(&q.sid, q.sess);
    loop {
        let Some(ph) = fr.read_proto_hdr().await? else {
            return Ok(());
        };
        let flags = ph.frame_flags()?;
        if flags.contains(FrameFlags::MSG) {
            return Err(TransportError::framing(
                FramingKind::BadFlags,
                "message frame on an object stream",
            )
            .into());
        }
        if flags.contains(FrameFlags::PDU) {
            return Err(TransportError::framing(
                FramingKind::PduOutOfSequence,
                "PDU frame with no open object",
            )
            .into());
        }
        let body = fr.read_frame(&ph, flags).await?;
        sess.offset
            .fetch_add((PROTO_HDR_LEN + body.len()) as u64, Ordering::Relaxed);
        let hdr = ObjHdr::deserialize(&body)?;

        if hdr.is_internal() {
            if hdr.opcode == OPC_FIN {
                debug!("{}#{}: FIN", sess.sid, sess.sess);
                sess.finished.store(true, Ordering::Release);
            }
            continue;
        }

        let mode = if hdr.is_unsized() || flags.contains(FrameFlags::PDU_STREAM) {
            Mode::Pdu(PduState {
                left: 0,
                crc: 0,
                want_crc: 0,
                cur_last: false,
                done: false,
            })
        } else if hdr.attrs.size == 0 {
            Mode::Empty
        } else {
            Mode::Sized {
                left: hdr.attrs.size as u64,
            }
        };

        let fqn = hdr.fqn();
        let mut payload = ObjPayload::new(&mut fr, mode);
        match ep.cb.recv(hdr, &mut payload).await {
            Ok(()) => {
                if !payload.drained() {
                    let skipped = payload.discard_rest().await?;
                    warn!("{fqn}: callback returned before draining, skipped {skipped} bytes");
                }
            },
            Err(e) => return Err(RecvFail::Callback(e)),
        }
        let consumed = payload.consumed();
        sess.num.fetch_add(1, Ordering::Relaxed);
        sess.size.fetch_add(consumed, Ordering::Relaxed);
        sess.offset.fetch_add(consumed, Ordering::Relaxed);
    }
}

async fn put_msgstream(
    State(inner): State<Arc<DispatcherInner>>,
    Path(trname): Path<String>,
    Query(q): Query<SenderQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(ep) = inner.msg.get(&trname).map(|e| Arc::clone(e.value())) else {
        return (
            StatusCode::NOT_FOUND,
            format!("no message stream registered at {trname}"),
        )
            .into_response();
    };
    let fr = match body_reader(&headers, body) {
        Ok(fr) => fr,
        Err(e) => return fail_response(&trname, RecvFail::Framing(e)),
    };
    match msg_session(&ep, &q, fr).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(f) => fail_response(&trname, f),
    }
}

async fn msg_session(
    ep: &MsgEndpoint,
    q: &SenderQuery,
    mut fr: FrameReader,
) -> Result<(), RecvFail> {
    let sess = ep.sessions.touch(&q.sid, q.sess);
    loop {
        let Some(ph) = fr.read_proto_hdr().await? else {
            return Ok(());
        };
        let flags = ph.frame_flags()?;
        if !flags.contains(FrameFlags::MSG) {
            return Err(TransportError::framing(
                FramingKind::BadFlags,
                "non-message frame on a message stream",
            )
            .into());
        }
        let body = fr.read_frame(&ph, flags).await?;
        sess.offset
            .fetch_add((PROTO_HDR_LEN + body.len()) as u64, Ordering::Relaxed);
        let msg = Msg::deserialize(&body)?;

        if msg.is_internal() {
            if msg.opcode == OPC_FIN {
                debug!("{}#{}: FIN", sess.sid, sess.sess);
                sess.finished.store(true, Ordering::Release);
            }
            continue;
        }
        let sz = msg.body.len() as u64;
        ep.cb.recv(msg).map_err(RecvFail::Callback)?;
        sess.num.fetch_add(1, Ordering::Relaxed);
        sess.size.fetch_add(sz, Ordering::Relaxed);
    }
}
