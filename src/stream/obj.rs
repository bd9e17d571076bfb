// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    any::Any,
    cmp::min,
    fmt,
    io,
    path::PathBuf,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    task::{Context, Poll},
};

use anyhow::Result;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    sync::mpsc::{self, error::TryRecvError},
};
use tracing::{debug, warn};

use crate::{
    cfg::config::StreamArgs,
    errors::TransportError,
    stream::{
        base::{Outbound, StatsSnapshot, StreamCore, StreamOps, StreamState},
        collector::ctx,
    },
    wire::{
        hdr::{OPC_FIN, OPC_IDLE_TICK, ObjHdr},
        proto::{FrameFlags, frame},
    },
};

const RAW_CHUNK: usize = 64 * 1024;

/// Payload source owned by the stream from `send()` on. `open_fresh` hands
/// out an independent reader over the same content; fan-out replicas must
/// not share read state.
pub trait ObjReader: AsyncRead + Send + Sync + Unpin {
    fn open_fresh(&self) -> Result<Box<dyn ObjReader>>;
}

/// In-memory reader; reopening clones the (cheap) `Bytes` handle.
pub struct BytesReader {
    data: Bytes,
    pos: usize,
}

impl BytesReader {
    pub fn new(data: Bytes) -> Self {
        BytesReader { data, pos: 0 }
    }
}

impl AsyncRead for BytesReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let n = min(buf.remaining(), me.data.len() - me.pos);
        buf.put_slice(&me.data[me.pos..me.pos + n]);
        me.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl ObjReader for BytesReader {
    fn open_fresh(&self) -> Result<Box<dyn ObjReader>> {
        Ok(Box::new(BytesReader::new(self.data.clone())))
    }
}

/// File-backed reader; reopening goes back to the path.
pub struct FileReader {
    path: PathBuf,
    file: tokio::fs::File,
}

impl FileReader {
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = tokio::fs::File::open(&path).await?;
        Ok(FileReader { path, file })
    }
}

impl AsyncRead for FileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

impl ObjReader for FileReader {
    fn open_fresh(&self) -> Result<Box<dyn ObjReader>> {
        let f = std::fs::File::open(&self.path)?;
        Ok(Box::new(FileReader {
            path: self.path.clone(),
            file: tokio::fs::File::from_std(f),
        }))
    }
}

/// Fan-out refcount: one per object, shared across its replicas. The
/// user-facing callback fires on the zero transition, with the first
/// recorded failure if any.
pub(crate) struct Prc {
    refc: AtomicI64,
    err: OnceCell<TransportError>,
}

impl Prc {
    pub fn new(n: i64) -> Self {
        Prc {
            refc: AtomicI64::new(n),
            err: OnceCell::new(),
        }
    }

    pub fn record_err(&self, e: TransportError) {
        let _ = self.err.set(e);
    }

    /// Remaining replicas after this completion.
    pub fn dec(&self) -> i64 {
        self.refc.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn first_err(&self) -> Option<TransportError> {
        self.err.get().cloned()
    }
}

/// Per-object completion callback: `(header, completion-arg, error)`.
pub type ObjSentCb =
    Arc<dyn Fn(&ObjHdr, Option<Arc<dyn Any + Send + Sync>>, Option<&TransportError>) + Send + Sync>;

/// One unit of work for an object stream: header, optional payload reader,
/// optional completion callback with its opaque argument, and the fan-out
/// refcount the bundle attaches.
pub struct Obj {
    pub hdr: ObjHdr,
    pub reader: Option<Box<dyn ObjReader>>,
    pub callback: Option<ObjSentCb>,
    pub cmpl_arg: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) prc: Option<Arc<Prc>>,
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Obj")
            .field("hdr", &self.hdr)
            .field("has_reader", &self.reader.is_some())
            .field("has_cb", &self.callback.is_some())
            .finish()
    }
}

impl Obj {
    /// Header-only object (`size` must stay 0 unless a reader is attached).
    pub fn new(hdr: ObjHdr) -> Self {
        Obj {
            hdr,
            reader: None,
            callback: None,
            cmpl_arg: None,
            prc: None,
        }
    }

    pub fn with_reader(hdr: ObjHdr, reader: Box<dyn ObjReader>) -> Self {
        Obj {
            hdr,
            reader: Some(reader),
            callback: None,
            cmpl_arg: None,
            prc: None,
        }
    }

    pub fn on_complete(mut self, cb: ObjSentCb) -> Self {
        self.callback = Some(cb);
        self
    }

    pub fn with_cmpl_arg(mut self, arg: Arc<dyn Any + Send + Sync>) -> Self {
        self.cmpl_arg = Some(arg);
        self
    }

    fn internal(opcode: u16, sender_id: &str) -> Self {
        Obj::new(ObjHdr {
            opcode,
            sender_id: sender_id.to_string(),
            ..Default::default()
        })
    }

    pub(crate) fn idle_tick() -> Self {
        Obj::internal(OPC_IDLE_TICK, "")
    }
}

/// Drop the reader, resolve the refcount, fire the callback. This is the
/// single funnel for the exactly-once completion guarantee; both the stream
/// completer and bundle preflight rejections go through it.
pub(crate) fn fire_completion(obj: Obj, err: Option<TransportError>) {
    let Obj {
        hdr,
        reader,
        callback,
        cmpl_arg,
        prc,
    } = obj;
    drop(reader);

    let final_err = match &prc {
        Some(prc) => {
            if let Some(e) = &err {
                prc.record_err(e.clone());
            }
            if prc.dec() > 0 {
                return;
            }
            prc.first_err().or(err)
        },
        None => err,
    };
    if let Some(cb) = callback {
        cb(&hdr, cmpl_arg, final_err.as_ref());
    }
}

struct Cmpl {
    obj: Obj,
    err: Option<TransportError>,
}

struct ObjInner {
    core: StreamCore,
    workc: mpsc::Sender<Obj>,
}

/// Send side of one object stream: a bounded queue in front of a single
/// writer task that owns the HTTP request body, plus a completer task that
/// drains `{obj, err}` records.
///
/// Not `Clone` on purpose; dropping the handle without `fin()` stops the
/// stream abortively.
pub struct ObjStream {
    inner: Arc<ObjInner>,
}

impl ObjStream {
    pub fn new(
        client: reqwest::Client,
        dst_url: String,
        src_id: &str,
        dst_id: &str,
        trname: &str,
        args: StreamArgs,
    ) -> Result<Self> {
        args.validate()?;
        let c = ctx()?;
        let burst = args.burst.unwrap_or(c.cfg.burst);
        let client = (!c.cfg.dryrun).then_some(client);

        let core = StreamCore::new("o", client, dst_url, src_id, dst_id, trname, args);
        let (work_tx, work_rx) = mpsc::channel(burst);
        let (cmpl_tx, cmpl_rx) = mpsc::channel(burst);

        let inner = Arc::new(ObjInner {
            core,
            workc: work_tx,
        });
        tokio::spawn(Arc::clone(&inner).cmpl_loop(cmpl_rx));
        tokio::spawn(Arc::clone(&inner).send_loop(work_rx, cmpl_tx));
        c.collector.add(Arc::clone(&inner) as Arc<dyn StreamOps>);
        Ok(ObjStream { inner })
    }

    /// Enqueue one object. The stream owns `obj.reader` from here on:
    /// exactly one close and exactly one completion, success or failure.
    pub async fn send(&self, mut obj: Obj) -> Result<(), TransportError> {
        let core = &self.inner.core;
        if core.terminated() {
            return Err(reject(obj, core.term_error()));
        }
        if core.fin_gate_closed() {
            return Err(reject(
                obj,
                TransportError::StreamTerminated {
                    lid: core.lid.clone(),
                    reason: "fin already sent".to_string(),
                },
            ));
        }
        if obj.hdr.sender_id.is_empty() {
            obj.hdr.sender_id = core.src_id.clone();
        }
        if obj.hdr.is_unsized() && core.args.size_pdu == 0 {
            return Err(reject(
                obj,
                TransportError::UnsizedWithoutPdu {
                    trname: core.trname.clone(),
                },
            ));
        }
        if obj.reader.is_none() && obj.hdr.attrs.size != 0 {
            let fqn = obj.hdr.fqn();
            return Err(reject(
                obj,
                TransportError::wire(format!(
                    "{}: missing reader for sized object {}",
                    core.lid, fqn
                )),
            ));
        }

        let sz = obj.hdr.attrs.size.max(0);
        core.stats.in_flight.fetch_add(sz, Ordering::Relaxed);
        core.in_send.store(true, Ordering::Release);
        match self.inner.workc.send(obj).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(obj)) => {
                core.stats.in_flight.fetch_sub(sz, Ordering::Relaxed);
                Err(reject(obj, core.term_error()))
            },
        }
    }

    /// Graceful close: emit a FIN frame once pending work drains, then wait
    /// for both loops to exit. Further `send()`s fail.
    pub async fn fin(&self) {
        let core = &self.inner.core;
        if core.close_fin_gate() {
            let fin = Obj::internal(OPC_FIN, &core.src_id);
            let _ = self.inner.workc.send(fin).await;
        }
        core.done.cancelled().await;
    }

    /// Abortive close: pending and in-flight objects complete with a
    /// termination error, no further wire activity.
    pub fn stop(&self) {
        self.inner.core.stopped.cancel();
    }

    pub async fn stopped_and_drained(&self) {
        self.inner.core.done.cancelled().await;
    }

    pub fn lid(&self) -> &str {
        &self.inner.core.lid
    }

    pub fn dst_id(&self) -> &str {
        &self.inner.core.dst_id
    }

    pub fn state(&self) -> StreamState {
        self.inner.core.state()
    }

    pub fn terminated(&self) -> bool {
        self.inner.core.terminated()
    }

    /// Current incarnation id (0 before first activation).
    pub fn session_id(&self) -> u64 {
        self.inner.core.session_id()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.core.stats.snapshot()
    }
}

impl Drop for ObjStream {
    fn drop(&mut self) {
        let core = &self.inner.core;
        if !core.fin_gate_closed() && !core.terminated() && !core.stopped.is_cancelled() {
            warn!("{}: handle dropped without fin, stopping", core.lid);
            core.stopped.cancel();
        }
    }
}

fn reject(obj: Obj, err: TransportError) -> TransportError {
    fire_completion(obj, Some(err.clone()));
    err
}

impl StreamOps for ObjInner {
    fn lid(&self) -> &str {
        &self.core.lid
    }

    fn idle_teardown(&self) -> std::time::Duration {
        self.core.args.idle_teardown
    }

    fn is_terminated(&self) -> bool {
        self.core.terminated()
    }

    fn clear_in_send(&self) -> bool {
        self.core.in_send.swap(false, Ordering::AcqRel)
    }

    fn post_idle_tick(&self) {
        let _ = self.workc.try_send(Obj::idle_tick());
    }
}

impl ObjInner {
    async fn cmpl_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Cmpl>) {
        while let Some(Cmpl { obj, err }) = rx.recv().await {
            let sz = obj.hdr.attrs.size.max(0);
            self.core.stats.in_flight.fetch_sub(sz, Ordering::Relaxed);
            fire_completion(obj, err);
        }
        // last out: fin()/stop() waiters resume only after every callback
        // has fired
        self.core.done.cancel();
    }

    async fn send_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Obj>, cmpl: mpsc::Sender<Cmpl>) {
        match self.run(&mut rx, &cmpl).await {
            Ok(reason) => self.core.record_term(reason, None),
            Err(e @ TransportError::StreamTerminated { .. }) => {
                self.core.record_term("stopped", Some(e));
            },
            Err(e) => {
                warn!("{}: send loop error: {e}", self.core.lid);
                self.core.record_term("wire error", Some(e));
            },
        }
        self.core.set_state(StreamState::Terminated);

        // Abort whatever is still queued (or racing in) into completions.
        rx.close();
        let term = self.core.term_error();
        while let Some(obj) = rx.recv().await {
            if obj.hdr.is_internal() {
                continue;
            }
            let _ = cmpl
                .send(Cmpl {
                    obj,
                    err: Some(term.clone()),
                })
                .await;
        }
        drop(cmpl);

        if let Ok(c) = ctx() {
            c.collector.remove(&self.core.lid);
        }
    }

    /// One iteration per incarnation; `Ok(reason)` is a clean exit.
    async fn run(
        &self,
        rx: &mut mpsc::Receiver<Obj>,
        cmpl: &mpsc::Sender<Cmpl>,
    ) -> Result<&'static str, TransportError> {
        let core = &self.core;
        loop {
            // No HTTP request outstanding; wait for work.
            let first = tokio::select! {
                _ = core.stopped.cancelled() => {
                    return Err(TransportError::StreamTerminated {
                        lid: core.lid.clone(),
                        reason: "stopped".to_string(),
                    });
                },
                o = rx.recv() => match o {
                    Some(o) => o,
                    None => return Ok("dropped"),
                },
            };
            match first.hdr.opcode {
                OPC_IDLE_TICK => continue,
                OPC_FIN => return Ok("fin"),
                _ => {},
            }

            let sess = core.next_session_id();
            core.set_state(StreamState::Active);
            debug!("{}: session {sess} active", core.lid);
            let mut out = match Outbound::open(core, sess) {
                Ok(out) => out,
                Err(e) => {
                    // `first` is a user object here; it must still complete.
                    let _ = cmpl
                        .send(Cmpl {
                            obj: first,
                            err: Some(e.clone()),
                        })
                        .await;
                    return Err(e);
                },
            };

            let mut cur = Some(first);
            loop {
                let obj = match cur.take() {
                    Some(o) => o,
                    None => tokio::select! {
                        _ = core.stopped.cancelled() => {
                            out.abort();
                            return Err(TransportError::StreamTerminated {
                                lid: core.lid.clone(),
                                reason: "stopped".to_string(),
                            });
                        },
                        o = rx.recv() => match o {
                            Some(o) => o,
                            None => {
                                out.finish().await?;
                                return Ok("dropped");
                            },
                        },
                    },
                };
                match obj.hdr.opcode {
                    OPC_IDLE_TICK => match rx.try_recv() {
                        // Still busy: swallow the tick, keep going.
                        Ok(next) => cur = Some(next),
                        Err(TryRecvError::Empty) => {
                            out.finish().await?;
                            core.set_state(StreamState::Inactive);
                            debug!("{}: session {sess} deactivated", core.lid);
                            break;
                        },
                        Err(TryRecvError::Disconnected) => {
                            out.finish().await?;
                            return Ok("dropped");
                        },
                    },
                    OPC_FIN => {
                        let body = obj
                            .hdr
                            .serialize(core.args.max_hdr_size)
                            .map_err(TransportError::wire)?;
                        let f = frame(FrameFlags::empty(), &body);
                        core.stats.offset.fetch_add(f.len() as u64, Ordering::Relaxed);
                        out.push(f).await?;
                        out.finish().await?;
                        return Ok("fin");
                    },
                    _ => self.transmit(&mut out, obj, cmpl).await?,
                }
            }
        }
    }

    /// Write one object: header frame, then raw or PDU-framed payload; push
    /// the completion record. A wire error mid-object completes the object
    /// with that error and terminates the stream.
    async fn transmit(
        &self,
        out: &mut Outbound,
        mut obj: Obj,
        cmpl: &mpsc::Sender<Cmpl>,
    ) -> Result<(), TransportError> {
        let core = &self.core;
        let pdu_mode = core.args.size_pdu > 0;
        let size = obj.hdr.attrs.size;
        let header_only = size == 0;

        let body = match obj.hdr.serialize(core.args.max_hdr_size) {
            Ok(b) => b,
            Err(e) => {
                // Nothing hit the wire; fail the object, keep the stream.
                let err = TransportError::wire(e);
                let _ = cmpl
                    .send(Cmpl {
                        obj,
                        err: Some(err),
                    })
                    .await;
                return Ok(());
            },
        };
        let mut flags = FrameFlags::empty();
        if pdu_mode && !header_only {
            flags |= FrameFlags::PDU_STREAM;
        }
        let hdr_frame = frame(flags, &body);
        core.stats
            .offset
            .fetch_add(hdr_frame.len() as u64, Ordering::Relaxed);
        if let Err(e) = out.push(hdr_frame).await {
            let _ = cmpl
                .send(Cmpl {
                    obj,
                    err: Some(e.clone()),
                })
                .await;
            return Err(e);
        }

        let res = if header_only {
            Ok(0)
        } else if pdu_mode {
            self.stream_pdus(out, &mut obj, size).await
        } else {
            self.stream_raw(out, &mut obj, size as u64).await
        };

        match res {
            Ok(paylen) => {
                core.stats.num.fetch_add(1, Ordering::Relaxed);
                core.stats.size.fetch_add(paylen, Ordering::Relaxed);
                let _ = cmpl.send(Cmpl { obj, err: None }).await;
                Ok(())
            },
            Err(e) => {
                let _ = cmpl
                    .send(Cmpl {
                        obj,
                        err: Some(e.clone()),
                    })
                    .await;
                Err(e)
            },
        }
    }

    /// Known-size payload as raw bytes, no per-chunk framing.
    async fn stream_raw(
        &self,
        out: &mut Outbound,
        obj: &mut Obj,
        total: u64,
    ) -> Result<u64, TransportError> {
        let reader = obj.reader.as_mut().ok_or_else(|| {
            TransportError::wire(format!("{}: reader vanished mid-send", self.core.lid))
        })?;
        let mut left = total;
        let mut chunk = vec![0u8; min(RAW_CHUNK as u64, total) as usize];
        while left > 0 {
            let want = min(left, chunk.len() as u64) as usize;
            let n = reader
                .read(&mut chunk[..want])
                .await
                .map_err(TransportError::wire)?;
            if n == 0 {
                return Err(TransportError::wire(format!(
                    "{}: short read, {left} of {total} bytes missing",
                    self.core.lid
                )));
            }
            let b = Bytes::copy_from_slice(&chunk[..n]);
            self.core
                .stats
                .offset
                .fetch_add(b.len() as u64, Ordering::Relaxed);
            out.push(b).await?;
            left -= n as u64;
        }
        Ok(total)
    }

    /// PDU-framed payload; mandatory for unsized objects. An unsized object
    /// always ends with a `PDU_LAST` frame, zero-length if need be.
    async fn stream_pdus(
        &self,
        out: &mut Outbound,
        obj: &mut Obj,
        size: i64,
    ) -> Result<u64, TransportError> {
        let reader = obj.reader.as_mut().ok_or_else(|| {
            TransportError::wire(format!("{}: reader vanished mid-send", self.core.lid))
        })?;
        let size_pdu = self.core.args.size_pdu;
        let total: Option<u64> = (size >= 0).then_some(size as u64);
        let mut buf = vec![0u8; size_pdu];
        let mut sent: u64 = 0;

        loop {
            let want = match total {
                Some(t) => min(size_pdu as u64, t - sent) as usize,
                None => size_pdu,
            };
            let mut filled = 0usize;
            let mut eof = false;
            while filled < want {
                let n = reader
                    .read(&mut buf[filled..want])
                    .await
                    .map_err(TransportError::wire)?;
                if n == 0 {
                    eof = true;
                    break;
                }
                filled += n;
            }
            let exhausted = match total {
                Some(t) => sent + filled as u64 == t,
                None => false,
            };
            if let Some(t) = total
                && eof
                && !exhausted
            {
                return Err(TransportError::wire(format!(
                    "{}: short read, got {} of {t} bytes",
                    self.core.lid,
                    sent + filled as u64
                )));
            }
            let last = eof || exhausted;
            let mut flags = FrameFlags::PDU;
            if last {
                flags |= FrameFlags::PDU_LAST;
            }
            let f = frame(flags, &buf[..filled]);
            self.core
                .stats
                .offset
                .fetch_add(f.len() as u64, Ordering::Relaxed);
            out.push(f).await?;
            sent += filled as u64;
            if last {
                return Ok(sent);
            }
        }
    }
}
