// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::config::{Compression, StreamArgs},
    errors::TransportError,
    wire::compress::{BodyCompressor, CONTENT_ENCODING_ZSTD},
};

pub const API_VERSION: &str = "v1";
pub const OBJ_STREAM_PATH: &str = "objstream";
pub const MSG_STREAM_PATH: &str = "msgstream";

/// Query parameters identifying the sender side of one incarnation.
pub const QPARAM_SENDER_ID: &str = "sid";
pub const QPARAM_SESSION_ID: &str = "sess";

/// Full PUT URL for an object-stream endpoint on `base` (scheme://host:port).
pub fn obj_stream_url(base: &str, trname: &str) -> String {
    format!("{base}/{API_VERSION}/{OBJ_STREAM_PATH}/{trname}")
}

/// Full PUT URL for a message-stream endpoint on `base`.
pub fn msg_stream_url(base: &str, trname: &str) -> String {
    format!("{base}/{API_VERSION}/{MSG_STREAM_PATH}/{trname}")
}

// Process-global generators: session ids are monotonic per endpoint across
// all streams; stream ids make the `lid` stable and unique.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Initial = 0,
    Active = 1,
    Inactive = 2,
    Terminated = 3,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::Active,
            2 => StreamState::Inactive,
            3 => StreamState::Terminated,
            _ => StreamState::Initial,
        }
    }
}

/// Why a stream stopped, recorded once; later writers lose.
#[derive(Debug, Clone)]
pub struct Termination {
    pub reason: String,
    pub err: Option<TransportError>,
}

#[derive(Debug, Default)]
pub struct StreamStats {
    /// Objects (or messages) fully written to the wire.
    pub num: AtomicU64,
    /// Payload bytes fully written.
    pub size: AtomicU64,
    /// Cumulative wire bytes produced, frames included.
    pub offset: AtomicU64,
    /// Payload bytes accepted by `send()` and not yet completed.
    pub in_flight: AtomicI64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub num: u64,
    pub size: u64,
    pub offset: u64,
    pub in_flight: i64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            num: self.num.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// State shared by both stream flavors. The send loop is the only writer of
/// wire bytes; everything else reaches the stream through atomics, the
/// bounded queue, or the two cancellation tokens.
pub(crate) struct StreamCore {
    pub lid: String,
    pub trname: String,
    pub src_id: String,
    pub dst_id: String,
    pub dst_url: String,

    state: AtomicU8,
    sess_id: AtomicU64,
    pub in_send: AtomicBool,
    fin_gate: AtomicBool,

    /// Abortive stop; the send loop drains and exits as soon as it observes
    /// this token.
    pub stopped: CancellationToken,
    /// Cancelled after both loops exited; `fin()` waits on it.
    pub done: CancellationToken,

    term: Mutex<Option<Termination>>,
    pub stats: StreamStats,
    pub args: StreamArgs,
    pub client: Option<reqwest::Client>,
}

impl StreamCore {
    pub fn new(
        kind: &str,
        client: Option<reqwest::Client>,
        dst_url: String,
        src_id: &str,
        dst_id: &str,
        trname: &str,
        args: StreamArgs,
    ) -> Self {
        let sid = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let lid = format!("{kind}-{src_id}=>{dst_id}[{trname}#{sid}]");
        StreamCore {
            lid,
            trname: trname.to_string(),
            src_id: src_id.to_string(),
            dst_id: dst_id.to_string(),
            dst_url,
            state: AtomicU8::new(StreamState::Initial as u8),
            sess_id: AtomicU64::new(0),
            in_send: AtomicBool::new(false),
            fin_gate: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            done: CancellationToken::new(),
            term: Mutex::new(None),
            stats: StreamStats::default(),
            args,
            client,
        }
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: StreamState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn terminated(&self) -> bool {
        self.state() == StreamState::Terminated
    }

    /// Current incarnation id; 0 until the first activation.
    pub fn session_id(&self) -> u64 {
        self.sess_id.load(Ordering::Acquire)
    }

    /// Allocate the next incarnation id off the process-global counter.
    pub fn next_session_id(&self) -> u64 {
        let s = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        self.sess_id.store(s, Ordering::Release);
        s
    }

    /// Reject user enqueues past `fin()`; returns false if already closed.
    pub fn close_fin_gate(&self) -> bool {
        !self.fin_gate.swap(true, Ordering::AcqRel)
    }

    pub fn fin_gate_closed(&self) -> bool {
        self.fin_gate.load(Ordering::Acquire)
    }

    pub fn record_term(&self, reason: &str, err: Option<TransportError>) {
        let mut g = self.term.lock().unwrap_or_else(|p| p.into_inner());
        if g.is_none() {
            debug!("{}: terminating ({reason}, err: {err:?})", self.lid);
            *g = Some(Termination {
                reason: reason.to_string(),
                err,
            });
        }
    }

    pub fn termination(&self) -> Option<Termination> {
        self.term.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// The error every late `send()` and every aborted in-flight object
    /// observes.
    pub fn term_error(&self) -> TransportError {
        match self.termination() {
            Some(Termination { err: Some(e), .. }) => e,
            Some(Termination { reason, .. }) => TransportError::StreamTerminated {
                lid: self.lid.clone(),
                reason,
            },
            None => TransportError::StreamTerminated {
                lid: self.lid.clone(),
                reason: "terminated".to_string(),
            },
        }
    }
}

/// Capability set the collector manipulates streams through; both stream
/// flavors implement it.
pub(crate) trait StreamOps: Send + Sync {
    fn lid(&self) -> &str;
    fn idle_teardown(&self) -> Duration;
    fn is_terminated(&self) -> bool;
    /// Swap the in-send flag off; true means the stream sent since the
    /// previous tick.
    fn clear_in_send(&self) -> bool;
    /// Non-blocking; a full queue means the stream is anything but idle.
    fn post_idle_tick(&self);
}

/// One incarnation's byte sink: either the body channel of an in-flight
/// HTTP PUT, or a counting sink in dry-run mode.
enum WirePipe {
    Http {
        tx: mpsc::Sender<io::Result<Bytes>>,
        resp: JoinHandle<Result<(), TransportError>>,
    },
    DryRun,
}

/// Wire sink plus the optional opaque compression layer.
pub(crate) struct Outbound {
    pipe: WirePipe,
    comp: Option<BodyCompressor>,
    stop: CancellationToken,
}

impl Outbound {
    /// Issue the HTTP PUT for a fresh incarnation (or a dry-run sink) and
    /// return the byte path into its body.
    pub fn open(core: &StreamCore, sess_id: u64) -> Result<Self, TransportError> {
        let comp = match core.args.compression {
            Compression::Always => Some(BodyCompressor::new()?),
            Compression::Never => None,
        };
        let pipe = match &core.client {
            None => WirePipe::DryRun,
            Some(client) => {
                let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);
                let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
                let sess = sess_id.to_string();
                let mut req = client
                    .put(&core.dst_url)
                    .query(&[
                        (QPARAM_SENDER_ID, core.src_id.as_str()),
                        (QPARAM_SESSION_ID, sess.as_str()),
                    ])
                    .body(body);
                if comp.is_some() {
                    req = req.header(reqwest::header::CONTENT_ENCODING, CONTENT_ENCODING_ZSTD);
                }
                let lid = core.lid.clone();
                let resp = tokio::spawn(async move {
                    match req.send().await {
                        Ok(r) if r.status().is_success() => Ok(()),
                        Ok(r) => Err(TransportError::wire(format!(
                            "{lid}: receiver replied {}",
                            r.status()
                        ))),
                        Err(e) => Err(TransportError::wire(format!("{lid}: {e}"))),
                    }
                });
                WirePipe::Http { tx, resp }
            },
        };
        Ok(Outbound {
            pipe,
            comp,
            stop: core.stopped.clone(),
        })
    }

    pub async fn push(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        let chunk = match &mut self.comp {
            Some(c) => {
                let z = c.push(&chunk)?;
                if z.is_empty() {
                    return Ok(());
                }
                z
            },
            None => chunk,
        };
        match &self.pipe {
            WirePipe::DryRun => Ok(()),
            WirePipe::Http { tx, .. } => tokio::select! {
                _ = self.stop.cancelled() => Err(TransportError::wire("stopped mid-send")),
                res = tx.send(Ok(chunk)) => {
                    res.map_err(|_| TransportError::wire("request body closed"))
                },
            },
        }
    }

    /// Clean EOF: flush compression, close the body, await the response.
    pub async fn finish(mut self) -> Result<(), TransportError> {
        let tail = match self.comp.take() {
            Some(c) => c.finish()?,
            None => Bytes::new(),
        };
        match self.pipe {
            WirePipe::DryRun => Ok(()),
            WirePipe::Http { tx, resp } => {
                if !tail.is_empty() {
                    tx.send(Ok(tail))
                        .await
                        .map_err(|_| TransportError::wire("request body closed"))?;
                }
                drop(tx);
                match resp.await {
                    Ok(r) => r,
                    Err(e) => Err(TransportError::wire(format!("response task: {e}"))),
                }
            },
        }
    }

    /// Abortive close: drop the body channel mid-stream and forget the
    /// response.
    pub fn abort(self) {
        if let WirePipe::Http { resp, .. } = self.pipe {
            resp.abort();
        }
    }
}
