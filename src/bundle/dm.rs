// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use futures_util::future::BoxFuture;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::{
    cfg::config::{Compression, Network, StreamArgs},
    cluster::{ClusterOwner, Node, RecvKind},
    errors::TransportError,
    recv::dispatch::{Dispatcher, ObjPayload, RecvObj},
    stream::obj::{Obj, fire_completion},
    wire::hdr::ObjHdr,
};

use super::streams::{Bundle, BundleArgs};

/// Distinguishes the ack endpoint of a data mover from its data endpoint.
pub const ACK_TRNAME_PREFIX: &str = "ack.";

pub fn ack_trname(trname: &str) -> String {
    format!("{ACK_TRNAME_PREFIX}{trname}")
}

/// Narrow seam to the parent long-running task: abort signal plus stat
/// sinks. Everything else about task management stays out of scope.
pub trait Task: Send + Sync {
    fn id(&self) -> &str;
    fn aborted(&self) -> bool;
    fn add_out_objs(&self, _n: u64) {}
    fn add_out_bytes(&self, _n: u64) {}
    fn add_in_objs(&self, _n: u64) {}
    fn add_in_bytes(&self, _n: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiRes {
    Quiescent,
    Aborted,
    Timeout,
}

#[derive(Clone)]
pub struct DataMoverArgs {
    pub trname: String,
    pub network: Network,
    pub rx_kind: RecvKind,
    pub multiplier: usize,
    pub stream: StreamArgs,
    /// Mount a second, `ack.`-prefixed bundle for header-only replies.
    pub with_ack: bool,
}

impl DataMoverArgs {
    pub fn new(trname: impl Into<String>) -> Self {
        DataMoverArgs {
            trname: trname.into(),
            network: Network::IntraData,
            rx_kind: RecvKind::Targets,
            multiplier: 1,
            stream: StreamArgs::default(),
            with_ack: false,
        }
    }
}

struct DmInner {
    client: reqwest::Client,
    owner: Arc<dyn ClusterOwner>,
    local: Arc<Node>,
    dispatcher: Dispatcher,
    task: Arc<dyn Task>,
    args: DataMoverArgs,
    data: OnceCell<Bundle>,
    ack: OnceCell<Bundle>,
    regred: AtomicBool,
    opened: AtomicBool,
    /// Set by every inbound object; `quiesce` watches it go quiet.
    laterx: Arc<AtomicBool>,
}

/// Data bundle plus optional ack bundle, scoped to one parent task.
/// Lifecycle: `reg_recv` -> `open` -> (`send`/`ack`)* -> `quiesce` ->
/// `close` -> `unreg_recv`.
#[derive(Clone)]
pub struct DataMover {
    inner: Arc<DmInner>,
}

/// Wraps the user callback: flags receive activity and feeds task stats.
struct RxHook {
    cb: Arc<dyn RecvObj>,
    laterx: Arc<AtomicBool>,
    task: Arc<dyn Task>,
}

impl RecvObj for RxHook {
    fn recv<'a>(&'a self, hdr: ObjHdr, payload: &'a mut ObjPayload<'_>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.laterx.store(true, Ordering::Release);
            let sz = hdr.attrs.size.max(0) as u64;
            self.cb.recv(hdr, payload).await?;
            self.task.add_in_objs(1);
            self.task.add_in_bytes(sz);
            Ok(())
        })
    }
}

impl DataMover {
    pub fn new(
        client: reqwest::Client,
        owner: Arc<dyn ClusterOwner>,
        local: Arc<Node>,
        dispatcher: Dispatcher,
        task: Arc<dyn Task>,
        args: DataMoverArgs,
    ) -> Result<Self> {
        ensure!(args.multiplier >= 1, "multiplier must be >= 1");
        ensure!(!args.trname.is_empty(), "trname must not be empty");
        args.stream.validate()?;
        Ok(DataMover {
            inner: Arc::new(DmInner {
                client,
                owner,
                local,
                dispatcher,
                task,
                args,
                data: OnceCell::new(),
                ack: OnceCell::new(),
                regred: AtomicBool::new(false),
                opened: AtomicBool::new(false),
                laterx: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    /// Mount receive handlers for the data (and ack) endpoints.
    pub fn reg_recv(
        &self,
        data_cb: Arc<dyn RecvObj>,
        ack_cb: Option<Arc<dyn RecvObj>>,
    ) -> Result<()> {
        let inner = &self.inner;
        ensure!(
            !inner.regred.load(Ordering::Acquire),
            "{}: receive handlers already registered",
            inner.args.trname
        );
        inner.dispatcher.handle_obj_stream(
            &inner.args.trname,
            Arc::new(RxHook {
                cb: data_cb,
                laterx: Arc::clone(&inner.laterx),
                task: Arc::clone(&inner.task),
            }),
        )?;
        if inner.args.with_ack {
            let cb = ack_cb.context("ack callback required when with_ack is set")?;
            inner.dispatcher.handle_obj_stream(
                &ack_trname(&inner.args.trname),
                Arc::new(RxHook {
                    cb,
                    laterx: Arc::clone(&inner.laterx),
                    task: Arc::clone(&inner.task),
                }),
            )?;
        }
        inner.regred.store(true, Ordering::Release);
        Ok(())
    }

    /// Construct the bundles (initial resync included).
    pub async fn open(&self) -> Result<()> {
        let inner = &self.inner;
        ensure!(
            inner.regred.load(Ordering::Acquire),
            "{}: reg_recv must precede open",
            inner.args.trname
        );
        ensure!(
            !inner.opened.load(Ordering::Acquire),
            "{}: already open",
            inner.args.trname
        );

        let data = Bundle::new(
            inner.client.clone(),
            Arc::clone(&inner.owner),
            Arc::clone(&inner.local),
            BundleArgs {
                trname: inner.args.trname.clone(),
                network: inner.args.network,
                rx_kind: inner.args.rx_kind,
                multiplier: inner.args.multiplier,
                stream: inner.args.stream.clone(),
                auto_resync: true,
            },
        )
        .await?;
        inner
            .data
            .set(data)
            .map_err(|_| anyhow!("{}: already open", inner.args.trname))?;

        if inner.args.with_ack {
            // Acks are small and latency-bound: single stream, no PDUs, no
            // compression.
            let ack = Bundle::new(
                inner.client.clone(),
                Arc::clone(&inner.owner),
                Arc::clone(&inner.local),
                BundleArgs {
                    trname: ack_trname(&inner.args.trname),
                    network: inner.args.network,
                    rx_kind: inner.args.rx_kind,
                    multiplier: 1,
                    stream: StreamArgs {
                        size_pdu: 0,
                        compression: Compression::Never,
                        ..inner.args.stream.clone()
                    },
                    auto_resync: true,
                },
            )
            .await?;
            inner
                .ack
                .set(ack)
                .map_err(|_| anyhow!("{}: ack bundle already open", inner.args.trname))?;
        }
        inner.opened.store(true, Ordering::Release);
        debug!("{}: open", inner.args.trname);
        Ok(())
    }

    /// Delegate to the data bundle, feeding task-level out-stats on success.
    pub async fn send(
        &self,
        obj: Obj,
        nodes: Option<&[Arc<Node>]>,
    ) -> Result<(), TransportError> {
        let inner = &self.inner;
        if !inner.opened.load(Ordering::Acquire) {
            let e = TransportError::Wire(format!("{}: data mover is not open", inner.args.trname));
            fire_completion(obj, Some(e.clone()));
            return Err(e);
        }
        let Some(data) = inner.data.get() else {
            let e = TransportError::Wire(format!("{}: data mover is not open", inner.args.trname));
            fire_completion(obj, Some(e.clone()));
            return Err(e);
        };
        let sz = obj.hdr.attrs.size.max(0) as u64;
        data.send(obj, nodes).await?;
        inner.task.add_out_objs(1);
        inner.task.add_out_bytes(sz);
        Ok(())
    }

    /// Header-only reply over the ack bundle; a no-op when acks are off.
    pub async fn ack(&self, hdr: ObjHdr, node: Arc<Node>) -> Result<(), TransportError> {
        let Some(ack) = self.inner.ack.get() else {
            return Ok(());
        };
        ack.send(Obj::new(hdr), Some(std::slice::from_ref(&node)))
            .await
    }

    /// Poll until no receive activity for `idle`, the parent task aborts,
    /// or `max` elapses.
    pub async fn quiesce(&self, idle: Duration, max: Duration) -> QuiRes {
        let step = (idle / 4).max(Duration::from_millis(50));
        let mut quiet = Duration::ZERO;
        let mut waited = Duration::ZERO;
        loop {
            tokio::time::sleep(step).await;
            waited += step;
            if self.inner.task.aborted() {
                return QuiRes::Aborted;
            }
            if self.inner.laterx.swap(false, Ordering::AcqRel) {
                quiet = Duration::ZERO;
            } else {
                quiet += step;
                if quiet >= idle {
                    return QuiRes::Quiescent;
                }
            }
            if waited >= max {
                return QuiRes::Timeout;
            }
        }
    }

    /// Close both bundles; graceful iff `err` is `None`.
    pub async fn close(&self, err: Option<&TransportError>) {
        let inner = &self.inner;
        if !inner.opened.swap(false, Ordering::AcqRel) {
            return;
        }
        let graceful = err.is_none();
        if let Some(d) = inner.data.get() {
            d.close(graceful).await;
        }
        if let Some(a) = inner.ack.get() {
            a.close(graceful).await;
        }
        debug!("{}: closed (graceful: {graceful})", inner.args.trname);
    }

    /// Quiesce, then unmount the receive handlers.
    pub async fn unreg_recv(&self, quiesce_for: Duration) {
        let inner = &self.inner;
        if !inner.regred.swap(false, Ordering::AcqRel) {
            return;
        }
        let res = self.quiesce(quiesce_for, quiesce_for * 4).await;
        debug!("{}: unreg after quiesce ({res:?})", inner.args.trname);
        inner.dispatcher.unhandle(&inner.args.trname);
        if inner.args.with_ack {
            inner.dispatcher.unhandle(&ack_trname(&inner.args.trname));
        }
    }

    pub fn trname(&self) -> &str {
        &self.inner.args.trname
    }

    pub fn opened(&self) -> bool {
        self.inner.opened.load(Ordering::Acquire)
    }

    pub fn data_bundle(&self) -> Option<&Bundle> {
        self.inner.data.get()
    }

    pub fn task_id(&self) -> &str {
        self.inner.task.id()
    }
}
