// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use anyhow::Result;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::{
    cfg::config::StreamArgs,
    errors::TransportError,
    stream::{
        base::{Outbound, StatsSnapshot, StreamCore, StreamOps, StreamState},
        collector::ctx,
    },
    wire::{
        hdr::{Msg, OPC_FIN, OPC_IDLE_TICK},
        proto::{FrameFlags, frame},
    },
};

struct MsgInner {
    core: StreamCore,
    workc: mpsc::Sender<Msg>,
}

/// Message stream: the object stream's header-only sibling. Only opcoded
/// message frames flow; there are no readers to close and no completion
/// queue.
pub struct MsgStream {
    inner: Arc<MsgInner>,
}

impl MsgStream {
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

        let core = StreamCore::new("m", client, dst_url, src_id, dst_id, trname, args);
        let (work_tx, work_rx) = mpsc::channel(burst);

        let inner = Arc::new(MsgInner {
            core,
            workc: work_tx,
        });
        tokio::spawn(Arc::clone(&inner).send_loop(work_rx));
        c.collector.add(Arc::clone(&inner) as Arc<dyn StreamOps>);
        Ok(MsgStream { inner })
    }

    pub async fn send(&self, mut msg: Msg) -> Result<(), TransportError> {
        let core = &self.inner.core;
        if core.terminated() {
            return Err(core.term_error());
        }
        if core.fin_gate_closed() {
            return Err(TransportError::StreamTerminated {
                lid: core.lid.clone(),
                reason: "fin already sent".to_string(),
            });
        }
        if msg.sender_id.is_empty() {
            msg.sender_id = core.src_id.clone();
        }
        core.in_send.store(true, Ordering::Release);
        self.inner
            .workc
            .send(msg)
            .await
            .map_err(|_| core.term_error())
    }

    pub async fn fin(&self) {
        let core = &self.inner.core;
        if core.close_fin_gate() {
            let fin = Msg {
                sender_id: core.src_id.clone(),
                opcode: OPC_FIN,
                body: Default::default(),
            };
            let _ = self.inner.workc.send(fin).await;
        }
        core.done.cancelled().await;
    }

    pub fn stop(&self) {
        self.inner.core.stopped.cancel();
    }

    pub fn lid(&self) -> &str {
        &self.inner.core.lid
    }

    pub fn state(&self) -> StreamState {
        self.inner.core.state()
    }

    pub fn terminated(&self) -> bool {
        self.inner.core.terminated()
    }

    pub fn session_id(&self) -> u64 {
        self.inner.core.session_id()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.core.stats.snapshot()
    }
}

impl Drop for MsgStream {
    fn drop(&mut self) {
        let core = &self.inner.core;
        if !core.fin_gate_closed() && !core.terminated() && !core.stopped.is_cancelled() {
            warn!("{}: handle dropped without fin, stopping", core.lid);
            core.stopped.cancel();
        }
    }
}

impl StreamOps for MsgInner {
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
        let _ = self.workc.try_send(Msg::new(OPC_IDLE_TICK, Default::default()));
    }
}

impl MsgInner {
    async fn send_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Msg>) {
        match self.run(&mut rx).await {
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
        rx.close();
        while rx.recv().await.is_some() {}

        if let Ok(c) = ctx() {
            c.collector.remove(&self.core.lid);
        }
        self.core.done.cancel();
    }

    async fn run(&self, rx: &mut mpsc::Receiver<Msg>) -> Result<&'static str, TransportError> {
        let core = &self.core;
        loop {
            let first = tokio::select! {
                _ = core.stopped.cancelled() => {
                    return Err(TransportError::StreamTerminated {
                        lid: core.lid.clone(),
                        reason: "stopped".to_string(),
                    });
                },
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => return Ok("dropped"),
                },
            };
            match first.opcode {
                OPC_IDLE_TICK => continue,
                OPC_FIN => return Ok("fin"),
                _ => {},
            }

            let sess = core.next_session_id();
            core.set_state(StreamState::Active);
            debug!("{}: session {sess} active", core.lid);
            let mut out = Outbound::open(core, sess)?;

            let mut cur = Some(first);
            loop {
                let msg = match cur.take() {
                    Some(m) => m,
                    None => tokio::select! {
                        _ = core.stopped.cancelled() => {
                            out.abort();
                            return Err(TransportError::StreamTerminated {
                                lid: core.lid.clone(),
                                reason: "stopped".to_string(),
                            });
                        },
                        m = rx.recv() => match m {
                            Some(m) => m,
                            None => {
                                out.finish().await?;
                                return Ok("dropped");
                            },
                        },
                    },
                };
                match msg.opcode {
                    OPC_IDLE_TICK => match rx.try_recv() {
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
                        self.put_msg(&mut out, &msg).await?;
                        out.finish().await?;
                        return Ok("fin");
                    },
                    _ => self.put_msg(&mut out, &msg).await?,
                }
            }
        }
    }

    async fn put_msg(&self, out: &mut Outbound, msg: &Msg) -> Result<(), TransportError> {
        let body = msg
            .serialize(self.core.args.max_hdr_size)
            .map_err(TransportError::wire)?;
        let f = frame(FrameFlags::MSG, &body);
        self.core
            .stats
            .offset
            .fetch_add(f.len() as u64, Ordering::Relaxed);
        out.push(f).await?;
        if !msg.is_internal() {
            self.core.stats.num.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
