// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::{Result, anyhow};
use once_cell::sync::OnceCell;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, warn};

use crate::{cfg::config::TransportConfig, stream::base::StreamOps};

/// Process-wide transport context: the validated config and the one
/// collector every stream registers with.
pub(crate) struct Ctx {
    pub cfg: TransportConfig,
    pub collector: Collector,
}

static CTX: OnceCell<Ctx> = OnceCell::new();

/// Starts the transport: validates the config and spawns the stream
/// collector. Must be called from within a tokio runtime, before the first
/// stream is constructed. A second call is a warned no-op.
pub fn init(mut cfg: TransportConfig) -> Result<()> {
    cfg.validate_and_normalize()?;
    if CTX.get().is_some() {
        warn!("transport already initialized; keeping the existing config");
        return Ok(());
    }
    let tick = cfg.tick_unit;
    let _ = CTX.get_or_init(|| Ctx {
        cfg,
        collector: Collector::spawn(tick),
    });
    Ok(())
}

pub(crate) fn ctx() -> Result<&'static Ctx> {
    CTX.get()
        .ok_or_else(|| anyhow!("transport not initialized; call objstream_rs::init() first"))
}

enum Ctrl {
    Add(Arc<dyn StreamOps>),
    Remove(String),
}

/// Handle to the collector task. Streams register themselves at
/// construction and deregister when their send loop exits; everything in
/// between is driven by the ticker.
pub(crate) struct Collector {
    tx: mpsc::UnboundedSender<Ctrl>,
}

impl Collector {
    pub fn spawn(tick_unit: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, tick_unit));
        Collector { tx }
    }

    pub fn add(&self, ops: Arc<dyn StreamOps>) {
        let _ = self.tx.send(Ctrl::Add(ops));
    }

    pub fn remove(&self, lid: &str) {
        let _ = self.tx.send(Ctrl::Remove(lid.to_string()));
    }
}

struct Entry {
    ops: Arc<dyn StreamOps>,
    /// Matches the live heap slot; stale slots are skipped on pop.
    seq: u64,
}

/// The collector loop owns its map and deadline heap exclusively; all
/// mutation happens from inside this select.
async fn run(mut rx: mpsc::UnboundedReceiver<Ctrl>, tick_unit: Duration) {
    let mut map: HashMap<String, Entry> = HashMap::new();
    // Min-heap of (due_tick, seq); invalidated lazily via the entry seq.
    let mut heap: BinaryHeap<Reverse<(u64, u64, String)>> = BinaryHeap::new();
    let mut next_seq: u64 = 0;
    let mut tick_no: u64 = 0;

    let mut ticker = tokio::time::interval(tick_unit);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            ctrl = rx.recv() => {
                let Some(ctrl) = ctrl else { return };
                match ctrl {
                    Ctrl::Add(ops) => {
                        let lid = ops.lid().to_string();
                        let due = tick_no + ticks_for(&*ops, tick_unit);
                        next_seq += 1;
                        debug!("collector: add {lid} (due tick {due})");
                        heap.push(Reverse((due, next_seq, lid.clone())));
                        map.insert(lid, Entry { ops, seq: next_seq });
                    },
                    Ctrl::Remove(lid) => {
                        if map.remove(&lid).is_some() {
                            debug!("collector: remove {lid}");
                        }
                    },
                }
            },
            _ = ticker.tick() => {
                tick_no += 1;
                while let Some(Reverse((due, _, _))) = heap.peek() {
                    if *due > tick_no {
                        break;
                    }
                    let Some(Reverse((_, seq, lid))) = heap.pop() else { break };
                    let Some(entry) = map.get(&lid) else { continue };
                    if entry.seq != seq {
                        continue; // superseded deadline
                    }
                    if entry.ops.is_terminated() {
                        debug!("collector: {lid} terminated, dropping");
                        map.remove(&lid);
                        continue;
                    }
                    if !entry.ops.clear_in_send() {
                        entry.ops.post_idle_tick();
                    }
                    let due = tick_no + ticks_for(&*entry.ops, tick_unit);
                    next_seq += 1;
                    heap.push(Reverse((due, next_seq, lid.clone())));
                    if let Some(entry) = map.get_mut(&lid) {
                        entry.seq = next_seq;
                    }
                }
            },
        }
    }
}

fn ticks_for(ops: &dyn StreamOps, tick_unit: Duration) -> u64 {
    let idle = ops.idle_teardown().as_millis() as u64;
    let unit = tick_unit.as_millis().max(1) as u64;
    (idle / unit).max(1)
}
