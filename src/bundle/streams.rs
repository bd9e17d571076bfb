// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Result, ensure};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    cfg::config::{Network, StreamArgs},
    cluster::{ClusterOwner, Node, RecvKind},
    errors::TransportError,
    stream::{
        base::{StatsSnapshot, obj_stream_url},
        obj::{Obj, ObjReader, ObjStream, Prc, fire_completion},
    },
};

/// Bundle construction arguments; one bundle per subsystem (trname).
#[derive(Clone)]
pub struct BundleArgs {
    pub trname: String,
    pub network: Network,
    pub rx_kind: RecvKind,
    /// Streams per peer, selected round-robin.
    pub multiplier: usize,
    pub stream: StreamArgs,
    /// Follow cluster-map changes automatically.
    pub auto_resync: bool,
}

impl BundleArgs {
    pub fn new(trname: impl Into<String>) -> Self {
        BundleArgs {
            trname: trname.into(),
            network: Network::IntraData,
            rx_kind: RecvKind::Targets,
            multiplier: 1,
            stream: StreamArgs::default(),
            auto_resync: true,
        }
    }
}

pub(crate) struct Robin {
    streams: Vec<Arc<ObjStream>>,
    rr: AtomicU64,
}

impl Robin {
    fn pick(&self) -> &Arc<ObjStream> {
        let i = self.rr.fetch_add(1, Ordering::Relaxed) as usize % self.streams.len();
        &self.streams[i]
    }
}

type PeerMap = HashMap<String, Arc<Robin>>;

struct BundleInner {
    client: reqwest::Client,
    owner: Arc<dyn ClusterOwner>,
    local: Arc<Node>,
    args: BundleArgs,
    /// Published map; `send()` readers clone the Arc, writers swap it whole.
    map: RwLock<Arc<PeerMap>>,
    smap_ver: AtomicU64,
    /// Serializes resyncs; the published map stays valid throughout.
    resync_mtx: Mutex<()>,
    watcher: StdMutex<Option<JoinHandle<()>>>,
}

/// Fan-out group: `multiplier` object streams to every admitted peer, kept
/// in sync with cluster membership.
pub struct Bundle {
    inner: Arc<BundleInner>,
}

impl Bundle {
    pub async fn new(
        client: reqwest::Client,
        owner: Arc<dyn ClusterOwner>,
        local: Arc<Node>,
        args: BundleArgs,
    ) -> Result<Self> {
        ensure!(args.multiplier >= 1, "multiplier must be >= 1");
        ensure!(!args.trname.is_empty(), "trname must not be empty");
        args.stream.validate()?;

        let auto = args.auto_resync;
        let inner = Arc::new(BundleInner {
            client,
            owner,
            local,
            args,
            map: RwLock::new(Arc::new(PeerMap::new())),
            smap_ver: AtomicU64::new(0),
            resync_mtx: Mutex::new(()),
            watcher: StdMutex::new(None),
        });
        inner.resync().await?;

        if auto {
            let weak = Arc::downgrade(&inner);
            let mut rx = inner.owner.subscribe();
            let h = tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let Some(inner) = weak.upgrade() else { return };
                    if let Err(e) = inner.resync().await {
                        warn!("{}: resync failed: {e:#}", inner.args.trname);
                    }
                }
            });
            *lock(&inner.watcher) = Some(h);
        }
        Ok(Bundle { inner })
    }

    /// Re-diff against the current cluster map; a stale version is a no-op.
    pub async fn resync(&self) -> Result<()> {
        self.inner.resync().await
    }

    /// Fan out one object: to every peer when `nodes` is `None`, else to the
    /// given subset. The user callback (if any) fires exactly once after the
    /// last replica completes, with the first failure if any.
    pub async fn send(
        &self,
        mut obj: Obj,
        nodes: Option<&[Arc<Node>]>,
    ) -> Result<(), TransportError> {
        let inner = &self.inner;
        let map = lock_read(&inner.map);

        if obj.hdr.is_unsized() && inner.args.stream.size_pdu == 0 {
            let e = TransportError::UnsizedWithoutPdu {
                trname: inner.args.trname.clone(),
            };
            fire_completion(obj, Some(e.clone()));
            return Err(e);
        }

        let robins: Vec<Arc<Robin>> = match nodes {
            None => map.values().cloned().collect(),
            Some(list) => {
                let mut v = Vec::with_capacity(list.len());
                for n in list {
                    match map.get(&n.id) {
                        Some(r) => v.push(Arc::clone(r)),
                        None => {
                            let e = TransportError::DestinationMissing {
                                dst: n.id.clone(),
                                trname: inner.args.trname.clone(),
                            };
                            fire_completion(obj, Some(e.clone()));
                            return Err(e);
                        },
                    }
                }
                v
            },
        };
        if robins.is_empty() {
            let e = TransportError::DestinationMissing {
                dst: "<none>".to_string(),
                trname: inner.args.trname.clone(),
            };
            fire_completion(obj, Some(e.clone()));
            return Err(e);
        }

        let k = robins.len();
        if k > 1 {
            obj.prc = Some(Arc::new(Prc::new(k as i64)));
        }

        // The first replica reuses the caller's reader; every other replica
        // gets an independent one before anything is enqueued.
        let mut extra = Vec::with_capacity(k.saturating_sub(1));
        match obj.reader.as_ref() {
            Some(r) => {
                for _ in 1..k {
                    extra.push(r.open_fresh().map(Some).map_err(TransportError::wire));
                }
            },
            None => extra.resize_with(k.saturating_sub(1), || Ok(None)),
        }
        let mut extra = extra.into_iter();

        let mut first_err: Option<TransportError> = None;
        for (i, robin) in robins.iter().enumerate() {
            let reader = if i == 0 {
                Ok(obj.reader.take())
            } else {
                extra.next().unwrap_or(Ok(None))
            };
            let mut rep = Obj {
                hdr: obj.hdr.clone(),
                reader: None,
                callback: obj.callback.clone(),
                cmpl_arg: obj.cmpl_arg.clone(),
                prc: obj.prc.clone(),
            };
            match reader {
                Err(e) => {
                    // Replica never reaches a stream; resolve it here.
                    fire_completion(rep, Some(e.clone()));
                    first_err.get_or_insert(e);
                },
                Ok(r) => {
                    rep.reader = r;
                    if let Err(e) = robin.pick().send(rep).await {
                        first_err.get_or_insert(e);
                    }
                },
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Graceful close drains every stream via `fin`; abortive close stops
    /// them. Either way the bundle stops listening for membership changes.
    pub async fn close(&self, graceful: bool) {
        if let Some(h) = lock(&self.inner.watcher).take() {
            h.abort();
        }
        let old = {
            let mut w = lock_write(&self.inner.map);
            std::mem::replace(&mut *w, Arc::new(PeerMap::new()))
        };
        for robin in old.values() {
            for s in &robin.streams {
                if graceful {
                    s.fin().await;
                } else {
                    s.stop();
                }
            }
        }
    }

    pub fn trname(&self) -> &str {
        &self.inner.args.trname
    }

    /// Peer ids currently wired into the bundle, sorted.
    pub fn peers(&self) -> Vec<String> {
        let map = lock_read(&self.inner.map);
        let mut v: Vec<String> = map.keys().cloned().collect();
        v.sort();
        v
    }

    /// Cluster-map version the bundle last resynced to.
    pub fn version(&self) -> u64 {
        self.inner.smap_ver.load(Ordering::Acquire)
    }

    /// Per-destination send-side counters, aggregated over the multiplier.
    pub fn stats(&self) -> Vec<(String, StatsSnapshot)> {
        let map = lock_read(&self.inner.map);
        let mut out: Vec<(String, StatsSnapshot)> = map
            .iter()
            .map(|(id, robin)| {
                let mut agg = StatsSnapshot {
                    num: 0,
                    size: 0,
                    offset: 0,
                    in_flight: 0,
                };
                for s in &robin.streams {
                    let st = s.stats();
                    agg.num += st.num;
                    agg.size += st.size;
                    agg.offset += st.offset;
                    agg.in_flight += st.in_flight;
                }
                (id.clone(), agg)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl BundleInner {
    async fn resync(self: &Arc<Self>) -> Result<()> {
        let _g = self.resync_mtx.lock().await;
        let smap = self.owner.smap();
        if smap.version <= self.smap_ver.load(Ordering::Acquire) {
            return Ok(());
        }

        let old = lock_read(&self.map);
        let mut newm = PeerMap::new();
        let (mut added, mut removed) = (0, 0);

        for (id, node) in &smap.nodes {
            if !self.args.rx_kind.admits(node.kind) || *id == self.local.id {
                continue;
            }
            if node.skip_in_bundle() {
                debug!("{}: skipping {id} (maintenance, post-rebalance)", self.args.trname);
                continue;
            }
            if let Some(robin) = old.get(id) {
                newm.insert(id.clone(), Arc::clone(robin));
                continue;
            }
            let url = obj_stream_url(node.url(self.args.network), &self.args.trname);
            let mut streams = Vec::with_capacity(self.args.multiplier);
            for _ in 0..self.args.multiplier {
                streams.push(Arc::new(ObjStream::new(
                    self.client.clone(),
                    url.clone(),
                    &self.local.id,
                    id,
                    &self.args.trname,
                    self.args.stream.clone(),
                )?));
            }
            newm.insert(
                id.clone(),
                Arc::new(Robin {
                    streams,
                    rr: AtomicU64::new(0),
                }),
            );
            added += 1;
        }

        for (id, robin) in old.iter() {
            if !newm.contains_key(id) {
                for s in &robin.streams {
                    if !s.terminated() {
                        s.stop();
                    }
                }
                removed += 1;
            }
        }

        *lock_write(&self.map) = Arc::new(newm);
        self.smap_ver.store(smap.version, Ordering::Release);
        debug!(
            "{}: resynced to v{} (+{added}/-{removed})",
            self.args.trname, smap.version
        );
        Ok(())
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn lock_read(m: &RwLock<Arc<PeerMap>>) -> Arc<PeerMap> {
    m.read().unwrap_or_else(|p| p.into_inner()).clone()
}

fn lock_write(m: &RwLock<Arc<PeerMap>>) -> std::sync::RwLockWriteGuard<'_, Arc<PeerMap>> {
    m.write().unwrap_or_else(|p| p.into_inner())
}
