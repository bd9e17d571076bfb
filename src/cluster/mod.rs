// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::Arc};

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::cfg::config::Network;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Target,
    Proxy,
}

/// One cluster member as seen by the transport: identity, per-network base
/// URLs, and the maintenance flags a bundle consults during resync.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub intra_data_url: String,
    pub intra_control_url: String,
    pub public_url: String,
    #[serde(default)]
    pub in_maintenance: bool,
    #[serde(default)]
    pub post_rebalance: bool,
}

impl Node {
    pub fn url(&self, net: Network) -> &str {
        match net {
            Network::IntraData => &self.intra_data_url,
            Network::IntraControl => &self.intra_control_url,
            Network::Public => &self.public_url,
        }
    }

    /// Peers that are in maintenance and already past their rebalance are
    /// not wired into bundles.
    pub fn skip_in_bundle(&self) -> bool {
        self.in_maintenance && self.post_rebalance
    }
}

/// Which node kinds a bundle fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecvKind {
    #[default]
    Targets,
    Proxies,
    All,
}

impl RecvKind {
    pub fn admits(&self, kind: NodeKind) -> bool {
        match self {
            RecvKind::Targets => kind == NodeKind::Target,
            RecvKind::Proxies => kind == NodeKind::Proxy,
            RecvKind::All => true,
        }
    }
}

/// Immutable membership snapshot. Bundles diff consecutive versions; the
/// version must strictly advance on every publish.
#[derive(Debug, Clone, Default)]
pub struct ClusterMap {
    pub version: u64,
    pub nodes: HashMap<String, Arc<Node>>,
}

impl ClusterMap {
    pub fn new(version: u64) -> Self {
        ClusterMap {
            version,
            nodes: HashMap::new(),
        }
    }

    pub fn with_nodes(version: u64, nodes: impl IntoIterator<Item = Node>) -> Self {
        ClusterMap {
            version,
            nodes: nodes
                .into_iter()
                .map(|n| (n.id.clone(), Arc::new(n)))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.get(id).cloned()
    }

    pub fn count(&self, rx: RecvKind) -> usize {
        self.nodes.values().filter(|n| rx.admits(n.kind)).count()
    }
}

/// Membership snapshot provider; the rest of the metadata layer stays out
/// of scope behind this seam.
pub trait ClusterOwner: Send + Sync {
    fn smap(&self) -> Arc<ClusterMap>;

    /// Change notifications for auto-resyncing bundles.
    fn subscribe(&self) -> watch::Receiver<Arc<ClusterMap>>;
}

/// Watch-channel backed `ClusterOwner` for hosts and tests.
pub struct ClusterHub {
    tx: watch::Sender<Arc<ClusterMap>>,
}

impl ClusterHub {
    pub fn new(initial: ClusterMap) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        ClusterHub { tx }
    }

    /// Publish a new snapshot; the version must advance.
    pub fn publish(&self, smap: ClusterMap) -> Result<()> {
        let cur = self.tx.borrow().version;
        ensure!(
            smap.version > cur,
            "cluster map version must advance: {} -> {}",
            cur,
            smap.version
        );
        let _ = self.tx.send(Arc::new(smap));
        Ok(())
    }
}

impl ClusterOwner for ClusterHub {
    fn smap(&self) -> Arc<ClusterMap> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<ClusterMap>> {
        self.tx.subscribe()
    }
}
