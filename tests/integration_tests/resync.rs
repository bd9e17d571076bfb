// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use objstream_rs::{
    bundle::streams::{Bundle, BundleArgs},
    cluster::{ClusterHub, ClusterMap, ClusterOwner, Node, NodeKind},
    recv::dispatch::Dispatcher,
    stream::obj::{BytesReader, Obj},
    wire::hdr::{ObjAttrs, ObjHdr},
};

use super::common::{self, CollectSink};

fn target(id: &str, base: &str) -> Node {
    common::node(id, NodeKind::Target, base)
}

/// Membership goes {A,B,C} -> {A,C,D} (A is self): after resync the bundle
/// holds streams to {C,D} only, at the configured multiplier.
#[tokio::test]
async fn resync_follows_membership_diff() -> Result<()> {
    common::ensure_init();

    let d_c = Dispatcher::new();
    let sink_c = CollectSink::new();
    d_c.handle_obj_stream("resync-x", sink_c.clone())?;
    let (addr_c, _sc) = common::serve(&d_c).await?;

    let d_d = Dispatcher::new();
    let sink_d = CollectSink::new();
    d_d.handle_obj_stream("resync-x", sink_d.clone())?;
    let (addr_d, _sd) = common::serve(&d_d).await?;

    let local = Arc::new(target("A", ""));
    let hub = Arc::new(ClusterHub::new(ClusterMap::with_nodes(
        1,
        [
            target("A", ""),
            target("B", "http://127.0.0.1:9"),
            target("C", &format!("http://{addr_c}")),
        ],
    )));

    let mut args = BundleArgs::new("resync-x");
    args.multiplier = 2;
    args.auto_resync = false; // drive resync by hand for determinism
    let bundle = Bundle::new(
        common::client(),
        Arc::clone(&hub) as Arc<dyn ClusterOwner>,
        local,
        args,
    )
    .await?;

    assert_eq!(bundle.version(), 1);
    assert_eq!(bundle.peers(), vec!["B", "C"], "local node never joins");

    hub.publish(ClusterMap::with_nodes(
        2,
        [
            target("A", ""),
            target("C", &format!("http://{addr_c}")),
            target("D", &format!("http://{addr_d}")),
        ],
    ))?;
    bundle.resync().await?;

    assert_eq!(bundle.version(), 2);
    assert_eq!(bundle.peers(), vec!["C", "D"], "B dropped, D added");

    // a stale snapshot is a no-op
    bundle.resync().await?;
    assert_eq!(bundle.version(), 2);

    // both survivors are reachable through the new map
    let data = common::payload(1024, 4);
    let obj = Obj::with_reader(
        ObjHdr {
            bucket: "ais://rs".to_string(),
            obj_name: "after-resync".to_string(),
            attrs: ObjAttrs {
                size: data.len() as i64,
                ..Default::default()
            },
            ..Default::default()
        },
        Box::new(BytesReader::new(Bytes::from(data.clone()))),
    );
    bundle.send(obj, None).await?;
    assert!(sink_c.wait_count(1, Duration::from_secs(5)).await);
    assert!(sink_d.wait_count(1, Duration::from_secs(5)).await);
    assert_eq!(sink_c.take()[0].1, data);
    assert_eq!(sink_d.take()[0].1, data);

    bundle.close(true).await;
    Ok(())
}

/// With auto-resync on, publishing a new map is enough.
#[tokio::test]
async fn auto_resync_tracks_publishes() -> Result<()> {
    common::ensure_init();

    let d_b = Dispatcher::new();
    let sink_b = CollectSink::new();
    d_b.handle_obj_stream("resync-auto", sink_b.clone())?;
    let (addr_b, _sb) = common::serve(&d_b).await?;

    let local = Arc::new(target("A", ""));
    let hub = Arc::new(ClusterHub::new(ClusterMap::with_nodes(1, [target("A", "")])));

    let bundle = Bundle::new(
        common::client(),
        Arc::clone(&hub) as Arc<dyn ClusterOwner>,
        local,
        BundleArgs::new("resync-auto"),
    )
    .await?;
    assert!(bundle.peers().is_empty());

    hub.publish(ClusterMap::with_nodes(
        2,
        [target("A", ""), target("B", &format!("http://{addr_b}"))],
    ))?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bundle.version() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "auto resync too slow");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(bundle.peers(), vec!["B"]);

    bundle.close(true).await;
    Ok(())
}

/// Peers in maintenance mode past their rebalance are not wired in.
#[tokio::test]
async fn maintenance_peers_are_skipped() -> Result<()> {
    common::ensure_init();

    let local = Arc::new(target("A", ""));
    let mut mnt = target("M", "http://127.0.0.1:9");
    mnt.in_maintenance = true;
    mnt.post_rebalance = true;

    let hub = Arc::new(ClusterHub::new(ClusterMap::with_nodes(
        1,
        [target("A", ""), target("B", "http://127.0.0.1:9"), mnt],
    )));

    let mut args = BundleArgs::new("resync-mnt");
    args.auto_resync = false;
    let bundle = Bundle::new(
        common::client(),
        hub as Arc<dyn ClusterOwner>,
        local,
        args,
    )
    .await?;
    assert_eq!(bundle.peers(), vec!["B"]);

    bundle.close(false).await;
    Ok(())
}
