// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use objstream_rs::{
    bundle::dm::{DataMover, DataMoverArgs, QuiRes, Task, ack_trname},
    cluster::{ClusterHub, ClusterMap, ClusterOwner, NodeKind},
    recv::dispatch::Dispatcher,
    stream::obj::{BytesReader, Obj},
    wire::hdr::{ObjAttrs, ObjHdr},
};

use super::common::{self, CollectSink};

#[derive(Default)]
struct TestTask {
    aborted: AtomicBool,
    out_objs: AtomicU64,
    out_bytes: AtomicU64,
    in_objs: AtomicU64,
    in_bytes: AtomicU64,
}

impl Task for TestTask {
    fn id(&self) -> &str {
        "test-rebalance-g42"
    }

    fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn add_out_objs(&self, n: u64) {
        self.out_objs.fetch_add(n, Ordering::Relaxed);
    }

    fn add_out_bytes(&self, n: u64) {
        self.out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn add_in_objs(&self, n: u64) {
        self.in_objs.fetch_add(n, Ordering::Relaxed);
    }

    fn add_in_bytes(&self, n: u64) {
        self.in_bytes.fetch_add(n, Ordering::Relaxed);
    }
}

fn sized_obj(name: &str, data: Vec<u8>) -> Obj {
    Obj::with_reader(
        ObjHdr {
            bucket: "ais://dm".to_string(),
            obj_name: name.to_string(),
            attrs: ObjAttrs {
                size: data.len() as i64,
                ..Default::default()
            },
            ..Default::default()
        },
        Box::new(BytesReader::new(Bytes::from(data))),
    )
}

/// Full data-mover lifecycle over loopback: reg -> open -> send/ack ->
/// quiesce -> close -> unreg, with task stats fed on both directions.
#[tokio::test]
async fn datamover_lifecycle() -> Result<()> {
    common::ensure_init();

    let dispatcher = Dispatcher::new();
    let (addr, _server) = common::serve(&dispatcher).await?;

    let local = Arc::new(common::node("A", NodeKind::Target, ""));
    let node_b = Arc::new(common::node(
        "B",
        NodeKind::Target,
        &format!("http://{addr}"),
    ));
    let hub: Arc<dyn ClusterOwner> = Arc::new(ClusterHub::new(ClusterMap::with_nodes(
        1,
        [
            common::node("A", NodeKind::Target, ""),
            common::node("B", NodeKind::Target, &format!("http://{addr}")),
        ],
    )));
    let task = Arc::new(TestTask::default());

    let mut args = DataMoverArgs::new("dm-x");
    args.with_ack = true;
    let dm = DataMover::new(
        common::client(),
        hub,
        local,
        dispatcher.clone(),
        Arc::clone(&task) as Arc<dyn Task>,
        args,
    )?;

    // send before open must fail fast
    let early = dm.send(sized_obj("early", common::payload(64, 0)), None).await;
    assert!(early.is_err());

    let data_sink = CollectSink::new();
    let ack_sink = CollectSink::new();
    dm.reg_recv(data_sink.clone(), Some(ack_sink.clone()))?;
    dm.open().await?;
    assert!(dm.opened());

    for i in 0..3u8 {
        dm.send(sized_obj(&format!("obj-{i}"), common::payload(2048, i)), None)
            .await?;
    }
    assert!(data_sink.wait_count(3, Duration::from_secs(5)).await);
    for (i, (hdr, data)) in data_sink.take().iter().enumerate() {
        assert_eq!(hdr.obj_name, format!("obj-{i}"));
        assert_eq!(data, &common::payload(2048, i as u8));
    }
    assert_eq!(task.out_objs.load(Ordering::Relaxed), 3);
    assert_eq!(task.out_bytes.load(Ordering::Relaxed), 3 * 2048);

    // header-only ACK rides the dedicated ack bundle
    let ack_hdr = ObjHdr {
        bucket: "ais://dm".to_string(),
        obj_name: "obj-0".to_string(),
        opaque: b"done".to_vec(),
        ..Default::default()
    };
    dm.ack(ack_hdr, Arc::clone(&node_b)).await?;
    assert!(ack_sink.wait_count(1, Duration::from_secs(5)).await);
    let acks = ack_sink.take();
    assert_eq!(acks[0].0.obj_name, "obj-0");
    assert_eq!(acks[0].0.opaque, b"done");
    assert!(acks[0].1.is_empty());

    // receive hooks fed the task's in-stats (3 data + 1 ack)
    assert_eq!(task.in_objs.load(Ordering::Relaxed), 4);
    assert_eq!(task.in_bytes.load(Ordering::Relaxed), 3 * 2048);

    // no more traffic: quiesce reports quiescent
    let q = dm.quiesce(Duration::from_millis(300), Duration::from_secs(5)).await;
    assert_eq!(q, QuiRes::Quiescent);

    dm.close(None).await;
    assert!(!dm.opened());

    dm.unreg_recv(Duration::from_millis(200)).await;
    assert!(dispatcher.get_stats("dm-x").is_none(), "unhandled after unreg");
    assert!(dispatcher.get_stats(&ack_trname("dm-x")).is_none());
    Ok(())
}

/// An aborted parent task short-circuits quiescence.
#[tokio::test]
async fn quiesce_observes_abort() -> Result<()> {
    common::ensure_init();

    let dispatcher = Dispatcher::new();
    let (addr, _server) = common::serve(&dispatcher).await?;

    let local = Arc::new(common::node("A", NodeKind::Target, ""));
    let hub: Arc<dyn ClusterOwner> = Arc::new(ClusterHub::new(ClusterMap::with_nodes(
        1,
        [
            common::node("A", NodeKind::Target, ""),
            common::node("B", NodeKind::Target, &format!("http://{addr}")),
        ],
    )));
    let task = Arc::new(TestTask::default());

    let dm = DataMover::new(
        common::client(),
        hub,
        local,
        dispatcher.clone(),
        Arc::clone(&task) as Arc<dyn Task>,
        DataMoverArgs::new("dm-abort"),
    )?;
    let sink = CollectSink::new();
    dm.reg_recv(sink, None)?;
    dm.open().await?;

    task.aborted.store(true, Ordering::Release);
    let q = dm.quiesce(Duration::from_secs(1), Duration::from_secs(10)).await;
    assert_eq!(q, QuiRes::Aborted);

    dm.close(Some(&objstream_rs::errors::TransportError::Wire(
        "aborted".to_string(),
    )))
    .await;
    dm.unreg_recv(Duration::from_millis(200)).await;
    Ok(())
}
