// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use objstream_rs::{
    cfg::config::{Compression, StreamArgs},
    stream::{
        base::obj_stream_url,
        obj::{BytesReader, Obj, ObjSentCb, ObjStream},
    },
    wire::hdr::{ObjAttrs, ObjHdr},
};

use super::common::{self, CollectSink};

fn obj_with_payload(name: &str, data: Vec<u8>, cb: Option<ObjSentCb>) -> Obj {
    let hdr = ObjHdr {
        bucket: "ais://e2e".to_string(),
        obj_name: name.to_string(),
        attrs: ObjAttrs {
            size: data.len() as i64,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut obj = Obj::with_reader(hdr, Box::new(BytesReader::new(Bytes::from(data))));
    if let Some(cb) = cb {
        obj = obj.on_complete(cb);
    }
    obj
}

/// Ten 1-KiB objects over one stream: in-order delivery, exact bytes,
/// exactly one completion per send, matching rx-side counters.
#[tokio::test]
async fn ten_objects_in_order() -> Result<()> {
    common::ensure_init();

    let dispatcher = objstream_rs::recv::dispatch::Dispatcher::new();
    let sink = CollectSink::new();
    dispatcher.handle_obj_stream("e2e-basic", sink.clone())?;
    let (addr, _server) = common::serve(&dispatcher).await?;

    let url = obj_stream_url(&format!("http://{addr}"), "e2e-basic");
    let stream = ObjStream::new(
        common::client(),
        url,
        "t[src]",
        "t[dst]",
        "e2e-basic",
        StreamArgs::default(),
    )?;

    let completions = Arc::new(AtomicUsize::new(0));
    let cb_errs = Arc::new(Mutex::new(Vec::<String>::new()));
    for i in 0..10 {
        let completions = Arc::clone(&completions);
        let cb_errs = Arc::clone(&cb_errs);
        let cb: ObjSentCb = Arc::new(move |_hdr, _arg, err| {
            completions.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = err {
                cb_errs.lock().expect("errs").push(e.to_string());
            }
        });
        let data = common::payload(1024, i as u8);
        stream.send(obj_with_payload(&format!("obj-{i}"), data, Some(cb))).await?;
    }
    stream.fin().await;

    assert!(sink.wait_count(10, Duration::from_secs(5)).await);
    let got = sink.take();
    assert_eq!(got.len(), 10);
    let mut total = 0usize;
    for (i, (hdr, data)) in got.iter().enumerate() {
        assert_eq!(hdr.obj_name, format!("obj-{i}"), "delivery order");
        assert_eq!(hdr.attrs.size, 1024);
        assert_eq!(data, &common::payload(1024, i as u8));
        total += data.len();
    }
    assert_eq!(total, 10_240);

    // every send completed exactly once, with no error
    assert_eq!(completions.load(Ordering::SeqCst), 10);
    assert!(cb_errs.lock().expect("errs").is_empty());

    let snd = stream.stats();
    assert_eq!(snd.num, 10);
    assert_eq!(snd.size, 10_240);
    assert_eq!(snd.in_flight, 0);

    let sessions = dispatcher.get_stats("e2e-basic").expect("registered");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].sid, "t[src]");
    assert_eq!(sessions[0].num, 10);
    assert_eq!(sessions[0].size, 10_240);
    assert!(sessions[0].finished, "FIN must be observed");
    Ok(())
}

/// Header-only objects ride the stream with a nil reader.
#[tokio::test]
async fn header_only_objects() -> Result<()> {
    common::ensure_init();

    let dispatcher = objstream_rs::recv::dispatch::Dispatcher::new();
    let sink = CollectSink::new();
    dispatcher.handle_obj_stream("e2e-hdronly", sink.clone())?;
    let (addr, _server) = common::serve(&dispatcher).await?;

    let url = obj_stream_url(&format!("http://{addr}"), "e2e-hdronly");
    let stream = ObjStream::new(
        common::client(),
        url,
        "t[src]",
        "t[dst]",
        "e2e-hdronly",
        StreamArgs::default(),
    )?;

    for i in 0..3 {
        let hdr = ObjHdr {
            bucket: "ais://acks".to_string(),
            obj_name: format!("ack-{i}"),
            opaque: vec![i as u8; 8],
            ..Default::default()
        };
        stream.send(Obj::new(hdr)).await?;
    }
    stream.fin().await;

    assert!(sink.wait_count(3, Duration::from_secs(5)).await);
    for (i, (hdr, data)) in sink.take().iter().enumerate() {
        assert_eq!(hdr.obj_name, format!("ack-{i}"));
        assert!(hdr.is_header_only());
        assert!(data.is_empty());
        assert_eq!(hdr.opaque, vec![i as u8; 8]);
    }
    Ok(())
}

/// The opaque zstd wrapper must be invisible to the framing layer.
#[tokio::test]
async fn compressed_round_trip() -> Result<()> {
    common::ensure_init();

    let dispatcher = objstream_rs::recv::dispatch::Dispatcher::new();
    let sink = CollectSink::new();
    dispatcher.handle_obj_stream("e2e-zstd", sink.clone())?;
    let (addr, _server) = common::serve(&dispatcher).await?;

    let url = obj_stream_url(&format!("http://{addr}"), "e2e-zstd");
    let args = StreamArgs {
        compression: Compression::Always,
        ..Default::default()
    };
    let stream = ObjStream::new(common::client(), url, "t[src]", "t[dst]", "e2e-zstd", args)?;

    let data = common::payload(200 * 1024, 9);
    stream
        .send(obj_with_payload("blob", data.clone(), None))
        .await?;
    stream.fin().await;

    assert!(sink.wait_count(1, Duration::from_secs(5)).await);
    let got = sink.take();
    assert_eq!(got[0].0.obj_name, "blob");
    assert_eq!(got[0].1, data);
    Ok(())
}

/// `send()` after `fin()` fails fast and still fires the completion.
#[tokio::test]
async fn send_after_fin_is_rejected() -> Result<()> {
    common::ensure_init();

    let dispatcher = objstream_rs::recv::dispatch::Dispatcher::new();
    let sink = CollectSink::new();
    dispatcher.handle_obj_stream("e2e-postfin", sink.clone())?;
    let (addr, _server) = common::serve(&dispatcher).await?;

    let url = obj_stream_url(&format!("http://{addr}"), "e2e-postfin");
    let stream = ObjStream::new(
        common::client(),
        url,
        "t[src]",
        "t[dst]",
        "e2e-postfin",
        StreamArgs::default(),
    )?;

    stream
        .send(obj_with_payload("early", common::payload(128, 1), None))
        .await?;
    stream.fin().await;

    let completions = Arc::new(AtomicUsize::new(0));
    let got_err = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::clone(&completions);
    let e2 = Arc::clone(&got_err);
    let cb: ObjSentCb = Arc::new(move |_h, _a, err| {
        c2.fetch_add(1, Ordering::SeqCst);
        if err.is_some() {
            e2.fetch_add(1, Ordering::SeqCst);
        }
    });
    let res = stream
        .send(obj_with_payload("late", common::payload(128, 2), Some(cb)))
        .await;
    assert!(res.is_err(), "send after fin must fail");
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(got_err.load(Ordering::SeqCst), 1);
    Ok(())
}
