// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use objstream_rs::{
    cfg::config::StreamArgs,
    recv::dispatch::Dispatcher,
    stream::{
        base::{StreamState, obj_stream_url},
        obj::{BytesReader, Obj, ObjStream},
    },
    wire::hdr::{ObjAttrs, ObjHdr},
};
use serial_test::serial;

use super::common::{self, CollectSink};

fn sized_obj(name: &str, data: Vec<u8>) -> Obj {
    Obj::with_reader(
        ObjHdr {
            bucket: "ais://idle".to_string(),
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

/// An idle stream deactivates within `idle_teardown + tick_unit` (plus the
/// in-send grace tick) and the next send re-activates it under a fresh,
/// larger session id.
#[tokio::test]
#[serial]
async fn idle_stream_tears_down_and_resumes() -> Result<()> {
    common::ensure_init(); // tick_unit = 100ms

    let dispatcher = Dispatcher::new();
    let sink = CollectSink::new();
    dispatcher.handle_obj_stream("idle-x", sink.clone())?;
    let (addr, _server) = common::serve(&dispatcher).await?;

    let url = obj_stream_url(&format!("http://{addr}"), "idle-x");
    let args = StreamArgs {
        idle_teardown: Duration::from_millis(500),
        ..Default::default()
    };
    let stream = ObjStream::new(common::client(), url, "t[src]", "t[dst]", "idle-x", args)?;

    stream.send(sized_obj("one", common::payload(2048, 1))).await?;
    assert!(sink.wait_count(1, Duration::from_secs(5)).await);
    let first_sess = stream.session_id();
    assert!(first_sess > 0);
    assert_eq!(stream.state(), StreamState::Active);

    // idle long enough for: one grace tick (recent send) + the teardown
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    loop {
        if stream.state() == StreamState::Inactive {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stream never deactivated"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // one incarnation so far on the receive side, cleanly EOFed but not FINed
    let sessions = dispatcher.get_stats("idle-x").expect("registered");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].sess, first_sess);
    assert!(!sessions[0].finished);

    // the next send lazily re-issues the HTTP PUT under a new session id
    stream.send(sized_obj("two", common::payload(2048, 2))).await?;
    assert!(sink.wait_count(2, Duration::from_secs(5)).await);
    let second_sess = stream.session_id();
    assert!(
        second_sess > first_sess,
        "session id must increase across incarnations ({first_sess} -> {second_sess})"
    );
    assert_eq!(stream.state(), StreamState::Active);

    let sessions = dispatcher.get_stats("idle-x").expect("registered");
    assert_eq!(sessions.len(), 2, "two incarnations on the receiver");

    stream.fin().await;
    let snd = stream.stats();
    assert_eq!(snd.num, 2);
    assert_eq!(snd.size, 4096);
    Ok(())
}

/// A stream that keeps sending is never deactivated by the collector.
#[tokio::test]
#[serial]
async fn busy_stream_stays_active() -> Result<()> {
    common::ensure_init();

    let dispatcher = Dispatcher::new();
    let sink = CollectSink::new();
    dispatcher.handle_obj_stream("busy-x", sink.clone())?;
    let (addr, _server) = common::serve(&dispatcher).await?;

    let url = obj_stream_url(&format!("http://{addr}"), "busy-x");
    let args = StreamArgs {
        idle_teardown: Duration::from_millis(500),
        ..Default::default()
    };
    let stream = ObjStream::new(common::client(), url, "t[src]", "t[dst]", "busy-x", args)?;

    // keep the stream warm well past several teardown windows
    for i in 0..10u8 {
        stream.send(sized_obj(&format!("o{i}"), common::payload(512, i))).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stream.state(), StreamState::Active, "send #{i}");
    }
    let sess = stream.session_id();

    assert!(sink.wait_count(10, Duration::from_secs(5)).await);
    assert_eq!(stream.session_id(), sess, "no re-incarnation while busy");
    let sessions = dispatcher.get_stats("busy-x").expect("registered");
    assert_eq!(sessions.len(), 1);

    stream.fin().await;
    Ok(())
}
