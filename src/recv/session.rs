// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde::Serialize;

/// Live receive counters for one sender incarnation.
#[derive(Debug, Default)]
pub struct RxSession {
    pub sid: String,
    pub sess: u64,
    /// Objects (or messages) delivered to the user callback.
    pub num: AtomicU64,
    /// Payload bytes consumed by the user callback.
    pub size: AtomicU64,
    /// Total wire bytes accounted for this session.
    pub offset: AtomicU64,
    /// Sender emitted FIN for this incarnation.
    pub finished: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RxSessionSnapshot {
    pub sid: String,
    pub sess: u64,
    pub num: u64,
    pub size: u64,
    pub offset: u64,
    pub finished: bool,
}

/// Per-endpoint table of sender sessions, keyed by `sid` + session id.
#[derive(Default)]
pub(crate) struct SessionTable {
    map: DashMap<String, Arc<RxSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable::default()
    }

    pub fn touch(&self, sid: &str, sess: u64) -> Arc<RxSession> {
        let key = format!("{sid}#{sess}");
        self.map
            .entry(key)
            .or_insert_with(|| {
                Arc::new(RxSession {
                    sid: sid.to_string(),
                    sess,
                    ..Default::default()
                })
            })
            .clone()
    }

    pub fn snapshot(&self) -> Vec<RxSessionSnapshot> {
        let mut out: Vec<RxSessionSnapshot> = self
            .map
            .iter()
            .map(|e| {
                let s = e.value();
                RxSessionSnapshot {
                    sid: s.sid.clone(),
                    sess: s.sess,
                    num: s.num.load(Ordering::Relaxed),
                    size: s.size.load(Ordering::Relaxed),
                    offset: s.offset.load(Ordering::Relaxed),
                    finished: s.finished.load(Ordering::Relaxed),
                }
            })
            .collect();
        out.sort_by_key(|s| s.sess);
        out
    }
}
