// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use objstream_rs::wire::compress::{BodyCompressor, BodyDecompressor};
use rand::RngExt;

fn random_payload(n: usize) -> Vec<u8> {
    let mut v = vec![0u8; n];
    rand::rng().fill(&mut v[..]);
    v
}

#[test]
fn chunked_round_trip() -> Result<()> {
    let payload = random_payload(256 * 1024);

    let mut enc = BodyCompressor::new()?;
    let mut compressed = Vec::new();
    for chunk in payload.chunks(7 * 1024) {
        compressed.extend_from_slice(&enc.push(chunk)?);
    }
    compressed.extend_from_slice(&enc.finish()?);
    assert!(!compressed.is_empty());

    // Feed the decoder at boundaries unrelated to the encoder's.
    let mut dec = BodyDecompressor::new()?;
    let mut plain = Vec::new();
    for chunk in compressed.chunks(1000) {
        plain.extend_from_slice(&dec.push(chunk)?);
    }
    plain.extend_from_slice(&dec.finish()?);

    assert_eq!(plain, payload);
    Ok(())
}

#[test]
fn compressible_data_shrinks() -> Result<()> {
    let payload = vec![0x42u8; 512 * 1024];

    let mut enc = BodyCompressor::new()?;
    let mut compressed = Vec::new();
    compressed.extend_from_slice(&enc.push(&payload)?);
    compressed.extend_from_slice(&enc.finish()?);
    assert!(compressed.len() < payload.len() / 10);

    let mut dec = BodyDecompressor::new()?;
    let mut plain = Vec::new();
    plain.extend_from_slice(&dec.push(&compressed)?);
    plain.extend_from_slice(&dec.finish()?);
    assert_eq!(plain, payload);
    Ok(())
}

#[test]
fn empty_stream_round_trips() -> Result<()> {
    let enc = BodyCompressor::new()?;
    let compressed = enc.finish()?;

    let mut dec = BodyDecompressor::new()?;
    let mut plain = Vec::new();
    plain.extend_from_slice(&dec.push(&compressed)?);
    plain.extend_from_slice(&dec.finish()?);
    assert!(plain.is_empty());
    Ok(())
}
