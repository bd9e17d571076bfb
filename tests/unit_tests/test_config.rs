// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use objstream_rs::{
    cfg::config::{
        Compression, DFLT_BURST, DFLT_IDLE_TEARDOWN, DFLT_TICK_UNIT, ENV_BURST, StreamArgs,
        TransportConfig,
    },
    wire::proto::{MAX_HDR_SIZE, MAX_SIZE_PDU},
};
use serial_test::serial;

#[test]
fn defaults_match_the_contract() {
    let cfg = TransportConfig::default();
    assert_eq!(cfg.burst, DFLT_BURST);
    assert_eq!(cfg.tick_unit, DFLT_TICK_UNIT);
    assert!(!cfg.dryrun);

    let args = StreamArgs::default();
    assert_eq!(args.idle_teardown, DFLT_IDLE_TEARDOWN);
    assert_eq!(args.size_pdu, 0);
    assert_eq!(args.max_hdr_size, MAX_HDR_SIZE);
    assert_eq!(args.compression, Compression::Never);
    assert!(args.burst.is_none());
}

#[test]
#[serial]
fn yaml_parse_and_validate() -> Result<()> {
    let yaml = r#"
TickUnit: 250
Burst: 64
"#;
    let mut cfg: TransportConfig = serde_yaml::from_str(yaml)?;
    cfg.validate_and_normalize()?;
    assert_eq!(cfg.tick_unit, Duration::from_millis(250));
    assert_eq!(cfg.burst, 64);
    Ok(())
}

#[test]
#[serial]
fn env_overrides_burst_and_dryrun() -> Result<()> {
    unsafe {
        std::env::set_var(ENV_BURST, "7");
        std::env::set_var("OBJSTREAM_DRYRUN", "true");
    }
    let mut cfg = TransportConfig::default();
    let res = cfg.validate_and_normalize();
    unsafe {
        std::env::remove_var(ENV_BURST);
        std::env::remove_var("OBJSTREAM_DRYRUN");
    }
    res?;
    assert_eq!(cfg.burst, 7);
    assert!(cfg.dryrun);
    Ok(())
}

#[test]
#[serial]
fn zero_burst_is_rejected() {
    let mut cfg = TransportConfig {
        burst: 0,
        ..Default::default()
    };
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn stream_args_bounds() {
    let mut args = StreamArgs {
        size_pdu: MAX_SIZE_PDU + 1,
        ..Default::default()
    };
    assert!(args.validate().is_err());

    args.size_pdu = MAX_SIZE_PDU;
    assert!(args.validate().is_ok());

    args.max_hdr_size = MAX_HDR_SIZE + 1;
    assert!(args.validate().is_err());
    args.max_hdr_size = MAX_HDR_SIZE;

    args.burst = Some(0);
    assert!(args.validate().is_err());
    args.burst = Some(4);

    args.idle_teardown = Duration::from_millis(10);
    assert!(args.validate().is_err());
}
