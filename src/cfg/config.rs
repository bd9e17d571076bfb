// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{env, fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::wire::proto::{MAX_HDR_SIZE, MAX_SIZE_PDU};

/// Environment override for the send/completion queue capacity.
pub const ENV_BURST: &str = "STREAM_BURST_NUM";

/// Environment flag: frame-encode to a sink instead of HTTP (load testing).
pub const ENV_DRYRUN: &str = "OBJSTREAM_DRYRUN";

pub const DFLT_BURST: usize = 128;
pub const DFLT_TICK_UNIT: Duration = Duration::from_secs(1);
pub const DFLT_IDLE_TEARDOWN: Duration = Duration::from_secs(4);

/// Process-wide transport knobs, consumed once by `init()`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportConfig {
    #[serde(rename = "TickUnit", with = "serde_millis", default = "dflt_tick_unit")]
    /// Collector tick cadence; bounds idle-teardown latency.
    pub tick_unit: Duration,

    #[serde(rename = "Burst", default = "dflt_burst")]
    /// Capacity of per-stream send and completion queues.
    pub burst: usize,

    #[serde(rename = "DryRun", default)]
    /// Skip HTTP entirely; frames are encoded and discarded.
    pub dryrun: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            tick_unit: DFLT_TICK_UNIT,
            burst: DFLT_BURST,
            dryrun: false,
        }
    }
}

impl TransportConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: TransportConfig =
            serde_yaml::from_str(&s).context("failed to parse transport config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants, applies environment overrides.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        if let Ok(v) = env::var(ENV_BURST) {
            self.burst = v
                .parse()
                .with_context(|| format!("{ENV_BURST}={v} is not a number"))?;
        }
        if let Ok(v) = env::var(ENV_DRYRUN) {
            self.dryrun = matches!(v.as_str(), "1" | "true" | "yes");
        }

        ensure!(self.burst >= 1, "Burst must be >= 1");
        ensure!(
            self.tick_unit >= Duration::from_millis(10),
            "TickUnit must be >= 10ms"
        );
        Ok(())
    }
}

fn dflt_tick_unit() -> Duration {
    DFLT_TICK_UNIT
}

fn dflt_burst() -> usize {
    DFLT_BURST
}

/// Opaque wrapper over the wire body.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Never,
    Always,
}

/// Which peer URL a stream connects to.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Network {
    #[default]
    IntraData,
    IntraControl,
    Public,
}

/// Per-stream knobs; a bundle applies the same set to every stream it owns.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StreamArgs {
    #[serde(
        rename = "IdleTeardown",
        with = "serde_millis",
        default = "dflt_idle_teardown"
    )]
    /// Idle time before the collector posts an idle tick.
    pub idle_teardown: Duration,

    #[serde(rename = "SizePDU", default)]
    /// Non-zero enables PDU framing with this payload size.
    pub size_pdu: usize,

    #[serde(rename = "MaxHdrSize", default = "dflt_max_hdr")]
    /// Upper bound on a serialized object header.
    pub max_hdr_size: usize,

    #[serde(rename = "Compression", default)]
    pub compression: Compression,

    #[serde(rename = "Burst", default)]
    /// Per-stream override of the global queue capacity.
    pub burst: Option<usize>,
}

impl Default for StreamArgs {
    fn default() -> Self {
        StreamArgs {
            idle_teardown: DFLT_IDLE_TEARDOWN,
            size_pdu: 0,
            max_hdr_size: MAX_HDR_SIZE,
            compression: Compression::Never,
            burst: None,
        }
    }
}

impl StreamArgs {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.size_pdu <= MAX_SIZE_PDU,
            "SizePDU {} exceeds the {MAX_SIZE_PDU} cap",
            self.size_pdu
        );
        ensure!(
            self.max_hdr_size > 0 && self.max_hdr_size <= MAX_HDR_SIZE,
            "MaxHdrSize {} out of (0, {MAX_HDR_SIZE}]",
            self.max_hdr_size
        );
        if let Some(b) = self.burst {
            ensure!(b >= 1, "Burst override must be >= 1");
        }
        ensure!(
            self.idle_teardown >= Duration::from_millis(100),
            "IdleTeardown must be >= 100ms"
        );
        Ok(())
    }
}

fn dflt_idle_teardown() -> Duration {
    DFLT_IDLE_TEARDOWN
}

fn dflt_max_hdr() -> usize {
    MAX_HDR_SIZE
}

/// Serde helpers for representing `Duration` as milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
